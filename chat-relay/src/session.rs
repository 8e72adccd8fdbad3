//! Per-connection receive loop.
//!
//! A session starts without an identity. The sender field of the first
//! message it receives becomes its routing key in the [`Registry`]; from then
//! on every inbound message is handed to the [`Dispatcher`] as declared.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::{io::AsyncBufRead, select, sync::watch};
use tracing::{debug, info};

use crate::{
    dispatcher::Dispatcher,
    handle::{SessionId, StreamHandle},
    message::{ChatMessage, read_message},
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFirstMessage,
    Active,
    Terminated,
}

/// Owns one connection's [`StreamHandle`] for as long as it runs. The
/// registry only holds a clone, so removing an entry never closes the stream.
pub struct Session<R> {
    reader: R,
    id: SessionId,
    handle: Option<StreamHandle>,
    evicted: watch::Receiver<bool>,
    identity: Option<String>,
    phase: Phase,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        reader: R,
        handle: StreamHandle,
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            reader,
            id: handle.session(),
            evicted: handle.eviction_signal(),
            handle: Some(handle),
            identity: None,
            phase: Phase::AwaitingFirstMessage,
            registry,
            dispatcher,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Receives until end of stream, eviction, or the first error, then
    /// leaves the registry and drops the stream handle. End of stream and
    /// eviction are `Ok`; anything else is reported, never retried.
    pub async fn run(&mut self) -> Result<()> {
        let outcome = self.receive_loop().await;
        self.terminate().await;
        outcome
    }

    async fn receive_loop(&mut self) -> Result<()> {
        loop {
            let received = select! {
                received = read_message::<_, ChatMessage>(&mut self.reader) => received,
                Ok(_) = self.evicted.wait_for(|evicted| *evicted) => {
                    info!(session = %self.id, "session evicted");
                    return Ok(());
                }
            };
            let Some(message) = received.context("failed to receive from participant")? else {
                return Ok(());
            };

            if self.phase == Phase::AwaitingFirstMessage {
                self.bind(&message.sender).await?;
            }

            debug!(session = %self.id, sender = %message.sender, "forwarding message");
            self.dispatcher.deliver(message).await;
        }
    }

    async fn bind(&mut self, identity: &str) -> Result<()> {
        if identity.trim().is_empty() {
            bail!("first message must carry a non-empty sender");
        }
        let Some(handle) = self.handle.clone() else {
            bail!("session {} has no stream handle to register", self.id);
        };

        if let Some(displaced) = self.registry.register(identity, handle).await? {
            info!(
                identity,
                session = %self.id,
                displaced = %displaced.session(),
                "identity taken over by newer session"
            );
        }

        let participants = self.registry.len().await;
        info!(identity, session = %self.id, participants, "participant joined");
        self.identity = Some(identity.to_string());
        self.phase = Phase::Active;
        Ok(())
    }

    async fn terminate(&mut self) {
        self.phase = Phase::Terminated;
        self.handle = None;

        if let Some(identity) = self.identity.as_deref() {
            let released = self.registry.release(identity, self.id).await;
            let participants = self.registry.len().await;
            info!(identity, session = %self.id, released, participants, "participant left");
        }
    }
}
