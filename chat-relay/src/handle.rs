//! Outbound side of a participant's stream.
//!
//! A [`StreamHandle`] never touches the socket itself. It pushes into a
//! bounded queue that a single writer task ([`write_outbound`]) drains, so any
//! number of sender tasks can deliver to the same participant while writes to
//! the socket stay serialized and in queue order.

use std::{fmt, io, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tracing::debug;

use crate::message::{ChatMessage, write_message};

/// Process-unique id of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound stream is closed")]
    Closed,
}

pub type Outbox = mpsc::Receiver<Arc<ChatMessage>>;

#[derive(Debug, Clone)]
pub struct StreamHandle {
    session: SessionId,
    outbound: mpsc::Sender<Arc<ChatMessage>>,
    eviction: Arc<watch::Sender<bool>>,
}

impl StreamHandle {
    /// Creates a handle and the queue its writer task drains.
    pub fn channel(session: SessionId, capacity: usize) -> (Self, Outbox) {
        let (outbound, outbox) = mpsc::channel(capacity.max(1));
        let (eviction, _) = watch::channel(false);
        let handle = Self {
            session,
            outbound,
            eviction: Arc::new(eviction),
        };
        (handle, outbox)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queues `message` without waiting for the peer.
    pub fn send(&self, message: Arc<ChatMessage>) -> Result<(), SendError> {
        self.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Tells the owning session to end.
    pub fn evict(&self) {
        self.eviction.send_replace(true);
    }

    /// Resolves to `true` once [`evict`](Self::evict) has been called on any
    /// clone of this handle.
    pub fn eviction_signal(&self) -> watch::Receiver<bool> {
        self.eviction.subscribe()
    }
}

/// Drains `outbox` into `writer` until every handle is dropped, then shuts the
/// writer down. A failed write ends the task and closes the queue.
pub async fn write_outbound<W>(mut outbox: Outbox, mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        if let Err(err) = write_message(&mut writer, message.as_ref()).await {
            debug!(?err, "failed to write outbound message");
            return Err(err);
        }
    }

    writer.shutdown().await
}
