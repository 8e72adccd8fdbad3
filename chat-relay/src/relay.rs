use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::Dispatcher,
    handle::{StreamHandle, write_outbound},
    registry::{CollisionPolicy, Registry},
    session::Session,
};

/// Outbound messages a recipient may have queued before it counts as slow.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub outbound_capacity: usize,
    pub collision_policy: CollisionPolicy,
    /// Drop a recipient from the registry as soon as a send to it fails.
    pub evict_failed_recipients: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            collision_policy: CollisionPolicy::Replace,
            evict_failed_recipients: true,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    outbound_capacity: usize,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new(config.collision_policy));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.evict_failed_recipients);
        Self {
            listener,
            state: Arc::new(RelayState {
                registry,
                dispatcher,
                outbound_capacity: config.outbound_capacity,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared view of who is currently connected.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until `shutdown` resolves. Sessions already running
    /// are not drained.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, peer, &state).await {
            warn!(peer = %peer, error = ?err, "session ended with error");
        }
    });
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: &RelayState) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let session_id = state.registry.next_session_id();
    let (handle, outbox) = StreamHandle::channel(session_id, state.outbound_capacity);
    debug!(%peer, session = %session_id, "connection accepted");

    tokio::spawn(async move {
        if let Err(err) = write_outbound(outbox, writer).await {
            debug!(%peer, session = %session_id, ?err, "outbound stream closed with error");
        }
    });

    let mut session = Session::new(
        BufReader::new(reader),
        handle,
        Arc::clone(&state.registry),
        state.dispatcher.clone(),
    );
    session.run().await
}
