use std::sync::Arc;

use tracing::{debug, warn};

use crate::{handle::StreamHandle, message::ChatMessage, registry::Registry};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// Fans a message out to every registered participant except its sender.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    evict_failed: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, evict_failed: bool) -> Self {
        Self {
            registry,
            evict_failed,
        }
    }

    pub async fn deliver(&self, message: ChatMessage) -> DeliveryReport {
        let targets = self.registry.broadcast_targets(&message.sender).await;
        let message = Arc::new(message);
        let mut report = DeliveryReport::default();

        for (identity, handle) in targets {
            match handle.send(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        %identity,
                        session = %handle.session(),
                        %error,
                        "failed to deliver message"
                    );
                    if self.evict_failed && self.evict(&identity, &handle).await {
                        report.evicted += 1;
                    }
                }
            }
        }

        debug!(
            sender = %message.sender,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }

    async fn evict(&self, identity: &str, handle: &StreamHandle) -> bool {
        let evicted = self.registry.release(identity, handle.session()).await;
        if evicted {
            handle.evict();
            warn!(%identity, session = %handle.session(), "evicted unresponsive participant");
        }
        evicted
    }
}
