//! Connection registry: participant identity to outbound [`StreamHandle`].
//!
//! Every operation takes the one registry lock only for the map access
//! itself. Snapshots are copied out so delivery never runs under the lock.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;

use crate::handle::{SessionId, StreamHandle};

/// What `register` does when the identity is already mapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CollisionPolicy {
    /// Last writer wins; the earlier handle is handed back to the caller.
    #[default]
    Replace,
    /// Keep the existing mapping and refuse the newcomer.
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("identity '{0}' is already in use")]
    IdentityTaken(String),
}

pub struct Registry {
    clients: Mutex<HashMap<String, StreamHandle>>,
    policy: CollisionPolicy,
    next_session: AtomicU64,
}

impl Registry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            policy,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Maps `identity` to `handle`.
    ///
    /// Under [`CollisionPolicy::Replace`] a previous handle for the same
    /// identity is returned, not closed; dropping it is up to the caller.
    pub async fn register(
        &self,
        identity: &str,
        handle: StreamHandle,
    ) -> Result<Option<StreamHandle>, RegisterError> {
        let mut clients = self.clients.lock().await;

        if self.policy == CollisionPolicy::Reject && clients.contains_key(identity) {
            return Err(RegisterError::IdentityTaken(identity.to_string()));
        }

        Ok(clients.insert(identity.to_string(), handle))
    }

    /// Removes whatever is mapped under `identity`. No-op when absent.
    pub async fn unregister(&self, identity: &str) -> Option<StreamHandle> {
        let mut clients = self.clients.lock().await;
        clients.remove(identity)
    }

    /// Removes `identity` only if it still belongs to `session`.
    ///
    /// A session that was displaced by a newer registration must not remove
    /// its successor's mapping when it ends.
    pub async fn release(&self, identity: &str, session: SessionId) -> bool {
        let mut clients = self.clients.lock().await;
        match clients.get(identity) {
            Some(handle) if handle.session() == session => {
                clients.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Copies out every registered handle except the one under `excluding`.
    pub async fn broadcast_targets(&self, excluding: &str) -> Vec<(String, StreamHandle)> {
        let clients = self.clients.lock().await;
        clients
            .iter()
            .filter(|(identity, _)| identity.as_str() != excluding)
            .map(|(identity, handle)| (identity.clone(), handle.clone()))
            .collect()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.clients.lock().await.contains_key(identity)
    }

    pub async fn session_of(&self, identity: &str) -> Option<SessionId> {
        self.clients
            .lock()
            .await
            .get(identity)
            .map(StreamHandle::session)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Registered identities, sorted.
    pub async fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        identities.sort();
        identities
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CollisionPolicy::default())
    }
}
