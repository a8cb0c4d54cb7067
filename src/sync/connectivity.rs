//! Shared online/offline flag.
//!
//! The host platform reports connectivity changes through `set_online`; the
//! engine reads the current value and the scheduler subscribes to edges.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Returns `true` when this call was an
    /// offline → online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut regained = false;
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            regained = online;
            *current = online;
            true
        });
        if regained {
            tracing::debug!("connectivity regained");
        }
        regained
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .finish()
    }
}
