use std::sync::Arc;

use shared::domain::UserId;
use tokio::sync::watch;

/// The resolved current identity. Collaborators (wallet, delegation) push
/// changes here; the engine re-scopes on every change.
#[derive(Clone)]
pub struct IdentitySource {
    tx: Arc<watch::Sender<Option<UserId>>>,
}

impl IdentitySource {
    pub fn new(initial: Option<UserId>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    /// Returns whether the identity actually changed.
    pub fn set(&self, next: Option<UserId>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.tx.subscribe()
    }
}

impl Default for IdentitySource {
    fn default() -> Self {
        Self::new(None)
    }
}
