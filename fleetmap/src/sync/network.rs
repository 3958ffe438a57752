//! Online/offline state.

use tokio::sync::watch;
use tracing::info;

/// Connectivity flag shared between the host and the sync queue.
///
/// The host reports transitions with [`set_online`](Self::set_online);
/// listeners wake on [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct NetworkState {
    tx: watch::Sender<bool>,
}

impl NetworkState {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns true when the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}
