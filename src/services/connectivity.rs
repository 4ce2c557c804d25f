//! Explicit online/offline state owned by the sync coordinator.

use tokio::sync::watch;
use tracing::info;

/// Network reachability as reported by the host environment.
pub struct Connectivity {
    online: watch::Sender<bool>,
}

impl Connectivity {
    /// Start in the given state.
    pub fn new(online: bool) -> Self {
        let (online, _rx) = watch::channel(online);
        Self { online }
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a transition. Returns `true` when the device just came back online.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.send_replace(online);
        if previous != online {
            info!(online, "connectivity changed");
        }
        online && !previous
    }

    /// Watch transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_offline_to_online_counts_as_restored() {
        let connectivity = Connectivity::new(true);
        assert!(!connectivity.set_online(true));
        assert!(!connectivity.set_online(false));
        assert!(!connectivity.is_online());
        assert!(connectivity.set_online(true));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();
        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
