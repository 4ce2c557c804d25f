/// Game aggregate and its match operations.
pub mod game;
/// Phase sequencing and clock arithmetic.
pub mod state_machine;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tracing::info;

use crate::{
    clock::Clock,
    config::SyncConfig,
    dao::{remote::RemoteStore, storage::StorageError},
    error::SyncError,
    services::live_view::LiveViewSubscriber,
};

/// Cheaply cloneable handle to [`AppState`].
pub type SharedState = Arc<AppState>;

/// Shared state of the spectator relay: the remote store handle and the degraded flag.
pub struct AppState {
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    degraded: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The relay starts in degraded mode until a remote store is installed.
    pub fn new(clock: Arc<dyn Clock>, config: SyncConfig) -> SharedState {
        let (degraded, _rx) = watch::channel(true);
        Arc::new(Self {
            remote: RwLock::new(None),
            degraded,
            clock,
            config,
        })
    }

    /// Current remote store, if one is installed.
    pub async fn remote_store(&self) -> Option<Arc<dyn RemoteStore>> {
        self.remote.read().await.as_ref().cloned()
    }

    /// Current remote store, or `RemoteUnavailable` while degraded.
    pub async fn require_remote_store(&self) -> Result<Arc<dyn RemoteStore>, SyncError> {
        self.remote_store()
            .await
            .ok_or(SyncError::RemoteUnavailable(StorageError::Offline))
    }

    /// Install a remote store and leave degraded mode.
    pub async fn install_remote_store(&self, store: Arc<dyn RemoteStore>) {
        *self.remote.write().await = Some(store);
        self.update_degraded(false);
    }

    /// Drop the remote store and enter degraded mode.
    pub async fn clear_remote_store(&self) {
        self.remote.write().await.take();
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Wall clock used for remaining-time projections.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Live view factory over the installed remote store.
    pub async fn live_views(&self) -> Result<LiveViewSubscriber, SyncError> {
        let remote = self.require_remote_store().await?;
        Ok(LiveViewSubscriber::new(
            remote,
            self.clock.clone(),
            self.config.clone(),
        ))
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub(crate) fn update_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if changed {
            info!(degraded = value, "degraded mode changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::MemoryIdentityProvider, clock::ManualClock, dao::remote::memory::MemoryRemoteStore,
    };

    #[tokio::test]
    async fn installing_a_store_leaves_degraded_mode() {
        let clock = Arc::new(ManualClock::new(0));
        let state = AppState::new(clock.clone(), SyncConfig::default());
        let mut watcher = state.degraded_watcher();
        assert!(state.is_degraded());
        assert!(state.live_views().await.is_err());

        let remote = MemoryRemoteStore::new(Arc::new(MemoryIdentityProvider::new()), clock);
        state.install_remote_store(Arc::new(remote)).await;
        watcher.changed().await.unwrap();
        assert!(!*watcher.borrow_and_update());
        assert!(state.require_remote_store().await.is_ok());

        state.clear_remote_store().await;
        assert!(state.is_degraded());
    }
}
