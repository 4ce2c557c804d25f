use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{remote::RemoteStore, storage::StorageError},
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Connect to the remote store and keep the relay in degraded mode while it is unreachable.
///
/// A failed health check first re-enables the store's network access a few times with backoff;
/// when that does not help, the store is dropped and a fresh connection is attempted.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn RemoteStore>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(store) => {
                state.install_remote_store(store.clone()).await;
                info!("remote store connected; leaving degraded mode");
                delay = INITIAL_DELAY;

                if !supervise(&state, store.as_ref()).await {
                    warn!("exhausted remote reconnect attempts; reconnecting from scratch");
                    state.clear_remote_store().await;
                }

                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "remote store connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll `store` until it cannot be revived. Returns `false` once reconnects are exhausted.
async fn supervise(state: &SharedState, store: &dyn RemoteStore) -> bool {
    loop {
        match store.health_check().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("remote store healthy again; leaving degraded mode");
                    state.update_degraded(false);
                }
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                warn!(error = %err, "remote store health check failed");
                if !reconnect(state, store).await {
                    return false;
                }
                state.update_degraded(false);
                sleep(HEALTH_POLL_INTERVAL).await;
            }
        }
    }
}

async fn reconnect(state: &SharedState, store: &dyn RemoteStore) -> bool {
    let mut reconnect_delay = INITIAL_DELAY;
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        let revived = match store.enable_network().await {
            Ok(()) => store.health_check().await,
            Err(err) => Err(err),
        };
        match revived {
            Ok(()) => {
                info!(attempt, "remote store reconnection succeeded");
                return true;
            }
            Err(err) => {
                if attempt == 0 {
                    warn!(
                        attempt, error = %err,
                        "remote reconnect first attempt failed; entering degraded mode"
                    );
                    state.update_degraded(true);
                } else {
                    warn!(attempt, error = %err, "remote reconnect attempt failed");
                }
                sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        auth::MemoryIdentityProvider, clock::ManualClock, config::SyncConfig,
        dao::remote::memory::MemoryRemoteStore, state::AppState,
    };

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_store_connects() {
        let clock = Arc::new(ManualClock::new(0));
        let state = AppState::new(clock.clone(), SyncConfig::default());
        let remote = MemoryRemoteStore::new(Arc::new(MemoryIdentityProvider::new()), clock);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let supervisor = tokio::spawn(run(state.clone(), move || {
            let remote = remote.clone();
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StorageError::Offline)
                } else {
                    Ok(Arc::new(remote) as Arc<dyn RemoteStore>)
                }
            }
        }));

        sleep(Duration::from_millis(500)).await;
        assert!(state.is_degraded());

        sleep(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!state.is_degraded());
        supervisor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn revives_a_store_that_went_offline() {
        let clock = Arc::new(ManualClock::new(0));
        let state = AppState::new(clock.clone(), SyncConfig::default());
        let remote = MemoryRemoteStore::new(Arc::new(MemoryIdentityProvider::new()), clock);
        let handle = remote.clone();

        let supervisor = tokio::spawn(run(state.clone(), move || {
            let remote = remote.clone();
            async move { Ok(Arc::new(remote) as Arc<dyn RemoteStore>) }
        }));
        sleep(Duration::from_millis(10)).await;
        assert!(!state.is_degraded());

        handle.disable_network().await.unwrap();
        sleep(HEALTH_POLL_INTERVAL * 2).await;
        assert!(handle.health_check().await.is_ok());
        assert!(!state.is_degraded());
        supervisor.abort();
    }
}
