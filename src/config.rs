//! Sync and clock tuning, loaded from JSON with built-in defaults.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the configuration is looked up.
const DEFAULT_CONFIG_PATH: &str = "config/sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "NETBALL_SYNC_CONFIG_PATH";

/// Immutable runtime configuration shared by the sync layer and the match clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiescence window after the last local mutation before a batched remote write.
    pub debounce_ms: u64,
    /// Period of the background push while a remote-backed game is open.
    pub resync_interval_ms: u64,
    /// Age of `lastSyncedAt` after which a load checks the remote copy.
    pub staleness_ms: u64,
    /// Overrun tolerated before a non-final phase is advanced automatically.
    pub advance_grace_ms: u64,
    /// Local polling period for hybrid games viewed without a remote subscription.
    pub hybrid_poll_ms: u64,
    /// Local polling period for device-only games.
    pub local_poll_ms: u64,
    /// Period at which an open game checks its clock for automatic phase changes.
    pub clock_poll_ms: u64,
    /// Delay before a registered user's mutation is mirrored remotely.
    pub registered_mirror_delay_ms: u64,
    /// Summary list cap for guest games.
    pub guest_list_cap: usize,
    /// Summary list cap for hybrid games.
    pub hybrid_list_cap: usize,
    /// Summary list cap for registered users' local games.
    pub local_list_cap: usize,
    /// Maximum number of pending remote mutations.
    pub sync_queue_cap: usize,
}

impl SyncConfig {
    /// Load the configuration from disk, falling back to the built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded sync configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Background resync period as a [`Duration`].
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms.max(1))
    }

    /// Clock polling period as a [`Duration`].
    pub fn clock_poll(&self) -> Duration {
        Duration::from_millis(self.clock_poll_ms.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            resync_interval_ms: 30_000,
            staleness_ms: 30_000,
            advance_grace_ms: 5_000,
            hybrid_poll_ms: 500,
            local_poll_ms: 1_000,
            clock_poll_ms: 250,
            registered_mirror_delay_ms: 0,
            guest_list_cap: 50,
            hybrid_list_cap: 50,
            local_list_cap: 100,
            sync_queue_cap: 100,
        }
    }
}

/// JSON representation of the configuration file; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    debounce_ms: Option<u64>,
    resync_interval_ms: Option<u64>,
    staleness_ms: Option<u64>,
    advance_grace_ms: Option<u64>,
    hybrid_poll_ms: Option<u64>,
    local_poll_ms: Option<u64>,
    clock_poll_ms: Option<u64>,
    registered_mirror_delay_ms: Option<u64>,
    guest_list_cap: Option<usize>,
    hybrid_list_cap: Option<usize>,
    local_list_cap: Option<usize>,
    sync_queue_cap: Option<usize>,
}

impl From<RawConfig> for SyncConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = SyncConfig::default();
        Self {
            debounce_ms: raw.debounce_ms.unwrap_or(defaults.debounce_ms),
            resync_interval_ms: raw.resync_interval_ms.unwrap_or(defaults.resync_interval_ms),
            staleness_ms: raw.staleness_ms.unwrap_or(defaults.staleness_ms),
            advance_grace_ms: raw.advance_grace_ms.unwrap_or(defaults.advance_grace_ms),
            hybrid_poll_ms: raw.hybrid_poll_ms.unwrap_or(defaults.hybrid_poll_ms),
            local_poll_ms: raw.local_poll_ms.unwrap_or(defaults.local_poll_ms),
            clock_poll_ms: raw.clock_poll_ms.unwrap_or(defaults.clock_poll_ms),
            registered_mirror_delay_ms: raw
                .registered_mirror_delay_ms
                .unwrap_or(defaults.registered_mirror_delay_ms),
            guest_list_cap: raw.guest_list_cap.unwrap_or(defaults.guest_list_cap),
            hybrid_list_cap: raw.hybrid_list_cap.unwrap_or(defaults.hybrid_list_cap),
            local_list_cap: raw.local_list_cap.unwrap_or(defaults.local_list_cap),
            sync_queue_cap: raw.sync_queue_cap.unwrap_or(defaults.sync_queue_cap),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw: RawConfig =
            serde_json::from_str(r#"{"debounceMs": 500, "syncQueueCap": 10}"#).unwrap();
        let config = SyncConfig::from(raw);
        assert_eq!(config.debounce_ms, 500);
        assert_eq!(config.sync_queue_cap, 10);
        assert_eq!(config.resync_interval_ms, 30_000);
        assert_eq!(config.advance_grace_ms, 5_000);
    }
}
