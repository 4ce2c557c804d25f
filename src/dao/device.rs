//! Stable per-device identity tag stamped on anonymous games.

use std::{
    collections::hash_map::DefaultHasher,
    env,
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock},
};

use tracing::{info, warn};
use uuid::Uuid;

use crate::{clock::TimestampMs, dao::kv::KeyValueStore, state::game::to_base36};

/// Storage key holding the device identity, kept outside every game record.
pub const DEVICE_ID_KEY: &str = "guest_device_id";

/// Lazily created, persisted device identity.
pub struct DeviceIdentity {
    storage: Arc<dyn KeyValueStore>,
    cached: OnceLock<String>,
}

impl DeviceIdentity {
    /// Bind the identity to a device storage.
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            cached: OnceLock::new(),
        }
    }

    /// Return the device tag, generating and persisting it on first use.
    ///
    /// When storage is unusable the tag only lives for the current process.
    pub fn get_or_create(&self, now: TimestampMs) -> &str {
        self.cached.get_or_init(|| match self.storage.get_item(DEVICE_ID_KEY) {
            Ok(Some(existing)) if !existing.is_empty() => existing,
            Ok(_) => {
                let fresh = generate_device_id(now);
                if let Err(err) = self.storage.set_item(DEVICE_ID_KEY, &fresh) {
                    warn!(error = %err, "failed to persist device id; using a session-only id");
                } else {
                    info!(device_id = %fresh, "generated new device id");
                }
                fresh
            }
            Err(err) => {
                warn!(error = %err, "failed to read device id; using a session-only id");
                generate_device_id(now)
            }
        })
    }

    /// Stored device tag without generating one.
    pub fn current(&self) -> Option<String> {
        if let Some(cached) = self.cached.get() {
            return Some(cached.clone());
        }
        self.storage.get_item(DEVICE_ID_KEY).ok().flatten()
    }
}

/// Combine an environment fingerprint with the creation time.
fn generate_device_id(now: TimestampMs) -> String {
    let mut hasher = DefaultHasher::new();
    env::consts::OS.hash(&mut hasher);
    env::consts::ARCH.hash(&mut hasher);
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_default()
        .hash(&mut hasher);
    Uuid::new_v4().hash(&mut hasher);

    format!(
        "device_{}_{}",
        to_base36(hasher.finish()),
        to_base36(now.max(0) as u64)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::kv::MemoryKeyValueStore;

    #[test]
    fn identity_is_generated_once_and_persisted() {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let identity = DeviceIdentity::new(storage.clone());
        assert_eq!(identity.current(), None);

        let first = identity.get_or_create(1_000).to_string();
        assert!(first.starts_with("device_"));
        assert_eq!(identity.get_or_create(2_000), first);

        let reloaded = DeviceIdentity::new(storage.clone());
        assert_eq!(reloaded.get_or_create(3_000), first);
        assert_eq!(
            storage.get_item(DEVICE_ID_KEY).unwrap().as_deref(),
            Some(first.as_str())
        );
    }
}
