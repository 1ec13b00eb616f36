//! Expiring key/value cache on top of a [`Storage`] backend.
//!
//! Entries are stored as `{ "value": .., "storedAtEpochMs": .. }` envelopes under
//! host-qualified keys, so a dev deployment never reads a prod entry. Every
//! failure is logged and absorbed: persistence is best effort.

use crate::errors::FetchError;
use crate::storage::Storage;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{debug, warn};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for deterministic expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry<T> {
    value: T,
    #[serde(rename = "storedAtEpochMs")]
    stored_at_epoch_ms: i64,
}

#[derive(Clone)]
pub struct PersistedCache {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    namespace: String,
}

impl PersistedCache {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, host: &str) -> Self {
        Self {
            storage,
            clock,
            namespace: namespace_for_host(host),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn qualified_key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    /// Returns the value if it is at most `max_age` old. Expired or unreadable
    /// entries are deleted and reported as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<T> {
        let qualified = self.qualified_key(key);
        let raw = match self.storage.read(&qualified) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %qualified, error = %FetchError::from(err), "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %qualified, "discarding unreadable cache entry: {err}");
                self.remove(&qualified);
                return None;
            }
        };

        let age = self.clock.now_ms() - entry.stored_at_epoch_ms;
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        if age > max_age_ms {
            debug!(key = %qualified, age_ms = age, "cache entry expired");
            self.remove(&qualified);
            return None;
        }

        Some(entry.value)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let qualified = self.qualified_key(key);
        let entry = CacheEntry {
            value,
            stored_at_epoch_ms: self.clock.now_ms(),
        };
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %qualified, "cache value not serializable: {err}");
                return;
            }
        };
        if let Err(err) = self.storage.write(&qualified, payload) {
            warn!(key = %qualified, error = %FetchError::from(err), "cache write failed");
        }
    }

    pub fn clear(&self, key: &str) {
        self.remove(&self.qualified_key(key));
    }

    fn remove(&self, qualified: &str) {
        if let Err(err) = self.storage.remove(qualified) {
            warn!(key = %qualified, error = %FetchError::from(err), "cache delete failed");
        }
    }
}

fn namespace_for_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        "dashboard:local".to_owned()
    } else {
        format!("dashboard:{host}")
    }
}
