//! In-memory lease store for tests.
//!
//! Single-process stand-in implementing the full [`LeaseStore`] contract:
//! entries expire lazily against a recorded deadline, and every operation
//! runs under one mutex so the atomicity the contract demands holds by
//! construction. Shared-`Arc` clones see the same data, which is what the
//! concurrency tests lean on.

use crate::error::LeaseError;
use crate::lease::store::LeaseStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    /// `None` means the entry is permanent (a finalized booking).
    expires_at: Option<Instant>,
}

impl Entry {
    fn lapsed(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// In-memory [`LeaseStore`] backed by a single mutex-guarded map.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryLeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| !entry.lapsed());
        f(&mut entries)
    }

    fn counter_value(entries: &HashMap<String, Entry>, key: &str) -> Result<i64, LeaseError> {
        match entries.get(key) {
            Some(entry) => entry
                .value
                .parse()
                .map_err(|_| LeaseError::Backend(format!("key {key} is not a counter"))),
            None => Ok(0),
        }
    }

    /// Number of live (unexpired) entries; test helper.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    /// Whether the store holds no live entries; test helper.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), LeaseError> {
        let payload = serde_json::to_string(value)
            .map_err(|e| LeaseError::Backend(format!("failed to encode lease entry: {e}")))?;
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: payload,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LeaseError> {
        let raw = self.with_entries(|entries| entries.get(key).map(|e| e.value.clone()));
        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(|source| LeaseError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, LeaseError> {
        Ok(self.with_entries(|entries| entries.get(key).map(|e| e.value.clone())))
    }

    async fn delete(&self, key: &str) -> Result<bool, LeaseError> {
        Ok(self.with_entries(|entries| entries.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool, LeaseError> {
        Ok(self.with_entries(|entries| entries.contains_key(key)))
    }

    async fn persist(&self, key: &str) -> Result<bool, LeaseError> {
        Ok(self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if entry.expires_at.is_some() => {
                entry.expires_at = None;
                true
            }
            _ => false,
        }))
    }

    async fn set_counter(&self, key: &str, value: i64) -> Result<(), LeaseError> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, LeaseError> {
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => entry
                .value
                .parse()
                .map(Some)
                .map_err(|_| LeaseError::Backend(format!("key {key} is not a counter"))),
            None => Ok(None),
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError> {
        self.with_entries(|entries| {
            let next = Self::counter_value(entries, key)? + delta;
            entries.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at: None,
                },
            );
            Ok(next)
        })
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64, LeaseError> {
        self.incr_by(key, -delta).await
    }

    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: token.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                true
            }
        }))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        Ok(self.with_entries(|entries| {
            if entries.get(key).is_some_and(|e| e.value == token) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn reclaim_hold(
        &self,
        hold_key: &str,
        expected: &str,
        counter_key: &str,
        quantity: i64,
    ) -> Result<bool, LeaseError> {
        self.with_entries(|entries| {
            let reclaimable = entries
                .get(hold_key)
                .is_some_and(|e| e.value == expected && e.expires_at.is_some());
            if !reclaimable {
                return Ok(false);
            }
            if quantity > 0 {
                let next = Self::counter_value(entries, counter_key)? + quantity;
                entries.insert(
                    counter_key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at: None,
                    },
                );
            }
            entries.remove(hold_key);
            Ok(true)
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError> {
        // Only the prefix-glob patterns the reconciler uses are supported.
        let matches = self.with_entries(|entries| {
            entries
                .keys()
                .filter(|key| match pattern.strip_suffix('*') {
                    Some(prefix) => key.starts_with(prefix),
                    None => key.as_str() == pattern,
                })
                .cloned()
                .collect()
        });
        Ok(matches)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{QuantityHold, UserId};
    use chrono::Utc;

    #[tokio::test]
    async fn entries_expire_lazily() {
        let store = InMemoryLeaseStore::new();
        store
            .put_json("k", &"v", Some(Duration::from_millis(20)))
            .await
            .expect("put");
        assert!(store.exists("k").await.expect("exists"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.expect("exists"));
    }

    #[tokio::test]
    async fn len_counts_only_live_entries() {
        let store = InMemoryLeaseStore::new();
        assert!(store.is_empty());
        store.put_json("a", &"v", None).await.expect("put");
        store
            .put_json("b", &"v", Some(Duration::from_millis(20)))
            .await
            .expect("put");
        assert_eq!(store.len(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn persist_strips_expiry() {
        let store = InMemoryLeaseStore::new();
        store
            .put_json("k", &"v", Some(Duration::from_millis(20)))
            .await
            .expect("put");
        assert!(store.persist("k").await.expect("persist"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.exists("k").await.expect("exists"));
        // A second persist reports nothing to do.
        assert!(!store.persist("k").await.expect("persist"));
    }

    #[tokio::test]
    async fn decrement_of_missing_counter_goes_negative() {
        let store = InMemoryLeaseStore::new();
        assert_eq!(store.decr_by("counter", 3).await.expect("decr"), -3);
    }

    #[tokio::test]
    async fn lock_release_requires_matching_token() {
        let store = InMemoryLeaseStore::new();
        assert!(store
            .try_acquire("lock", "token-a", Duration::from_secs(5))
            .await
            .expect("acquire"));
        assert!(!store.release_lock("lock", "token-b").await.expect("release"));
        assert!(store.release_lock("lock", "token-a").await.expect("release"));
    }

    #[tokio::test]
    async fn reclaim_is_a_noop_after_payload_changes() {
        let store = InMemoryLeaseStore::new();
        let hold = QuantityHold {
            user_id: UserId::new(),
            quantity: 2,
            reserved_at: Utc::now(),
        };
        store
            .put_json("hold", &hold, Some(Duration::from_secs(5)))
            .await
            .expect("put");
        let stale = store.get_raw("hold").await.expect("raw").expect("present");

        // Hold replaced between read and reclaim.
        let newer = QuantityHold {
            quantity: 4,
            ..hold
        };
        store
            .put_json("hold", &newer, Some(Duration::from_secs(5)))
            .await
            .expect("put");

        assert!(!store
            .reclaim_hold("hold", &stale, "counter", 2)
            .await
            .expect("reclaim"));
        assert!(store.exists("hold").await.expect("exists"));
    }

    #[tokio::test]
    async fn reclaim_restores_counter_exactly_once() {
        let store = InMemoryLeaseStore::new();
        store.set_counter("counter", 3).await.expect("seed");
        let hold = QuantityHold {
            user_id: UserId::new(),
            quantity: 2,
            reserved_at: Utc::now(),
        };
        store
            .put_json("hold", &hold, Some(Duration::from_secs(5)))
            .await
            .expect("put");
        let raw = store.get_raw("hold").await.expect("raw").expect("present");

        assert!(store
            .reclaim_hold("hold", &raw, "counter", 2)
            .await
            .expect("reclaim"));
        assert!(!store
            .reclaim_hold("hold", &raw, "counter", 2)
            .await
            .expect("reclaim"));
        assert_eq!(store.get_counter("counter").await.expect("get"), Some(5));
    }
}
