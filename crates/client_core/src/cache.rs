//! Time-boxed read-through cache with stale-on-error fallback.
//!
//! Entries are JSON values persisted through a [`KeyValueStore`]. Freshness
//! never gates a read: `get` returns whatever is stored, and `read_through`
//! only uses freshness to decide whether the fetch function runs.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use storage::{KeyValueStore, MemoryStore, StoredEntry};
use tracing::{debug, warn};

use crate::{backend::BackendError, resource::ResourceKey};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from a fresh entry without touching the network.
    Cache,
    /// Fetched live and written back.
    Network,
    /// The fetch failed and a previously stored value was returned instead.
    StaleFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub source: CacheSource,
}

impl<T> Cached<T> {
    pub fn is_degraded(&self) -> bool {
        self.source == CacheSource::StaleFallback
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            source: self.source,
        }
    }
}

/// Fresh iff `now - fetched_at < ttl`.
pub fn is_fresh_at(entry: &CacheEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    let elapsed_ms = now.signed_duration_since(entry.fetched_at).num_milliseconds();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    elapsed_ms < ttl_ms
}

pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the stored entry regardless of freshness. Unreadable entries
    /// are reported as absent.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let stored = match self.store.load(key).await {
            Ok(stored) => stored?,
            Err(err) => {
                warn!(key, error = %err, "error reading cache");
                return None;
            }
        };

        let value = match serde_json::from_str(&stored.value_json) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "discarding unparsable cache entry");
                return None;
            }
        };

        Some(CacheEntry {
            key: stored.key,
            value,
            fetched_at: stored.fetched_at,
            ttl: Duration::from_millis(u64::try_from(stored.ttl_ms).unwrap_or_default()),
        })
    }

    pub fn is_fresh(&self, entry: &CacheEntry, ttl: Duration) -> bool {
        is_fresh_at(entry, ttl, self.clock.now())
    }

    /// Overwrites any prior entry for `key`, stamped with the current time.
    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) {
        let entry = StoredEntry {
            key: key.to_string(),
            value_json: value.to_string(),
            fetched_at: self.clock.now(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        };
        if let Err(err) = self.store.save(&entry).await {
            warn!(key, error = %err, "error setting cache");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        match self.store.remove(key).await {
            Ok(removed) => debug!(key, removed, "cache entry invalidated"),
            Err(err) => warn!(key, error = %err, "error clearing cache"),
        }
    }

    pub async fn invalidate_family(&self, prefix: &str) {
        match self.store.remove_prefix(prefix).await {
            Ok(removed) => debug!(prefix, removed, "cache family invalidated"),
            Err(err) => warn!(prefix, error = %err, "error clearing cache family"),
        }
    }

    /// Drops every entry. Used on logout.
    pub async fn clear(&self) {
        match self.store.clear().await {
            Ok(removed) => debug!(removed, "cache cleared"),
            Err(err) => warn!(error = %err, "error clearing cache"),
        }
    }

    /// Serves a fresh entry, otherwise fetches and stores. When the fetch
    /// fails, any stored value for `key` (stale or not) is returned instead;
    /// with nothing stored the fetch error propagates.
    pub async fn read_through<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<T>, BackendError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if let Some(entry) = self.get(key).await {
            if self.is_fresh(&entry, ttl) {
                if let Some(value) = decode_entry(&entry) {
                    debug!(key, "cache hit");
                    return Ok(Cached {
                        value,
                        source: CacheSource::Cache,
                    });
                }
            }
        }

        match fetch().await {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(json) => self.set(key, &json, ttl).await,
                    Err(err) => warn!(key, error = %err, "fetched value not cacheable"),
                }
                Ok(Cached {
                    value,
                    source: CacheSource::Network,
                })
            }
            Err(err) => {
                // Re-read: the entry may have been written or invalidated while
                // the fetch was outstanding.
                let fallback = self.get(key).await.and_then(|entry| decode_entry(&entry));
                match fallback {
                    Some(value) => {
                        warn!(key, error = %err, "fetch failed, serving stale cache entry");
                        Ok(Cached {
                            value,
                            source: CacheSource::StaleFallback,
                        })
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// `read_through` for a resource key. Filtered resources bypass the
    /// cache entirely.
    pub async fn read_resource<T, F, Fut>(
        &self,
        resource: &ResourceKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<T>, BackendError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        match resource.cache_key() {
            Some(key) => self.read_through(&key, ttl, fetch).await,
            None => fetch().await.map(|value| Cached {
                value,
                source: CacheSource::Network,
            }),
        }
    }
}

fn decode_entry<T: DeserializeOwned>(entry: &CacheEntry) -> Option<T> {
    match serde_json::from_value(entry.value.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key = %entry.key, error = %err, "cached value has unexpected shape");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
