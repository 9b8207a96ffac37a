//! Screen loads built from several independent resources.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::{future::BoxFuture, future::join_all, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, CrmBackend},
    cache::{CacheStore, Cached},
    resource::ResourceKey,
};

pub type FetchFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, BackendError>> + Send + 'static>;

/// One resource of a composite load. Without an explicit fetch function the
/// coordinator reads the key through the backend.
pub struct ResourceRequest {
    key: ResourceKey,
    ttl: Duration,
    fetch: Option<FetchFn>,
}

impl ResourceRequest {
    pub fn new(key: ResourceKey, ttl: Duration) -> Self {
        Self {
            key,
            ttl,
            fetch: None,
        }
    }

    pub fn with_fetch<F, Fut>(key: ResourceKey, ttl: Duration, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
    {
        Self {
            key,
            ttl,
            fetch: Some(Box::new(move || fetch().boxed())),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

/// Overall state of a screen after a composite load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    /// Every resource loaded from cache or network.
    Ready,
    /// Every resource has a value, some of them stale fallbacks.
    Degraded,
    /// Some resources failed; the rest can render.
    Partial,
    /// Nothing loaded and there was no stale data to show.
    Failed,
}

#[derive(Debug, Error)]
pub enum ScreenLoadError {
    #[error("all {} resources failed to load", .failures.len())]
    AllFailed {
        failures: Vec<(ResourceKey, BackendError)>,
    },
}

#[derive(Debug, Default)]
pub struct CompositeLoad {
    results: HashMap<ResourceKey, Result<Cached<Value>, BackendError>>,
}

impl CompositeLoad {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&ResourceKey, &Result<Cached<Value>, BackendError>)> {
        self.results.iter()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Result<Cached<Value>, BackendError>> {
        self.results.get(key)
    }

    /// Typed view of one resource. A value of the wrong shape is reported as
    /// a decode failure for that resource only.
    pub fn decode<T: DeserializeOwned>(
        &self,
        key: &ResourceKey,
    ) -> Option<Result<Cached<T>, BackendError>> {
        let result = self.results.get(key)?;
        Some(match result {
            Ok(cached) => serde_json::from_value::<T>(cached.value.clone())
                .map(|value| Cached {
                    value,
                    source: cached.source,
                })
                .map_err(|err| BackendError::Decode(format!("{key}: {err}"))),
            Err(err) => Err(err.clone()),
        })
    }

    pub fn failures(&self) -> Vec<(&ResourceKey, &BackendError)> {
        self.results
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key, err)))
            .collect()
    }

    pub fn screen_state(&self) -> ScreenState {
        let failed = self.results.values().filter(|result| result.is_err()).count();
        if failed == 0 {
            let degraded = self
                .results
                .values()
                .any(|result| matches!(result, Ok(cached) if cached.is_degraded()));
            if degraded {
                ScreenState::Degraded
            } else {
                ScreenState::Ready
            }
        } else if failed == self.results.len() {
            ScreenState::Failed
        } else {
            ScreenState::Partial
        }
    }

    /// Fails only when every resource failed without a fallback, so the screen
    /// shows an explicit error instead of empty widgets.
    pub fn into_screen_result(self) -> Result<Self, ScreenLoadError> {
        if self.screen_state() != ScreenState::Failed {
            return Ok(self);
        }
        let failures = self
            .results
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|err| (key, err)))
            .collect();
        Err(ScreenLoadError::AllFailed { failures })
    }
}

#[derive(Clone)]
pub struct DataFetchCoordinator {
    cache: Arc<CacheStore>,
    backend: Arc<dyn CrmBackend>,
}

impl DataFetchCoordinator {
    pub fn new(cache: Arc<CacheStore>, backend: Arc<dyn CrmBackend>) -> Self {
        Self { cache, backend }
    }

    /// Runs every request concurrently through the cache's read-through
    /// policy and reports each outcome separately.
    pub async fn load_composite(&self, requests: Vec<ResourceRequest>) -> CompositeLoad {
        let loads = requests.into_iter().map(|request| self.load_one(request));
        let results = join_all(loads).await.into_iter().collect();
        CompositeLoad { results }
    }

    /// Drops the cached entries of `requests` first, so every resource makes
    /// a network round trip.
    pub async fn refresh(&self, requests: Vec<ResourceRequest>) -> CompositeLoad {
        for request in &requests {
            if let Some(cache_key) = request.key.cache_key() {
                self.cache.invalidate(&cache_key).await;
            }
        }
        self.load_composite(requests).await
    }

    async fn load_one(
        &self,
        request: ResourceRequest,
    ) -> (ResourceKey, Result<Cached<Value>, BackendError>) {
        let ResourceRequest { key, ttl, fetch } = request;
        let backend = Arc::clone(&self.backend);
        let resource = &key;

        let result = self
            .cache
            .read_resource(&key, ttl, move || async move {
                match fetch {
                    Some(fetch) => fetch().await,
                    None => backend.fetch(resource).await,
                }
            })
            .await;

        match &result {
            Ok(cached) => debug!(resource = %key, source = ?cached.source, "resource loaded"),
            Err(err) => warn!(resource = %key, error = %err, "resource failed to load"),
        }
        (key, result)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
