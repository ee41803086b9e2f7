//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use tracing::{debug, warn};

use super::keys::CacheKey;
use super::store::LocalCacheStore;
use super::traits::{CacheResult, Cacheable};
use crate::remote::RemoteError;

/// Cache layer that manages read-through caching and network fetching.
///
/// This layer sits between the engine and the remote store, providing an
/// instant paint from local data and offline fallback.
#[derive(Clone)]
pub struct CacheLayer {
  store: LocalCacheStore,
  /// How long before cached detail records are considered stale
  stale_time: Duration,
}

impl CacheLayer {
  /// Create a new cache layer over the given store.
  pub fn new(store: LocalCacheStore) -> Self {
    Self {
      store,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Read a cached list without touching the network.
  pub async fn cached_list<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheResult<Vec<T>>> {
    let key = key.to_string();
    let entry = self.store.get(&key).await?;

    match serde_json::from_value::<Vec<T>>(entry.value) {
      Ok(entities) => {
        let stale = self.is_stale(entry.stored_at);
        Some(CacheResult::from_cache(entities, entry.stored_at, stale))
      }
      Err(e) => {
        warn!(key, error = %e, "cached list has unexpected shape, ignoring");
        None
      }
    }
  }

  /// Fetch a list from the network and write it through to the cache.
  ///
  /// 1. Always ask the network
  /// 2. On success, replace the cached list
  /// 3. On a transient failure, return the cached list if there is one (offline mode)
  /// 4. Anything else is returned to the caller
  pub async fn fetch_list<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>, RemoteError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, RemoteError>>,
  {
    match fetcher().await {
      Ok(data) => {
        self.store_list(key, &data).await;
        Ok(CacheResult::from_network(data))
      }
      Err(e) if e.is_transient() => match self.cached_list::<T>(key).await {
        Some(cached) => {
          debug!(key = %key, "network unavailable, serving cached list");
          let cached_at = cached.cached_at.unwrap_or_else(Utc::now);
          Ok(CacheResult::offline(cached.data, cached_at))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  /// Fetch a single entity with caching.
  ///
  /// A fresh cached copy answers immediately; a stale or missing one is refreshed
  /// from the network, falling back to the stale copy when offline.
  pub async fn fetch_one<T, F, Fut>(
    &self,
    entity_id: &str,
    fetcher: F,
  ) -> Result<CacheResult<Option<T>>, RemoteError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, RemoteError>>,
  {
    let key = CacheKey::details(T::entity_type(), entity_id).to_string();

    let cached = self
      .store
      .get(&key)
      .await
      .and_then(|entry| match serde_json::from_value::<T>(entry.value) {
        Ok(entity) => Some((entity, entry.stored_at)),
        Err(_) => None,
      });

    if let Some((entity, cached_at)) = cached {
      if !self.is_stale(cached_at) {
        // Cache is fresh
        return Ok(CacheResult::from_cache(Some(entity), cached_at, false));
      }

      // Cache is stale, try to fetch from network
      return match fetcher().await {
        Ok(Some(data)) => {
          self.put_one(&data).await;
          Ok(CacheResult::from_network(Some(data)))
        }
        Ok(None) => {
          self.store.delete(&key).await;
          Ok(CacheResult::from_network(None))
        }
        // Network failed, return stale cache (offline mode)
        Err(e) if e.is_transient() => Ok(CacheResult::offline(Some(entity), cached_at)),
        Err(e) => Err(e),
      };
    }

    // No cache, must fetch from network
    let data = fetcher().await?;
    if let Some(entity) = &data {
      self.put_one(entity).await;
    }
    Ok(CacheResult::from_network(data))
  }

  /// Read a cached detail record regardless of age.
  pub async fn cached_one<T: Cacheable>(&self, entity_id: &str) -> Option<T> {
    let key = CacheKey::details(T::entity_type(), entity_id).to_string();
    let entry = self.store.get(&key).await?;
    serde_json::from_value(entry.value).ok()
  }

  /// Store a single entity under its detail key.
  pub async fn put_one<T: Cacheable>(&self, entity: &T) {
    let key = CacheKey::details(T::entity_type(), &entity.cache_key()).to_string();
    match serde_json::to_value(entity) {
      Ok(value) => self.store.set(&key, value).await,
      Err(e) => warn!(key, error = %e, "failed to serialize entity for cache"),
    }
  }

  /// Drop a single entity's detail record.
  pub async fn forget_one<T: Cacheable>(&self, entity_id: &str) {
    let key = CacheKey::details(T::entity_type(), entity_id).to_string();
    self.store.delete(&key).await;
  }

  async fn store_list<T: Cacheable>(&self, key: &CacheKey, entities: &[T]) {
    match serde_json::to_value(entities) {
      Ok(value) => self.store.set(&key.to_string(), value).await,
      Err(e) => warn!(key = %key, error = %e, "failed to serialize list for cache"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::model::{Establishment, Scope};
  use crate::storage::MemoryStorage;
  use std::sync::Arc;

  fn layer() -> CacheLayer {
    CacheLayer::new(LocalCacheStore::new(Arc::new(MemoryStorage::new())))
  }

  fn shop(id: &str, name: &str) -> Establishment {
    Establishment::new(id, "c1", name)
  }

  #[tokio::test]
  async fn test_fetch_list_writes_through() {
    let layer = layer();
    let key = CacheKey::list("establishment", &Scope::congregation("c1"));

    assert!(layer.cached_list::<Establishment>(&key).await.is_none());

    let result = layer
      .fetch_list(&key, || async { Ok(vec![shop("e1", "Bakery")]) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);

    let cached = layer.cached_list::<Establishment>(&key).await.unwrap();
    assert_eq!(cached.source, CacheSource::CacheFresh);
    assert_eq!(cached.data[0].name, "Bakery");
  }

  #[tokio::test]
  async fn test_fetch_list_offline_falls_back() {
    let layer = layer();
    let key = CacheKey::list("establishment", &Scope::congregation("c1"));

    layer
      .fetch_list(&key, || async { Ok(vec![shop("e1", "Bakery")]) })
      .await
      .unwrap();

    let result = layer
      .fetch_list::<Establishment, _, _>(&key, || async {
        Err(RemoteError::Offline("no route".into()))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.len(), 1);
  }

  #[tokio::test]
  async fn test_fetch_list_offline_without_cache_errors() {
    let layer = layer();
    let key = CacheKey::list("establishment", &Scope::congregation("c1"));

    let result = layer
      .fetch_list::<Establishment, _, _>(&key, || async {
        Err(RemoteError::Offline("no route".into()))
      })
      .await;
    assert!(matches!(result, Err(RemoteError::Offline(_))));
  }

  #[tokio::test]
  async fn test_fetch_one_prefers_fresh_cache() {
    let layer = layer();
    layer.put_one(&shop("e1", "Bakery")).await;

    let result = layer
      .fetch_one::<Establishment, _, _>("e1", || async {
        Err(RemoteError::Decode("fresh cache must not hit the network".into()))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.unwrap().name, "Bakery");
  }

  #[tokio::test]
  async fn test_fetch_one_stale_refreshes_or_serves_offline() {
    let layer = layer().with_stale_time(Duration::seconds(-1));
    layer.put_one(&shop("e1", "Bakery")).await;

    let result = layer
      .fetch_one::<Establishment, _, _>("e1", || async { Ok(Some(shop("e1", "Bakery & Cafe"))) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.unwrap().name, "Bakery & Cafe");

    let result = layer
      .fetch_one::<Establishment, _, _>("e1", || async {
        Err(RemoteError::Offline("no route".into()))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.unwrap().name, "Bakery & Cafe");
  }
}
