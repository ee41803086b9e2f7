//! Cache store over durable storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::DurableStorage;

/// A single cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  #[serde(skip)]
  pub key: String,
  pub value: serde_json::Value,
  pub stored_at: DateTime<Utc>,
}

/// Key/value cache that never fails.
///
/// Reads of a missing or unreadable key return `None`; failed writes are logged and
/// dropped.
#[derive(Clone)]
pub struct LocalCacheStore {
  storage: Arc<dyn DurableStorage>,
}

impl LocalCacheStore {
  pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
    Self { storage }
  }

  pub async fn get(&self, key: &str) -> Option<CacheEntry> {
    let bytes = match self.storage.get(key).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_slice::<CacheEntry>(&bytes) {
      Ok(mut entry) => {
        entry.key = key.to_string();
        Some(entry)
      }
      Err(e) => {
        warn!(key, error = %e, "cache entry unreadable, treating as miss");
        None
      }
    }
  }

  pub async fn set(&self, key: &str, value: serde_json::Value) {
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: Utc::now(),
    };

    let bytes = match serde_json::to_vec(&entry) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.storage.set(key, &bytes).await {
      warn!(key, error = %e, "cache write failed");
    } else {
      debug!(key, "cache updated");
    }
  }

  pub async fn delete(&self, key: &str) {
    if let Err(e) = self.storage.delete(key).await {
      warn!(key, error = %e, "cache delete failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::MemoryStorage;
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use serde_json::json;

  struct BrokenStorage;

  #[async_trait]
  impl DurableStorage for BrokenStorage {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
      Err(eyre!("disk on fire"))
    }

    async fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
      Err(eyre!("disk on fire"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
      Err(eyre!("disk on fire"))
    }
  }

  #[tokio::test]
  async fn test_roundtrip_and_delete() {
    let cache = LocalCacheStore::new(Arc::new(MemoryStorage::new()));
    assert!(cache.get("establishment:list").await.is_none());

    cache.set("establishment:list", json!([{"id": "e1"}])).await;
    let entry = cache.get("establishment:list").await.unwrap();
    assert_eq!(entry.key, "establishment:list");
    assert_eq!(entry.value, json!([{"id": "e1"}]));

    cache.set("establishment:list", json!([])).await;
    assert_eq!(cache.get("establishment:list").await.unwrap().value, json!([]));

    cache.delete("establishment:list").await;
    assert!(cache.get("establishment:list").await.is_none());
  }

  #[tokio::test]
  async fn test_storage_failures_are_misses() {
    let cache = LocalCacheStore::new(Arc::new(BrokenStorage));
    cache.set("k", json!(1)).await;
    assert!(cache.get("k").await.is_none());
    cache.delete("k").await;
  }

  #[tokio::test]
  async fn test_garbage_is_a_miss() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("k", b"not json").await.unwrap();
    let cache = LocalCacheStore::new(storage);
    assert!(cache.get("k").await.is_none());
  }
}
