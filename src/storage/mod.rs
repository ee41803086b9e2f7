//! Durable key-value storage used by the cache, the ledger and the outbox.
//!
//! The store offers no transactions: every value is written whole, and callers
//! that need atomicity across several facts keep them in a single value.

mod memory;
mod sqlite;

use async_trait::async_trait;
use color_eyre::Result;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Async whole-value key/value store.
#[async_trait]
pub trait DurableStorage: Send + Sync {
  /// Read a value. A missing key is `Ok(None)`.
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Replace the value stored under `key`.
  async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  async fn delete(&self, key: &str) -> Result<()>;
}
