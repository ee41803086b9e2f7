//! SQLite-backed durable storage.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::DurableStorage;
use crate::db::Database;

/// SQLite-based key/value storage implementation.
///
/// Statements run on tokio's blocking pool so callers never stall the runtime.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Ok(Self::from_database(Database::open()?))
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    Ok(Self::from_database(Database::open_at(path)?))
  }

  /// In-memory store, mostly for `--ephemeral` runs.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  fn from_database(db: Database) -> Self {
    Self {
      conn: Arc::new(Mutex::new(db.into_connection())),
    }
  }

  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
  {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }
}

#[async_trait]
impl DurableStorage for SqliteStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", key, e))
      })
      .await
  }

  async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let key = key.to_string();
    let value = value.to_vec();
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO kv_store (key, value, stored_at)
             VALUES (?, ?, datetime('now'))",
            params![key, value],
          )
          .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM kv_store WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
        Ok(())
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_missing_key_is_none() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get("nope").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_set_replaces_whole_value() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.set("k", b"first value").await.unwrap();
    storage.set("k", b"2nd").await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), Some(b"2nd".to_vec()));

    storage.delete("k").await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), None);
    // Deleting again is fine
    storage.delete("k").await.unwrap();
  }

  #[tokio::test(flavor = "current_thread")]
  async fn test_calls_do_not_block_the_runtime() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    // Holding the connection stalls only the blocking pool
    let held = storage.conn.clone();
    let guard = std::thread::spawn(move || {
      let _conn = held.lock().unwrap();
      std::thread::sleep(std::time::Duration::from_millis(200));
    });
    std::thread::sleep(std::time::Duration::from_millis(20));

    let write = {
      let storage = storage.clone();
      tokio::spawn(async move { storage.set("k", b"v").await })
    };
    let ticker = tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_millis(10)).await });
    ticker.await.unwrap();
    assert!(!write.is_finished());

    write.await.unwrap().unwrap();
    guard.join().unwrap();
    assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
  }

  #[tokio::test]
  async fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.set("ledger:x", br#"{"adds":["a"]}"#).await.unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(
      storage.get("ledger:x").await.unwrap(),
      Some(br#"{"adds":["a"]}"#.to_vec())
    );
  }
}
