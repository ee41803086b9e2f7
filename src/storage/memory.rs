use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::DurableStorage;

/// Process-local storage. Nothing survives the process, but two engines sharing
/// one instance see each other's writes, which is how restarts are simulated.
#[derive(Default)]
pub struct MemoryStorage {
  values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored keys.
  pub fn len(&self) -> usize {
    self.values.lock().map(|v| v.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(values.get(key).cloned())
  }

  async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.remove(key);
    Ok(())
  }
}
