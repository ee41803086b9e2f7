//! In-process remote store for tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteError, RemoteStore};
use crate::model::{Entity, Scope};

/// Upserts by id, so replaying a create yields one record.
pub struct FakeRemote<T> {
  records: Mutex<BTreeMap<String, T>>,
  /// Snapshot served by `fetch_list` instead of `records`, to model a stale read
  stale_list: Mutex<Option<Vec<T>>>,
  offline: AtomicBool,
  reject_writes: Mutex<Option<String>>,
  fetch_delay: Mutex<Duration>,
  write_delay: Mutex<Duration>,
  /// File creates under `srv-<n>` instead of the caller's id
  assign_ids: AtomicBool,
  /// Answer deletes with `NotFound` and keep the row, like a row-level policy
  hide_deletes: AtomicBool,
  pub fetches: AtomicUsize,
  pub creates: AtomicUsize,
  pub deletes: AtomicUsize,
}

impl<T: Entity> FakeRemote<T> {
  pub fn new() -> Self {
    Self {
      records: Mutex::new(BTreeMap::new()),
      stale_list: Mutex::new(None),
      offline: AtomicBool::new(false),
      reject_writes: Mutex::new(None),
      fetch_delay: Mutex::new(Duration::ZERO),
      write_delay: Mutex::new(Duration::ZERO),
      assign_ids: AtomicBool::new(false),
      hide_deletes: AtomicBool::new(false),
      fetches: AtomicUsize::new(0),
      creates: AtomicUsize::new(0),
      deletes: AtomicUsize::new(0),
    }
  }

  pub fn with_records(records: Vec<T>) -> Self {
    let remote = Self::new();
    for record in records {
      remote.insert(record);
    }
    remote
  }

  pub fn insert(&self, record: T) {
    self
      .records
      .lock()
      .unwrap()
      .insert(record.id().to_string(), record);
  }

  pub fn remove(&self, id: &str) {
    self.records.lock().unwrap().remove(id);
  }

  pub fn ids(&self) -> Vec<String> {
    self.records.lock().unwrap().keys().cloned().collect()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn reject_writes(&self, reason: Option<&str>) {
    *self.reject_writes.lock().unwrap() = reason.map(String::from);
  }

  pub fn serve_stale(&self, list: Option<Vec<T>>) {
    *self.stale_list.lock().unwrap() = list;
  }

  pub fn set_fetch_delay(&self, delay: Duration) {
    *self.fetch_delay.lock().unwrap() = delay;
  }

  /// Delay applied to `create` before it takes effect.
  pub fn set_write_delay(&self, delay: Duration) {
    *self.write_delay.lock().unwrap() = delay;
  }

  pub fn assign_ids(&self, on: bool) {
    self.assign_ids.store(on, Ordering::SeqCst);
  }

  pub fn hide_deletes(&self, on: bool) {
    self.hide_deletes.store(on, Ordering::SeqCst);
  }

  fn check_online(&self) -> Result<(), RemoteError> {
    if self.offline.load(Ordering::SeqCst) {
      Err(RemoteError::Offline("connection refused".into()))
    } else {
      Ok(())
    }
  }

  fn check_write(&self) -> Result<(), RemoteError> {
    self.check_online()?;
    match self.reject_writes.lock().unwrap().clone() {
      Some(message) => Err(RemoteError::Rejected {
        status: 400,
        message,
      }),
      None => Ok(()),
    }
  }
}

/// Equality filters applied to the record's JSON form, like the REST endpoint does.
fn in_scope<T: Entity>(record: &T, scope: &Scope) -> bool {
  let Ok(value) = serde_json::to_value(record) else {
    return false;
  };
  scope.filters().iter().all(|(column, expected)| match value.get(column) {
    Some(serde_json::Value::String(actual)) => actual == expected,
    Some(other) => other.to_string() == *expected,
    None => false,
  })
}

#[async_trait]
impl<T: Entity> RemoteStore<T> for FakeRemote<T> {
  async fn fetch_list(&self, scope: &Scope) -> Result<Vec<T>, RemoteError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let delay = *self.fetch_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self.check_online()?;
    if let Some(stale) = self.stale_list.lock().unwrap().clone() {
      return Ok(stale);
    }
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .values()
        .filter(|record| in_scope(*record, scope))
        .cloned()
        .collect(),
    )
  }

  async fn fetch_details(&self, id: &str) -> Result<Option<T>, RemoteError> {
    self.check_online()?;
    Ok(self.records.lock().unwrap().get(id).cloned())
  }

  async fn create(&self, entity: &T) -> Result<String, RemoteError> {
    let delay = *self.write_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self.check_write()?;
    let created = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
    let record = if self.assign_ids.load(Ordering::SeqCst) {
      entity.clone().with_id(format!("srv-{}", created))
    } else {
      entity.clone()
    };
    let id = record.id().to_string();
    self.insert(record);
    Ok(id)
  }

  async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<(), RemoteError> {
    self.check_write()?;
    let mut records = self.records.lock().unwrap();
    let record = records
      .get_mut(id)
      .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
    let mut value = serde_json::to_value(&*record).map_err(|e| RemoteError::Decode(e.to_string()))?;
    if let (Some(target), Some(fields)) = (value.as_object_mut(), patch.as_object()) {
      for (k, v) in fields {
        target.insert(k.clone(), v.clone());
      }
    }
    *record = serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(())
  }

  async fn delete(&self, id: &str) -> Result<(), RemoteError> {
    self.check_write()?;
    self.deletes.fetch_add(1, Ordering::SeqCst);
    if self.hide_deletes.load(Ordering::SeqCst) {
      return Err(RemoteError::NotFound(id.to_string()));
    }
    match self.records.lock().unwrap().remove(id) {
      Some(_) => Ok(()),
      None => Err(RemoteError::NotFound(id.to_string())),
    }
  }
}
