//! Durable FIFO of writes that could not reach the remote store.
//!
//! Entries leave the queue only once the remote store acknowledged them. A crash
//! between the acknowledgement and the removal replays the entry on the next drain,
//! which is harmless because every operation carries a caller-chosen entity id.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::Scope;
use crate::remote::RemoteError;
use crate::storage::DurableStorage;

/// A queued remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
  Create {
    entity_id: String,
    payload: serde_json::Value,
  },
  Update {
    entity_id: String,
    patch: serde_json::Value,
  },
  Delete {
    entity_id: String,
  },
}

impl Operation {
  pub fn entity_id(&self) -> &str {
    match self {
      Self::Create { entity_id, .. } | Self::Update { entity_id, .. } | Self::Delete { entity_id } => {
        entity_id
      }
    }
  }

  /// Point the operation at another entity id.
  pub fn retarget(&mut self, id: &str) {
    match self {
      Self::Create { entity_id, .. } | Self::Update { entity_id, .. } | Self::Delete { entity_id } => {
        *entity_id = id.to_string();
      }
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::Create { .. } => "create",
      Self::Update { .. } => "update",
      Self::Delete { .. } => "delete",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
  pub id: Uuid,
  pub operation: Operation,
  /// Scope whose ledger recorded the operation, for rollback on rejection
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scope: Option<Scope>,
  pub enqueued_at: DateTime<Utc>,
}

/// An entry the remote store refused; kept for inspection instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEntry {
  pub entry: OutboxEntry,
  pub reason: String,
  pub rejected_at: DateTime<Utc>,
}

/// A replayed create the remote store filed under an id of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Reassigned {
  pub scope: Option<Scope>,
  pub client_id: String,
  pub server_id: String,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
  pub replayed: usize,
  /// Entries set aside during this pass
  pub rejected: Vec<RejectedEntry>,
  /// Creates whose id the remote store replaced
  pub reassigned: Vec<Reassigned>,
  pub remaining: usize,
  /// Transient error that stopped the pass, if any
  pub stopped_by: Option<RemoteError>,
  /// Another drain was already running
  pub skipped: bool,
}

/// Durable outbox queue persisted as one JSON array per queue.
pub struct Outbox {
  name: String,
  storage: Arc<dyn DurableStorage>,
  queue: Mutex<VecDeque<OutboxEntry>>,
  rejected: Mutex<Vec<RejectedEntry>>,
  draining: AtomicBool,
}

/// Clears the draining flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl Outbox {
  /// Open a named queue, restoring whatever a previous run left behind.
  pub async fn open(name: impl Into<String>, storage: Arc<dyn DurableStorage>) -> Self {
    let name = name.into();
    let queue: VecDeque<OutboxEntry> = load(&*storage, &queue_key(&name)).await;
    let rejected: Vec<RejectedEntry> = load(&*storage, &rejected_key(&name)).await;

    if !queue.is_empty() {
      info!(queue = %name, pending = queue.len(), "restored outbox entries");
    }

    Self {
      name,
      storage,
      queue: Mutex::new(queue),
      rejected: Mutex::new(rejected),
      draining: AtomicBool::new(false),
    }
  }

  /// Append an operation. Always succeeds locally.
  pub async fn enqueue(&self, operation: Operation) -> OutboxEntry {
    self.enqueue_in(None, operation).await
  }

  /// Append an operation that belongs to a scope's pending ledger.
  pub async fn enqueue_in(&self, scope: Option<Scope>, operation: Operation) -> OutboxEntry {
    let entry = OutboxEntry {
      id: Uuid::new_v4(),
      operation,
      scope,
      enqueued_at: Utc::now(),
    };

    let mut queue = self.queue.lock().await;
    queue.push_back(entry.clone());
    self.persist_queue(&queue).await;
    debug!(
      queue = %self.name,
      kind = entry.operation.kind(),
      entity = entry.operation.entity_id(),
      "queued offline write"
    );

    entry
  }

  /// Replay queued entries in order.
  ///
  /// `exec` returns the id the remote store assigned, if it reports one.
  ///
  /// - `Ok` removes the entry and moves on; a create filed under a new id points
  ///   the entries queued behind it at that id
  /// - a transient error stops the pass with the entry still at the head
  /// - any other error moves the entry to the rejected list and moves on
  pub async fn drain<F, Fut>(&self, mut exec: F) -> DrainReport
  where
    F: FnMut(OutboxEntry) -> Fut,
    Fut: Future<Output = Result<Option<String>, RemoteError>>,
  {
    if self.draining.swap(true, Ordering::SeqCst) {
      return DrainReport {
        skipped: true,
        ..DrainReport::default()
      };
    }
    let _guard = DrainGuard(&self.draining);

    let mut report = DrainReport::default();
    loop {
      let head = { self.queue.lock().await.front().cloned() };
      let Some(head) = head else {
        break;
      };

      match exec(head.clone()).await {
        Ok(assigned) => {
          self.remove_head(head.id).await;
          report.replayed += 1;
          if let (Operation::Create { entity_id, .. }, Some(server_id)) = (&head.operation, assigned) {
            if *entity_id != server_id {
              self.retarget(entity_id, &server_id).await;
              report.reassigned.push(Reassigned {
                scope: head.scope.clone(),
                client_id: entity_id.clone(),
                server_id,
              });
            }
          }
        }
        Err(e) if e.is_transient() => {
          debug!(queue = %self.name, error = %e, "outbox replay paused");
          report.stopped_by = Some(e);
          break;
        }
        Err(e) => {
          warn!(
            queue = %self.name,
            kind = head.operation.kind(),
            entity = head.operation.entity_id(),
            error = %e,
            "remote store rejected queued write"
          );
          self.remove_head(head.id).await;
          let entry = RejectedEntry {
            entry: head,
            reason: e.to_string(),
            rejected_at: Utc::now(),
          };
          let mut rejected = self.rejected.lock().await;
          rejected.push(entry.clone());
          save(&*self.storage, &rejected_key(&self.name), &*rejected).await;
          report.rejected.push(entry);
        }
      }
    }

    report.remaining = self.len().await;
    if report.replayed > 0 || !report.rejected.is_empty() {
      info!(
        queue = %self.name,
        replayed = report.replayed,
        rejected = report.rejected.len(),
        remaining = report.remaining,
        "outbox drained"
      );
    }
    report
  }

  /// Snapshot of queued entries in replay order.
  pub async fn pending(&self) -> Vec<OutboxEntry> {
    self.queue.lock().await.iter().cloned().collect()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  pub async fn rejected(&self) -> Vec<RejectedEntry> {
    self.rejected.lock().await.clone()
  }

  async fn remove_head(&self, id: Uuid) {
    let mut queue = self.queue.lock().await;
    if queue.front().map(|e| e.id) == Some(id) {
      queue.pop_front();
      self.persist_queue(&queue).await;
    }
  }

  async fn retarget(&self, from: &str, to: &str) {
    let mut queue = self.queue.lock().await;
    let mut moved = 0;
    for entry in queue.iter_mut().filter(|e| e.operation.entity_id() == from) {
      entry.operation.retarget(to);
      moved += 1;
    }
    if moved > 0 {
      self.persist_queue(&queue).await;
    }
    debug!(queue = %self.name, from, to, moved, "remote store assigned a new id");
  }

  async fn persist_queue(&self, queue: &VecDeque<OutboxEntry>) {
    save(&*self.storage, &queue_key(&self.name), queue).await;
  }
}

fn queue_key(name: &str) -> String {
  format!("outbox:{}", name)
}

fn rejected_key(name: &str) -> String {
  format!("outbox:{}:rejected", name)
}

async fn load<T: DeserializeOwned + Default>(storage: &dyn DurableStorage, key: &str) -> T {
  match storage.get(key).await {
    Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
      warn!(key, error = %e, "unreadable outbox data, starting empty");
      T::default()
    }),
    Ok(None) => T::default(),
    Err(e) => {
      warn!(key, error = %e, "failed to load outbox data, starting empty");
      T::default()
    }
  }
}

async fn save<T: Serialize + ?Sized>(storage: &dyn DurableStorage, key: &str, value: &T) {
  let bytes = match serde_json::to_vec(value) {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!(key, error = %e, "failed to serialize outbox data");
      return;
    }
  };
  if let Err(e) = storage.set(key, &bytes).await {
    warn!(key, error = %e, "failed to persist outbox data");
  }
}
