//! Pending operation ledger and reconciliation.
//!
//! For every scope the ledger remembers which ids the user added or deleted locally
//! that the server has not confirmed yet. Merging those sets into each freshly
//! fetched list keeps a slow server from resurrecting a deleted row or hiding a
//! newly added one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::Scope;
use crate::storage::DurableStorage;

/// Unconfirmed local operations for one scope.
///
/// An id is never in both sets: recording it in one removes it from the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOps {
  #[serde(default)]
  pub adds: BTreeSet<String>,
  #[serde(default)]
  pub deletes: BTreeSet<String>,
}

impl PendingOps {
  pub fn is_empty(&self) -> bool {
    self.adds.is_empty() && self.deletes.is_empty()
  }

  fn add(&mut self, id: &str) {
    self.deletes.remove(id);
    self.adds.insert(id.to_string());
  }

  fn delete(&mut self, id: &str) {
    self.adds.remove(id);
    self.deletes.insert(id.to_string());
  }

  fn forget(&mut self, id: &str) {
    self.adds.remove(id);
    self.deletes.remove(id);
  }

  /// `(ids - deletes) ∪ adds`, keeping the order of `ids` and appending new adds.
  pub fn apply(&self, ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut effective: Vec<String> = ids
      .iter()
      .filter(|id| !self.deletes.contains(*id))
      .filter(|id| seen.insert((*id).clone()))
      .cloned()
      .collect();

    for id in &self.adds {
      if seen.insert(id.clone()) {
        effective.push(id.clone());
      }
    }
    effective
  }
}

/// Per-scope ledger persisted to durable storage on every mutation.
pub struct PendingLedger {
  storage: Arc<dyn DurableStorage>,
  scopes: HashMap<Scope, PendingOps>,
  active: Option<Scope>,
}

impl PendingLedger {
  pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
    Self {
      storage,
      scopes: HashMap::new(),
      active: None,
    }
  }

  fn storage_key(scope: &Scope) -> String {
    format!("ledger:{}", scope.key())
  }

  /// Make `scope` the active one.
  ///
  /// Switching to a different scope reloads its sets from storage. Re-activating the
  /// scope that is already active keeps the in-memory sets, which are authoritative
  /// while the scope is on screen.
  pub async fn activate(&mut self, scope: &Scope) {
    if self.active.as_ref() == Some(scope) {
      return;
    }
    let ops = self.load(scope).await;
    debug!(scope = %scope, adds = ops.adds.len(), deletes = ops.deletes.len(), "ledger activated");
    self.scopes.insert(scope.clone(), ops);
    self.active = Some(scope.clone());
  }

  pub fn active(&self) -> Option<&Scope> {
    self.active.as_ref()
  }

  pub async fn record_add(&mut self, scope: &Scope, id: &str) {
    self.mutate(scope, |ops| ops.add(id)).await;
  }

  pub async fn record_delete(&mut self, scope: &Scope, id: &str) {
    self.mutate(scope, |ops| ops.delete(id)).await;
  }

  /// Stop tracking `id` entirely, used to roll back a rejected operation.
  pub async fn forget(&mut self, scope: &Scope, id: &str) {
    self.mutate(scope, |ops| ops.forget(id)).await;
  }

  /// Move a pending add to the id the remote store filed it under.
  pub async fn rekey(&mut self, scope: &Scope, from: &str, to: &str) {
    self
      .mutate(scope, |ops| {
        if ops.adds.remove(from) {
          ops.add(to);
        }
      })
      .await;
  }

  /// Current pending sets for a scope.
  pub async fn pending(&mut self, scope: &Scope) -> PendingOps {
    self.ensure_loaded(scope).await;
    self.scopes.get(scope).cloned().unwrap_or_default()
  }

  /// Overlay pending operations on a non-authoritative list (e.g. the cached one)
  /// without shrinking the ledger.
  pub async fn effective(&mut self, scope: &Scope, ids: &[String]) -> Vec<String> {
    self.pending(scope).await.apply(ids)
  }

  /// Merge freshly fetched authoritative ids with the pending operations.
  ///
  /// Adds the server now reports and deletes it no longer reports are dropped from
  /// the ledger; the result is `(authoritative - deletes) ∪ adds`.
  pub async fn reconcile(&mut self, scope: &Scope, authoritative: &[String]) -> Vec<String> {
    let present: HashSet<&str> = authoritative.iter().map(String::as_str).collect();
    let mut effective = Vec::new();

    self
      .mutate(scope, |ops| {
        let confirmed_adds = ops.adds.iter().filter(|id| present.contains(id.as_str())).count();
        let confirmed_deletes = ops.deletes.iter().filter(|id| !present.contains(id.as_str())).count();

        ops.adds.retain(|id| !present.contains(id.as_str()));
        ops.deletes.retain(|id| present.contains(id.as_str()));

        if confirmed_adds + confirmed_deletes > 0 {
          debug!(
            scope = %scope,
            confirmed_adds,
            confirmed_deletes,
            "server caught up with pending operations"
          );
        }
        effective = ops.apply(authoritative);
      })
      .await;

    effective
  }

  async fn ensure_loaded(&mut self, scope: &Scope) {
    if !self.scopes.contains_key(scope) {
      let ops = self.load(scope).await;
      self.scopes.insert(scope.clone(), ops);
    }
  }

  async fn mutate(&mut self, scope: &Scope, f: impl FnOnce(&mut PendingOps)) {
    self.ensure_loaded(scope).await;
    let ops = self.scopes.entry(scope.clone()).or_default();
    let before = ops.clone();
    f(ops);
    if *ops == before {
      return;
    }
    let snapshot = ops.clone();
    self.persist(scope, &snapshot).await;
  }

  async fn load(&self, scope: &Scope) -> PendingOps {
    let key = Self::storage_key(scope);
    match self.storage.get(&key).await {
      Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(key, error = %e, "unreadable ledger, starting empty");
        PendingOps::default()
      }),
      Ok(None) => PendingOps::default(),
      Err(e) => {
        warn!(key, error = %e, "failed to load ledger, starting empty");
        PendingOps::default()
      }
    }
  }

  async fn persist(&self, scope: &Scope, ops: &PendingOps) {
    let key = Self::storage_key(scope);
    let result = if ops.is_empty() {
      self.storage.delete(&key).await
    } else {
      match serde_json::to_vec(ops) {
        Ok(bytes) => self.storage.set(&key, &bytes).await,
        Err(e) => {
          warn!(key, error = %e, "failed to serialize ledger");
          return;
        }
      }
    };

    if let Err(e) = result {
      warn!(key, error = %e, "failed to persist ledger");
    }
  }
}
