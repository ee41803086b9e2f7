//! The sync engine: one entity type, one synchronization domain.
//!
//! The engine owns the cache layer, the pending ledger, the outbox, the visible
//! state and the refetch coordinator, and exposes the handful of operations a UI
//! calls. Every state change is published whole on a `watch` channel, so a renderer
//! never observes half an update.
//!
//! Lock order is ledger (async) then view (sync). The view lock is never held across
//! an await.

use color_eyre::Result;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheLayer, CacheResult, CacheSource, LocalCacheStore};
use crate::config::SyncConfig;
use crate::event::{EventStream, SyncEvent};
use crate::ledger::{PendingLedger, PendingOps};
use crate::listener::ChangeListener;
use crate::model::{Entity, Scope, SyncDomain};
use crate::outbox::{DrainReport, Operation, Outbox, OutboxEntry, Reassigned, RejectedEntry};
use crate::placeholder::{same_identity, PlaceholderSet, Row, TempId, VisibleState};
use crate::push::PushChannel;
use crate::refetch::{RefetchCoordinator, SyncPhase};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::DurableStorage;

/// External collaborators, injected so tests can run without a network.
pub struct SyncContext<T: Entity> {
  pub storage: Arc<dyn DurableStorage>,
  pub remote: Arc<dyn RemoteStore<T>>,
  pub push: Option<Arc<dyn PushChannel>>,
}

/// Tuning for one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub domain: SyncDomain,
  pub debounce: Duration,
  pub requeue_delay: Duration,
  /// Age after which cached detail records are refreshed
  pub stale_time: chrono::Duration,
  pub watched_tables: BTreeSet<String>,
}

impl EngineOptions {
  pub fn new(domain: SyncDomain) -> Self {
    Self::from_config(&SyncConfig::default(), domain)
  }

  pub fn from_config(config: &SyncConfig, domain: SyncDomain) -> Self {
    Self {
      domain,
      debounce: config.debounce(),
      requeue_delay: config.requeue_delay(),
      stale_time: chrono::Duration::seconds(config.stale_secs),
      watched_tables: config.watched_tables.clone(),
    }
  }
}

/// How an add ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
  /// The remote store accepted it
  Created(String),
  /// The remote store was unreachable; the create waits in the outbox
  Queued(String),
  /// A row with the same identity is already visible; nothing happened
  AlreadyPresent,
}

/// Failure of a foreground action, reported to the caller right away.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
  #[error("no scope is open")]
  NoActiveScope,
  #[error("{0}")]
  Rejected(RemoteError),
  #[error("invalid record: {0}")]
  Invalid(String),
}

/// Where a write went.
enum Submitted {
  Sent(Option<String>),
  Queued,
}

/// State behind the published [`VisibleState`].
struct ViewModel<T> {
  scope: Option<Scope>,
  confirmed: Vec<T>,
  placeholders: PlaceholderSet,
  source: CacheSource,
  syncing: bool,
  last_error: Option<String>,
}

impl<T: Entity> ViewModel<T> {
  fn new() -> Self {
    Self {
      scope: None,
      confirmed: Vec::new(),
      placeholders: PlaceholderSet::new(),
      source: CacheSource::Empty,
      syncing: false,
      last_error: None,
    }
  }

  fn contains_identity(&self, display_value: &str) -> bool {
    self.placeholders.matches(display_value)
      || self
        .confirmed
        .iter()
        .any(|entity| same_identity(&entity.display_value(), display_value))
  }

  fn snapshot(&self) -> VisibleState<T> {
    let mut rows: Vec<Row<T>> = self
      .confirmed
      .iter()
      .filter(|entity| !self.placeholders.covers(entity.id(), &entity.display_value()))
      .cloned()
      .map(Row::Confirmed)
      .collect();
    rows.extend(self.placeholders.iter().cloned().map(Row::Placeholder));

    VisibleState {
      scope: self.scope.clone(),
      rows,
      source: self.source,
      syncing: self.syncing,
      last_error: self.last_error.clone(),
    }
  }
}

struct Inner<T: Entity> {
  domain: SyncDomain,
  remote: Arc<dyn RemoteStore<T>>,
  cache: CacheLayer,
  ledger: tokio::sync::Mutex<PendingLedger>,
  outbox: Outbox,
  view: Mutex<ViewModel<T>>,
  visible: watch::Sender<VisibleState<T>>,
  /// Entities of unconfirmed adds, until a fetch reports them
  local: Mutex<HashMap<String, T>>,
  online: AtomicBool,
  /// Sender of the current subscriber's stream; notices are dropped without one
  events: Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>,
  coordinator: RefetchCoordinator,
}

/// Offline-tolerant, optimistic view over one remote collection.
pub struct SyncEngine<T: Entity> {
  inner: Arc<Inner<T>>,
  listener: Mutex<Option<ChangeListener>>,
}

impl<T: Entity> SyncEngine<T> {
  /// Build an engine and, when a push channel is given, subscribe to it.
  ///
  /// Outbox entries left by a previous run are restored; they replay after the
  /// next successful fetch.
  pub async fn new(context: SyncContext<T>, options: EngineOptions) -> Result<Self> {
    let outbox_name = format!("{}/{}", options.domain.id(), T::table());
    let outbox = Outbox::open(outbox_name, context.storage.clone()).await;
    let cache =
      CacheLayer::new(LocalCacheStore::new(context.storage.clone())).with_stale_time(options.stale_time);
    let (visible, _) = watch::channel(VisibleState::default());

    let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
      let weak = weak.clone();
      let coordinator = RefetchCoordinator::new(options.debounce, options.requeue_delay, move || {
        let weak = weak.clone();
        async move {
          match weak.upgrade() {
            Some(inner) => inner.refresh().await,
            None => Ok(()),
          }
        }
      });

      Inner {
        domain: options.domain.clone(),
        remote: context.remote,
        cache,
        ledger: tokio::sync::Mutex::new(PendingLedger::new(context.storage.clone())),
        outbox,
        view: Mutex::new(ViewModel::new()),
        visible,
        local: Mutex::new(HashMap::new()),
        online: AtomicBool::new(true),
        events: Mutex::new(None),
        coordinator,
      }
    });

    let listener = match context.push {
      Some(channel) => Some(
        ChangeListener::start(
          channel,
          options.domain.clone(),
          options.watched_tables.clone(),
          inner.coordinator.clone(),
        )
        .await?,
      ),
      None => None,
    };

    info!(domain = %options.domain, table = T::table(), "sync engine started");

    Ok(Self {
      inner,
      listener: Mutex::new(listener),
    })
  }

  /// Make `scope` the visible one.
  ///
  /// The cached list (with pending operations overlaid) is published before the
  /// network is asked; the call returns once the refresh has run.
  pub async fn open_scope(&self, scope: Scope) {
    self.inner.open_scope(scope).await;
  }

  /// Add a record with a placeholder shown until the remote store answers.
  pub async fn optimistic_add(&self, entity: T) -> Result<AddOutcome, ActionError> {
    self.inner.optimistic_add(entity).await
  }

  /// Hide a record immediately and delete it remotely.
  pub async fn optimistic_delete(&self, id: &str) -> Result<(), ActionError> {
    self.inner.optimistic_delete(id).await
  }

  /// Patch a record's fields, showing the change immediately.
  pub async fn update(&self, id: &str, patch: Value) -> Result<(), ActionError> {
    self.inner.update(id, patch).await
  }

  /// Ask for a debounced refetch.
  pub fn schedule_refetch(&self) {
    self.inner.coordinator.schedule();
  }

  /// Refetch now, or queue one more run if a fetch is in flight.
  pub async fn refresh_now(&self) {
    self.inner.coordinator.run_now().await;
  }

  /// One record, from the cache when fresh, else the network.
  pub async fn details(&self, id: &str) -> Result<CacheResult<Option<T>>, RemoteError> {
    self.inner.details(id).await
  }

  /// Report a connectivity change seen by the platform.
  ///
  /// Coming back online replays the outbox and schedules a refetch.
  pub async fn set_online(&self, online: bool) {
    if self.inner.note_online(online) && online {
      self.inner.drain_outbox().await;
      self.inner.coordinator.schedule();
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Replay queued writes now.
  pub async fn drain_outbox(&self) -> DrainReport {
    self.inner.drain_outbox().await
  }

  /// Queued writes in replay order.
  pub async fn outbox(&self) -> Vec<OutboxEntry> {
    self.inner.outbox.pending().await
  }

  /// Queued writes the remote store refused.
  pub async fn rejected_writes(&self) -> Vec<RejectedEntry> {
    self.inner.outbox.rejected().await
  }

  /// Unconfirmed operations of the open scope.
  pub async fn pending_ops(&self) -> PendingOps {
    let mut ledger = self.inner.ledger.lock().await;
    match ledger.active().cloned() {
      Some(scope) => ledger.pending(&scope).await,
      None => PendingOps::default(),
    }
  }

  pub fn visible(&self) -> watch::Receiver<VisibleState<T>> {
    self.inner.visible.subscribe()
  }

  pub fn phase(&self) -> watch::Receiver<SyncPhase> {
    self.inner.coordinator.phase()
  }

  /// Subscribe to notices raised from now on.
  ///
  /// A new subscription ends the previous stream.
  pub fn events(&self) -> EventStream {
    let (tx, stream) = EventStream::channel();
    *lock(&self.inner.events) = Some(tx);
    stream
  }

  /// Stop listening and cancel pending refetches.
  pub fn shutdown(&self) {
    if let Some(listener) = lock(&self.listener).take() {
      listener.stop();
    }
    self.inner.coordinator.shutdown();
    info!(domain = %self.inner.domain, "sync engine stopped");
  }
}

impl<T: Entity> Inner<T> {
  async fn open_scope(&self, scope: Scope) {
    {
      let mut ledger = self.ledger.lock().await;
      ledger.activate(&scope).await;

      let key = CacheKey::list(T::entity_type(), &scope);
      let (entities, source) = match self.cache.cached_list::<T>(&key).await {
        Some(cached) => (cached.data, cached.source),
        None => (Vec::new(), CacheSource::Empty),
      };
      let effective = ledger.effective(&scope, &ids_of(&entities)).await;
      let confirmed = self.materialize(&effective, entities).await;

      self.update_view(|view| {
        if view.scope.as_ref() != Some(&scope) {
          view.placeholders.clear();
        }
        view.scope = Some(scope.clone());
        view.confirmed = confirmed;
        view.source = source;
        view.syncing = false;
        view.last_error = None;
      });
    }

    info!(scope = %scope, "scope opened");
    self.coordinator.run_now().await;
  }

  /// One fetch + reconcile pass for whatever scope is open when it runs.
  async fn refresh(&self) -> Result<(), String> {
    let Some(scope) = self.active_scope() else {
      debug!("no scope open, skipping refetch");
      return Ok(());
    };
    self.update_view_if(&scope, |view| view.syncing = true);

    let key = CacheKey::list(T::entity_type(), &scope);
    let remote = self.remote.clone();
    let fetch_scope = scope.clone();
    let fetched = self
      .cache
      .fetch_list(&key, move || async move { remote.fetch_list(&fetch_scope).await })
      .await;

    let result = match fetched {
      Ok(result) => result,
      Err(e) => {
        if e.is_transient() {
          self.note_online(false);
        }
        let reason = e.to_string();
        self.update_view_if(&scope, |view| {
          view.syncing = false;
          view.last_error = Some(reason.clone());
        });
        self.emit(SyncEvent::RefreshFailed {
          scope,
          reason: reason.clone(),
        });
        return Err(reason);
      }
    };

    let authoritative = result.source == CacheSource::Network;
    self.note_online(authoritative);
    let ids = ids_of(&result.data);

    {
      let mut ledger = self.ledger.lock().await;
      if ledger.active() != Some(&scope) {
        debug!(scope = %scope, "scope changed during fetch, discarding result");
        return Ok(());
      }

      let effective = if authoritative {
        ledger.reconcile(&scope, &ids).await
      } else {
        ledger.effective(&scope, &ids).await
      };
      if authoritative {
        let mut local = self.local_entities();
        for id in &ids {
          local.remove(id);
        }
        drop(local);
      }
      let confirmed = self.materialize(&effective, result.data).await;

      let source = result.source;
      self.update_view_if(&scope, |view| {
        view.confirmed = confirmed;
        view.source = source;
        view.syncing = false;
        view.last_error = None;
      });
    }
    debug!(scope = %scope, rows = ids.len(), source = ?result.source, "refetch applied");

    if authoritative && !self.outbox.is_empty().await {
      self.drain_outbox().await;
    }
    Ok(())
  }

  async fn optimistic_add(&self, entity: T) -> Result<AddOutcome, ActionError> {
    let display_value = entity.display_value();
    let payload = serde_json::to_value(&entity).map_err(|e| ActionError::Invalid(e.to_string()))?;

    let (scope, temp_id) = {
      let mut view = self.view();
      let scope = view.scope.clone().ok_or(ActionError::NoActiveScope)?;
      if view.contains_identity(&display_value) {
        debug!(display_value, "already visible, ignoring add");
        return Ok(AddOutcome::AlreadyPresent);
      }
      let temp_id = view.placeholders.begin_for(display_value.clone(), entity.id());
      self.publish(&view);
      (scope, temp_id)
    };

    let operation = Operation::Create {
      entity_id: entity.id().to_string(),
      payload,
    };
    match self.submit(&scope, operation).await {
      Ok(Submitted::Sent(id)) => {
        let id = id.unwrap_or_else(|| entity.id().to_string());
        let entity = if id == entity.id() {
          entity
        } else {
          entity.with_id(id.clone())
        };
        self.confirm_add(&scope, &temp_id, entity).await;
        self.coordinator.schedule();
        Ok(AddOutcome::Created(id))
      }
      Ok(Submitted::Queued) => {
        let id = entity.id().to_string();
        self.confirm_add(&scope, &temp_id, entity).await;
        self.emit(SyncEvent::QueuedOffline {
          display_value,
          operation: "create",
        });
        Ok(AddOutcome::Queued(id))
      }
      Err(e) => {
        self.update_view(|view| {
          view.placeholders.fail(&temp_id);
        });
        warn!(display_value, error = %e, "add rejected");
        self.emit(SyncEvent::ActionFailed {
          display_value,
          reason: e.to_string(),
        });
        Err(ActionError::Rejected(e))
      }
    }
  }

  /// Record an add and swap its placeholder for the entity in one publish.
  async fn confirm_add(&self, scope: &Scope, temp_id: &TempId, entity: T) {
    let id = entity.id().to_string();
    self.cache.put_one(&entity).await;
    self.local_entities().insert(id.clone(), entity.clone());

    let mut ledger = self.ledger.lock().await;
    ledger.record_add(scope, &id).await;
    self.update_view(|view| {
      view.placeholders.resolve(temp_id);
      if view.scope.as_ref() == Some(scope) && !view.confirmed.iter().any(|e| e.id() == id) {
        view.confirmed.push(entity);
      }
    });
  }

  async fn optimistic_delete(&self, id: &str) -> Result<(), ActionError> {
    let scope = self.active_scope().ok_or(ActionError::NoActiveScope)?;

    let (removed, was_pending_add) = {
      let mut ledger = self.ledger.lock().await;
      let was_pending_add = ledger.pending(&scope).await.adds.contains(id);
      ledger.record_delete(&scope, id).await;

      let mut removed = None;
      self.update_view_if(&scope, |view| {
        if let Some(index) = view.confirmed.iter().position(|e| e.id() == id) {
          removed = Some(view.confirmed.remove(index));
        }
      });
      (removed, was_pending_add)
    };
    let local = self.local_entities().remove(id);
    let display_value = removed
      .as_ref()
      .map(|e| e.display_value())
      .unwrap_or_else(|| id.to_string());

    let operation = Operation::Delete {
      entity_id: id.to_string(),
    };
    match self.submit(&scope, operation).await {
      Ok(Submitted::Sent(_)) => {
        self.cache.forget_one::<T>(id).await;
        self.coordinator.schedule();
        Ok(())
      }
      Ok(Submitted::Queued) => {
        self.emit(SyncEvent::QueuedOffline {
          display_value,
          operation: "delete",
        });
        Ok(())
      }
      Err(e) => {
        {
          let mut ledger = self.ledger.lock().await;
          if was_pending_add {
            ledger.record_add(&scope, id).await;
          } else {
            ledger.forget(&scope, id).await;
          }
          if let Some(entity) = local {
            self.local_entities().insert(id.to_string(), entity);
          }
          if let Some(entity) = removed {
            self.update_view_if(&scope, |view| {
              if !view.confirmed.iter().any(|e| e.id() == id) {
                view.confirmed.push(entity);
              }
            });
          }
        }
        warn!(id, error = %e, "delete rejected");
        self.emit(SyncEvent::ActionFailed {
          display_value,
          reason: e.to_string(),
        });
        self.coordinator.schedule();
        Err(ActionError::Rejected(e))
      }
    }
  }

  async fn update(&self, id: &str, patch: Value) -> Result<(), ActionError> {
    let scope = self.active_scope().ok_or(ActionError::NoActiveScope)?;

    let current = self.view().confirmed.iter().find(|e| e.id() == id).cloned();
    if let Some(entity) = &current {
      let patched = apply_patch(entity, &patch)?;
      self.replace_entity(&scope, patched).await;
    }
    let display_value = current
      .as_ref()
      .map(|e| e.display_value())
      .unwrap_or_else(|| id.to_string());

    let operation = Operation::Update {
      entity_id: id.to_string(),
      patch,
    };
    match self.submit(&scope, operation).await {
      Ok(Submitted::Sent(_)) => {
        self.coordinator.schedule();
        Ok(())
      }
      Ok(Submitted::Queued) => {
        self.emit(SyncEvent::QueuedOffline {
          display_value,
          operation: "update",
        });
        Ok(())
      }
      Err(e) => {
        if let Some(original) = current {
          self.replace_entity(&scope, original).await;
        }
        warn!(id, error = %e, "update rejected");
        self.emit(SyncEvent::ActionFailed {
          display_value,
          reason: e.to_string(),
        });
        self.coordinator.schedule();
        Err(ActionError::Rejected(e))
      }
    }
  }

  async fn replace_entity(&self, scope: &Scope, entity: T) {
    self.cache.put_one(&entity).await;
    let id = entity.id().to_string();
    {
      let mut local = self.local_entities();
      if local.contains_key(&id) {
        local.insert(id.clone(), entity.clone());
      }
    }
    self.update_view_if(scope, |view| {
      if let Some(slot) = view.confirmed.iter_mut().find(|e| e.id() == id) {
        *slot = entity;
      }
    });
  }

  async fn details(&self, id: &str) -> Result<CacheResult<Option<T>>, RemoteError> {
    let remote = self.remote.clone();
    let lookup = id.to_string();
    self
      .cache
      .fetch_one(id, move || async move { remote.fetch_details(&lookup).await })
      .await
  }

  /// Send a write, or queue it when the remote store is unreachable.
  ///
  /// While older writes are still queued, new ones queue behind them so replay
  /// keeps the user's order.
  async fn submit(&self, scope: &Scope, operation: Operation) -> Result<Submitted, RemoteError> {
    if !self.outbox.is_empty().await {
      self.outbox.enqueue_in(Some(scope.clone()), operation).await;
      return Ok(Submitted::Queued);
    }

    match execute(&*self.remote, &operation).await {
      Ok(id) => Ok(Submitted::Sent(id)),
      Err(e) if e.is_transient() => {
        debug!(kind = operation.kind(), error = %e, "remote unreachable, queueing write");
        self.note_online(false);
        self.outbox.enqueue_in(Some(scope.clone()), operation).await;
        Ok(Submitted::Queued)
      }
      Err(e) => Err(e),
    }
  }

  async fn drain_outbox(&self) -> DrainReport {
    let remote = self.remote.clone();
    let report = self
      .outbox
      .drain(|entry| {
        let remote = remote.clone();
        async move { execute(&*remote, &entry.operation).await }
      })
      .await;
    if report.skipped {
      return report;
    }

    if report.stopped_by.is_some() {
      self.note_online(false);
    }
    if !report.reassigned.is_empty() {
      let mut ledger = self.ledger.lock().await;
      for moved in &report.reassigned {
        if let Some(scope) = &moved.scope {
          ledger.rekey(scope, &moved.client_id, &moved.server_id).await;
        }
        self.adopt_server_id(moved).await;
      }
    }
    if report.replayed > 0 {
      self.emit(SyncEvent::OutboxReplayed {
        replayed: report.replayed,
        remaining: report.remaining,
      });
    }
    if !report.rejected.is_empty() {
      let mut ledger = self.ledger.lock().await;
      for rejected in &report.rejected {
        let operation = &rejected.entry.operation;
        if matches!(operation, Operation::Update { .. }) {
          continue;
        }
        if let Some(scope) = &rejected.entry.scope {
          ledger.forget(scope, operation.entity_id()).await;
        }
        self.local_entities().remove(operation.entity_id());
      }
      drop(ledger);
      self.emit(SyncEvent::OutboxRejected {
        count: report.rejected.len(),
      });
    }
    if report.replayed > 0 || !report.rejected.is_empty() {
      self.coordinator.schedule();
    }
    report
  }

  /// Re-key the local copies of a replayed create to the id the remote store chose.
  async fn adopt_server_id(&self, moved: &Reassigned) {
    let (from, to) = (moved.client_id.as_str(), moved.server_id.as_str());
    let held = self.local_entities().remove(from);
    let entity = match held {
      Some(entity) => Some(entity),
      None => self.cache.cached_one::<T>(from).await,
    };
    self.cache.forget_one::<T>(from).await;

    let Some(entity) = entity.map(|e| e.with_id(to.to_string())) else {
      debug!(from, to, "no local copy to re-key");
      return;
    };
    self.cache.put_one(&entity).await;
    self.local_entities().insert(to.to_string(), entity.clone());
    self.update_view(|view| {
      let already_fetched = view.confirmed.iter().any(|e| e.id() == to);
      if already_fetched {
        view.confirmed.retain(|e| e.id() != from);
      } else if let Some(slot) = view.confirmed.iter_mut().find(|e| e.id() == from) {
        *slot = entity;
      }
    });
    debug!(from, to, "adopted server id");
  }

  /// Effective ids to entities: fetched ones first, then locally known adds.
  async fn materialize(&self, effective: &[String], fetched: Vec<T>) -> Vec<T> {
    let mut by_id: HashMap<String, T> = fetched
      .into_iter()
      .map(|entity| (entity.id().to_string(), entity))
      .collect();

    let mut confirmed = Vec::with_capacity(effective.len());
    for id in effective {
      if let Some(entity) = by_id.remove(id) {
        confirmed.push(entity);
        continue;
      }
      let known = self.local_entities().get(id).cloned();
      match known {
        Some(entity) => confirmed.push(entity),
        None => match self.cache.cached_one::<T>(id).await {
          Some(entity) => confirmed.push(entity),
          None => debug!(id, "no local copy of pending add"),
        },
      }
    }
    confirmed
  }

  /// Record connectivity, returning whether it changed.
  fn note_online(&self, online: bool) -> bool {
    let was = self.online.swap(online, Ordering::SeqCst);
    if was != online {
      info!(online, "connectivity changed");
      self.emit(SyncEvent::Online(online));
    }
    was != online
  }

  fn active_scope(&self) -> Option<Scope> {
    self.view().scope.clone()
  }

  fn emit(&self, event: SyncEvent) {
    let mut events = lock(&self.events);
    let delivered = events.as_ref().is_some_and(|tx| tx.send(event).is_ok());
    if !delivered {
      *events = None;
    }
  }

  fn view(&self) -> MutexGuard<'_, ViewModel<T>> {
    lock(&self.view)
  }

  fn local_entities(&self) -> MutexGuard<'_, HashMap<String, T>> {
    lock(&self.local)
  }

  fn publish(&self, view: &ViewModel<T>) {
    self.visible.send_replace(view.snapshot());
  }

  fn update_view(&self, f: impl FnOnce(&mut ViewModel<T>)) {
    let mut view = self.view();
    f(&mut view);
    self.publish(&view);
  }

  /// Apply `f` only if `scope` is still the visible one.
  fn update_view_if(&self, scope: &Scope, f: impl FnOnce(&mut ViewModel<T>)) {
    let mut view = self.view();
    if view.scope.as_ref() == Some(scope) {
      f(&mut view);
      self.publish(&view);
    }
  }
}

/// Perform one write against the remote store, returning the id a create was filed
/// under.
///
/// A delete the store answers with `NotFound` counts as refused: row-level policies
/// report a hidden row the same way as a missing one.
async fn execute<T: Entity>(
  remote: &dyn RemoteStore<T>,
  operation: &Operation,
) -> Result<Option<String>, RemoteError> {
  match operation {
    Operation::Create { payload, .. } => {
      let entity: T =
        serde_json::from_value(payload.clone()).map_err(|e| RemoteError::Decode(e.to_string()))?;
      remote.create(&entity).await.map(Some)
    }
    Operation::Update { entity_id, patch } => remote.update(entity_id, patch).await.map(|_| None),
    Operation::Delete { entity_id } => remote.delete(entity_id).await.map(|_| None),
  }
}

/// Shallow JSON merge of `patch` into `entity`.
fn apply_patch<T: Entity>(entity: &T, patch: &Value) -> Result<T, ActionError> {
  let fields = patch
    .as_object()
    .ok_or_else(|| ActionError::Invalid("patch must be a JSON object".into()))?;
  let mut value = serde_json::to_value(entity).map_err(|e| ActionError::Invalid(e.to_string()))?;
  if let Some(target) = value.as_object_mut() {
    for (key, field) in fields {
      target.insert(key.clone(), field.clone());
    }
  }
  serde_json::from_value(value).map_err(|e| ActionError::Invalid(e.to_string()))
}

fn ids_of<T: Entity>(entities: &[T]) -> Vec<String> {
  entities.iter().map(|e| e.id().to_string()).collect()
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
