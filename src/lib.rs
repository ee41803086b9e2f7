//! Offline-tolerant, optimistic synchronization of congregation field-service
//! records against a hosted backend.
//!
//! A [`SyncEngine`](engine::SyncEngine) keeps one visible list per scope. Reads paint
//! from the local cache first, writes show up immediately and queue in a durable
//! outbox while the backend is unreachable, and change notifications trigger a
//! debounced refetch whose result is reconciled with the operations the server has
//! not caught up with yet.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod event;
pub mod ledger;
pub mod listener;
pub mod logging;
pub mod model;
pub mod outbox;
pub mod placeholder;
pub mod push;
pub mod refetch;
pub mod remote;
pub mod storage;

pub use engine::{ActionError, AddOutcome, EngineOptions, SyncContext, SyncEngine};
pub use model::{Entity, Scope, SyncDomain};
