//! Boundary to the authoritative remote store.

#[cfg(test)]
pub(crate) mod fake;
mod rest;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Entity, Scope};

pub use rest::RestRemoteStore;

/// Why a remote call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// The request never reached the server (no network, DNS, timeout)
  #[error("remote store unreachable: {0}")]
  Offline(String),
  /// The server answered but is temporarily unable to serve
  #[error("remote store unavailable (HTTP {status})")]
  Unavailable { status: u16 },
  /// The server refused the request; retrying will not help
  #[error("rejected by remote store: {message}")]
  Rejected { status: u16, message: String },
  #[error("not found: {0}")]
  NotFound(String),
  /// The response could not be understood
  #[error("unexpected response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// Transient failures route writes to the outbox and reads to the cache.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Offline(_) | Self::Unavailable { .. })
  }
}

/// The authoritative store for records of type `T`.
///
/// Every call is a network round trip; an unreachable server must surface as a
/// transient [`RemoteError`].
#[async_trait]
pub trait RemoteStore<T: Entity>: Send + Sync {
  /// Authoritative list for a scope.
  async fn fetch_list(&self, scope: &Scope) -> Result<Vec<T>, RemoteError>;

  async fn fetch_details(&self, id: &str) -> Result<Option<T>, RemoteError>;

  /// Create (or idempotently re-create) `entity`, returning its id.
  async fn create(&self, entity: &T) -> Result<String, RemoteError>;

  async fn update(&self, id: &str, patch: &serde_json::Value) -> Result<(), RemoteError>;

  async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}
