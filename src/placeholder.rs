//! Optimistic placeholders and the rows the UI renders.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheSource;
use crate::model::{Entity, Scope};

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a row that does not exist remotely yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(u64);

impl TempId {
  fn next() -> Self {
    Self(NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for TempId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "temp-{}", self.0)
  }
}

/// A row shown right after a user action, before the remote create returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
  pub temp_id: TempId,
  pub display_value: String,
  pub created_at: DateTime<Utc>,
}

/// One visible row.
#[derive(Debug, Clone, PartialEq)]
pub enum Row<T> {
  Placeholder(Placeholder),
  Confirmed(T),
}

impl<T: Entity> Row<T> {
  pub fn display_value(&self) -> String {
    match self {
      Row::Placeholder(p) => p.display_value.clone(),
      Row::Confirmed(entity) => entity.display_value(),
    }
  }

  /// Remote id, if the row has one.
  pub fn entity_id(&self) -> Option<&str> {
    match self {
      Row::Placeholder(_) => None,
      Row::Confirmed(entity) => Some(entity.id()),
    }
  }

  pub fn is_placeholder(&self) -> bool {
    matches!(self, Row::Placeholder(_))
  }
}

/// Everything the UI needs to render one scope.
#[derive(Debug, Clone)]
pub struct VisibleState<T> {
  pub scope: Option<Scope>,
  pub rows: Vec<Row<T>>,
  pub source: CacheSource,
  /// A fetch for this scope is running
  pub syncing: bool,
  /// Last background failure, for an informational notice
  pub last_error: Option<String>,
}

impl<T> Default for VisibleState<T> {
  fn default() -> Self {
    Self {
      scope: None,
      rows: Vec::new(),
      source: CacheSource::Empty,
      syncing: false,
      last_error: None,
    }
  }
}

impl<T: Entity> VisibleState<T> {
  /// Confirmed ids in display order.
  pub fn ids(&self) -> Vec<String> {
    self
      .rows
      .iter()
      .filter_map(|row| row.entity_id().map(String::from))
      .collect()
  }

  pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
    self.rows.iter().filter_map(|row| match row {
      Row::Placeholder(p) => Some(p),
      Row::Confirmed(_) => None,
    })
  }
}

/// Identity comparison used to stop double adds: trimmed, case-insensitive.
pub fn same_identity(a: &str, b: &str) -> bool {
  a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Pending placeholders in creation order.
#[derive(Debug, Default)]
pub struct PlaceholderSet {
  pending: Vec<Placeholder>,
  /// Entity id each placeholder will become, when the caller chose it up front
  targets: HashMap<TempId, String>,
}

impl PlaceholderSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a pending placeholder. No I/O happens here.
  pub fn begin(&mut self, display_value: impl Into<String>) -> TempId {
    let placeholder = Placeholder {
      temp_id: TempId::next(),
      display_value: display_value.into(),
      created_at: Utc::now(),
    };
    let temp_id = placeholder.temp_id.clone();
    self.pending.push(placeholder);
    temp_id
  }

  /// Like [`begin`](Self::begin), for a create whose entity id is already known.
  ///
  /// Until it resolves, a confirmed row with that id is hidden behind the
  /// placeholder so the action never shows up twice.
  pub fn begin_for(&mut self, display_value: impl Into<String>, entity_id: &str) -> TempId {
    let temp_id = self.begin(display_value);
    self.targets.insert(temp_id.clone(), entity_id.to_string());
    temp_id
  }

  /// Whether a pending placeholder stands in for `entity_id`.
  pub fn awaits(&self, entity_id: &str) -> bool {
    self.targets.values().any(|target| target == entity_id)
  }

  /// Whether a confirmed row should stay hidden behind a pending placeholder.
  ///
  /// Matches by id when the create's id is known, and by identity otherwise, since
  /// the remote store may file the record under an id of its own.
  pub fn covers(&self, entity_id: &str, display_value: &str) -> bool {
    self.awaits(entity_id) || self.matches(display_value)
  }

  /// Take a placeholder out because its real entity arrived.
  ///
  /// The caller inserts the entity in the same state update.
  pub fn resolve(&mut self, temp_id: &TempId) -> Option<Placeholder> {
    self.take(temp_id)
  }

  /// Take a placeholder out because its create failed.
  pub fn fail(&mut self, temp_id: &TempId) -> Option<Placeholder> {
    self.take(temp_id)
  }

  pub fn matches(&self, display_value: &str) -> bool {
    self
      .pending
      .iter()
      .any(|p| same_identity(&p.display_value, display_value))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Placeholder> {
    self.pending.iter()
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn clear(&mut self) {
    self.pending.clear();
    self.targets.clear();
  }

  fn take(&mut self, temp_id: &TempId) -> Option<Placeholder> {
    self.targets.remove(temp_id);
    let index = self.pending.iter().position(|p| &p.temp_id == temp_id)?;
    Some(self.pending.remove(index))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_begin_resolve_fail() {
    let mut set = PlaceholderSet::new();
    let jane = set.begin("Jane");
    let john = set.begin("John");
    assert_ne!(jane, john);
    assert_eq!(set.len(), 2);

    assert!(set.matches("  jane "));
    assert_eq!(set.resolve(&jane).unwrap().display_value, "Jane");
    assert!(!set.matches("Jane"));
    assert!(set.resolve(&jane).is_none());

    assert_eq!(set.fail(&john).unwrap().display_value, "John");
    assert!(set.is_empty());
  }

  #[test]
  fn test_known_target_is_awaited_until_resolved() {
    let mut set = PlaceholderSet::new();
    let temp = set.begin_for("Jane", "p-1");
    assert!(set.awaits("p-1"));
    assert!(!set.awaits("p-2"));

    set.resolve(&temp);
    assert!(!set.awaits("p-1"));
  }

  #[test]
  fn test_covers_server_copy_under_another_id() {
    let mut set = PlaceholderSet::new();
    let temp = set.begin_for("Jane", "jane");
    assert!(set.covers("jane", "Someone else"));
    assert!(set.covers("srv-1", "JANE"));
    assert!(!set.covers("srv-2", "John"));

    set.fail(&temp);
    assert!(!set.covers("srv-1", "Jane"));
  }

  #[test]
  fn test_temp_ids_render_distinctly() {
    let mut set = PlaceholderSet::new();
    let id = set.begin("x");
    assert!(id.to_string().starts_with("temp-"));
  }
}
