//! Records kept in sync and the identities they are tracked under.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::Cacheable;

/// A remote record the engine can display and mutate optimistically.
pub trait Entity: Cacheable + 'static {
  /// Stable identifier. Callers pre-generate it so a replayed create is idempotent.
  fn id(&self) -> &str;

  /// Human identity used to match a pending placeholder (e.g. a partner's name).
  fn display_value(&self) -> String;

  /// Same record under the id the remote store assigned.
  fn with_id(self, id: String) -> Self;

  /// Remote table name.
  fn table() -> &'static str;
}

/// Identity under which a visible list and its pending operations are tracked.
///
/// A scope is a name plus equality filters, e.g. "this user's partners on this day".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
  name: String,
  filters: Vec<(String, String)>,
}

impl Scope {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      filters: Vec::new(),
    }
  }

  pub fn with_filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
    self.filters.push((column.into(), value.into()));
    self
  }

  /// All business establishments of a congregation.
  pub fn congregation(congregation_id: &str) -> Self {
    Self::new("establishments").with_filter("congregation_id", congregation_id)
  }

  /// Field-service partners a user recorded for one day.
  pub fn user_day(user_id: &str, day: NaiveDate) -> Self {
    Self::new("service_partners")
      .with_filter("user_id", user_id)
      .with_filter("day", day.format("%Y-%m-%d").to_string())
  }

  /// Visits logged against one establishment.
  pub fn establishment(establishment_id: &str) -> Self {
    Self::new("visits").with_filter("establishment_id", establishment_id)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn filters(&self) -> &[(String, String)] {
    &self.filters
  }

  /// Stable string form used for storage keys.
  pub fn key(&self) -> String {
    if self.filters.is_empty() {
      return self.name.clone();
    }
    let filters: Vec<String> = self
      .filters
      .iter()
      .map(|(column, value)| format!("{}={}", column, value))
      .collect();
    format!("{}?{}", self.name, filters.join("&"))
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key())
  }
}

/// Synchronization domain: the congregation whose change notifications we follow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncDomain(String);

impl SyncDomain {
  pub fn new(congregation_id: impl Into<String>) -> Self {
    Self(congregation_id.into())
  }

  pub fn id(&self) -> &str {
    &self.0
  }

  /// Row filter applied to push subscriptions.
  pub fn filter(&self) -> String {
    format!("congregation_id=eq.{}", self.0)
  }
}

impl fmt::Display for SyncDomain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A business establishment worked by the congregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Establishment {
  pub id: String,
  pub congregation_id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
}

impl Establishment {
  pub fn new(id: impl Into<String>, congregation_id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      congregation_id: congregation_id.into(),
      name: name.into(),
      address: None,
      note: None,
    }
  }
}

impl Cacheable for Establishment {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "establishment"
  }
}

impl Entity for Establishment {
  fn id(&self) -> &str {
    &self.id
  }

  fn display_value(&self) -> String {
    self.name.clone()
  }

  fn with_id(self, id: String) -> Self {
    Self { id, ..self }
  }

  fn table() -> &'static str {
    "establishments"
  }
}

/// Someone a publisher worked with on a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePartner {
  pub id: String,
  pub user_id: String,
  pub day: NaiveDate,
  pub name: String,
}

impl ServicePartner {
  pub fn new(id: impl Into<String>, user_id: impl Into<String>, day: NaiveDate, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      user_id: user_id.into(),
      day,
      name: name.into(),
    }
  }
}

impl Cacheable for ServicePartner {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "service_partner"
  }
}

impl Entity for ServicePartner {
  fn id(&self) -> &str {
    &self.id
  }

  fn display_value(&self) -> String {
    self.name.clone()
  }

  fn with_id(self, id: String) -> Self {
    Self { id, ..self }
  }

  fn table() -> &'static str {
    "service_partners"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scope_keys() {
    let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
    assert_eq!(
      Scope::user_day("u1", day).key(),
      "service_partners?user_id=u1&day=2024-03-09"
    );
    assert_eq!(Scope::new("everything").key(), "everything");
    assert_ne!(Scope::congregation("a"), Scope::congregation("b"));
  }

  #[test]
  fn test_domain_filter() {
    assert_eq!(SyncDomain::new("c9").filter(), "congregation_id=eq.c9");
  }
}
