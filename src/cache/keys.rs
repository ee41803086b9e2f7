//! Namespaced cache keys.

use std::fmt;

use crate::model::Scope;

/// Key of a cached list or detail record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheKey {
  /// Authoritative list for a scope
  List {
    entity_type: &'static str,
    scope: String,
  },
  /// A single record by id
  Details {
    entity_type: &'static str,
    id: String,
  },
}

impl CacheKey {
  pub fn list(entity_type: &'static str, scope: &Scope) -> Self {
    Self::List {
      entity_type,
      scope: scope.key(),
    }
  }

  pub fn details(entity_type: &'static str, id: &str) -> Self {
    Self::Details {
      entity_type,
      id: id.to_string(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::List { entity_type, scope } => write!(f, "{}:list:{}", entity_type, scope),
      Self::Details { entity_type, id } => write!(f, "{}:details:{}", entity_type, id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_are_namespaced() {
    let scope = Scope::congregation("c1");
    assert_eq!(
      CacheKey::list("establishment", &scope).to_string(),
      "establishment:list:establishments?congregation_id=c1"
    );
    assert_eq!(
      CacheKey::details("establishment", "e7").to_string(),
      "establishment:details:e7"
    );
  }
}
