//! Rule-scoped operator state.

use super::{KeyValueStore, get_as, replace_as};
use crate::error::StoreError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// State of one operator of one rule.
pub trait StateStore: Send + Sync {
  /// Writes a state value.
  fn put_state(&self, key: &str, value: &Value) -> Result<(), StoreError>;

  /// Reads a state value.
  fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError>;
}

/// State kept in a rule's [`KeyValueStore`], with keys prefixed by the operator id.
pub struct KvStateStore {
  store: Arc<dyn KeyValueStore>,
  scope: String,
}

impl KvStateStore {
  /// Scopes `store` to one operator.
  pub fn new(store: Arc<dyn KeyValueStore>, scope: impl Into<String>) -> Self {
    Self {
      store,
      scope: scope.into(),
    }
  }

  fn key(&self, key: &str) -> String {
    format!("{}/{}", self.scope, key)
  }
}

impl StateStore for KvStateStore {
  fn put_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
    replace_as(self.store.as_ref(), &self.key(key), value)
  }

  fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
    get_as(self.store.as_ref(), &self.key(key))
  }
}

/// Volatile state, for ad-hoc queries and tests.
#[derive(Default)]
pub struct MemoryStateStore {
  entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

impl StateStore for MemoryStateStore {
  fn put_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|_| StoreError::NotOpen("memory state".to_string()))?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
    let entries = self
      .entries
      .lock()
      .map_err(|_| StoreError::NotOpen("memory state".to_string()))?;
    Ok(entries.get(key).cloned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::FileKvStore;
  use tempfile::TempDir;

  #[test]
  fn kv_state_is_scoped_per_operator() {
    let tmp = TempDir::new().unwrap();
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::open_at(tmp.path(), "rule1").unwrap());
    let a = KvStateStore::new(kv.clone(), "source_demo");
    let b = KvStateStore::new(kv.clone(), "source_other");
    a.put_state("$$offset", &Value::Int(42)).unwrap();
    assert_eq!(a.get_state("$$offset").unwrap(), Some(Value::Int(42)));
    assert_eq!(b.get_state("$$offset").unwrap(), None);
  }

  #[test]
  fn memory_state_round_trip() {
    let s = MemoryStateStore::new();
    assert_eq!(s.get_state("k").unwrap(), None);
    s.put_state("k", &Value::from("v")).unwrap();
    assert_eq!(s.get_state("k").unwrap(), Some(Value::from("v")));
  }
}
