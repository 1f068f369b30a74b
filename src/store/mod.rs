//! Durable key/value storage and rule-scoped state.
//!
//! [`FileKvStore`] keeps one JSON document per store inside a directory. Every mutation
//! rewrites the document through a temporary file and a rename, so a crash leaves either
//! the previous or the new content on disk, never a torn write.
//!
//! Stream and rule definitions, source offsets and sink cache snapshots all live in
//! stores of this kind.

pub mod state;

pub use state::{KvStateStore, MemoryStateStore, StateStore};

use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace};

/// A string-keyed store of JSON values.
pub trait KeyValueStore: Send + Sync {
  /// Opens the store, loading persisted content. Opening an open store is a no-op.
  fn open(&self) -> Result<(), StoreError>;

  /// Flushes and closes the store.
  fn close(&self) -> Result<(), StoreError>;

  /// Inserts a new key. Fails with [`StoreError::AlreadyExists`] if the key is present.
  fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

  /// Inserts or overwrites a key.
  fn replace(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

  /// Reads a key.
  fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

  /// Removes a key. Fails with [`StoreError::NotFound`] if the key is absent.
  fn delete(&self, key: &str) -> Result<(), StoreError>;

  /// Lists keys in ascending order.
  fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Reads and deserializes a key.
pub fn get_as<T: DeserializeOwned>(
  store: &dyn KeyValueStore,
  key: &str,
) -> Result<Option<T>, StoreError> {
  match store.get(key)? {
    Some(v) => serde_json::from_value(v)
      .map(Some)
      .map_err(|e| StoreError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
      }),
    None => Ok(None),
  }
}

/// Serializes and writes a key, overwriting any previous value.
pub fn replace_as<T: Serialize>(
  store: &dyn KeyValueStore,
  key: &str,
  value: &T,
) -> Result<(), StoreError> {
  store.replace(key, serde_json::to_value(value)?)
}

/// Directory-backed store holding its content in `<dir>/<name>.json`.
pub struct FileKvStore {
  dir: PathBuf,
  name: String,
  entries: Mutex<Option<BTreeMap<String, serde_json::Value>>>,
}

impl FileKvStore {
  /// Creates a store handle. Nothing is read until [`KeyValueStore::open`].
  pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
    Self {
      dir: dir.as_ref().to_path_buf(),
      name: name.to_string(),
      entries: Mutex::new(None),
    }
  }

  /// Creates and opens a store.
  pub fn open_at<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self, StoreError> {
    let store = Self::new(dir, name);
    store.open()?;
    Ok(store)
  }

  fn path(&self) -> PathBuf {
    self.dir.join(format!("{}.json", self.name))
  }

  fn flush(&self, entries: &BTreeMap<String, serde_json::Value>) -> Result<(), StoreError> {
    let path = self.path();
    let tmp = self.dir.join(format!("{}.json.tmp", self.name));
    let json = serde_json::to_vec(entries)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    trace!(store = %self.name, keys = entries.len(), "flushed store");
    Ok(())
  }

  fn with_entries<R>(
    &self,
    f: impl FnOnce(&mut BTreeMap<String, serde_json::Value>) -> Result<(R, bool), StoreError>,
  ) -> Result<R, StoreError> {
    let mut guard = self
      .entries
      .lock()
      .map_err(|_| StoreError::NotOpen(self.name.clone()))?;
    let entries = guard
      .as_mut()
      .ok_or_else(|| StoreError::NotOpen(self.name.clone()))?;
    let (result, dirty) = f(entries)?;
    if dirty {
      self.flush(entries)?;
    }
    Ok(result)
  }
}

impl KeyValueStore for FileKvStore {
  fn open(&self) -> Result<(), StoreError> {
    let mut guard = self
      .entries
      .lock()
      .map_err(|_| StoreError::NotOpen(self.name.clone()))?;
    if guard.is_some() {
      return Ok(());
    }
    std::fs::create_dir_all(&self.dir)?;
    let path = self.path();
    let entries = if path.exists() {
      let bytes = std::fs::read(&path)?;
      serde_json::from_slice(&bytes)?
    } else {
      BTreeMap::new()
    };
    debug!(store = %self.name, path = %path.display(), keys = entries.len(), "opened store");
    *guard = Some(entries);
    Ok(())
  }

  fn close(&self) -> Result<(), StoreError> {
    let mut guard = self
      .entries
      .lock()
      .map_err(|_| StoreError::NotOpen(self.name.clone()))?;
    if let Some(entries) = guard.take() {
      self.flush(&entries)?;
      debug!(store = %self.name, "closed store");
    }
    Ok(())
  }

  fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
    self.with_entries(|entries| {
      if entries.contains_key(key) {
        return Err(StoreError::AlreadyExists(key.to_string()));
      }
      entries.insert(key.to_string(), value);
      Ok(((), true))
    })
  }

  fn replace(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
    self.with_entries(|entries| {
      entries.insert(key.to_string(), value);
      Ok(((), true))
    })
  }

  fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
    self.with_entries(|entries| Ok((entries.get(key).cloned(), false)))
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.with_entries(|entries| match entries.remove(key) {
      Some(_) => Ok(((), true)),
      None => Err(StoreError::NotFound(key.to_string())),
    })
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    self.with_entries(|entries| Ok((entries.keys().cloned().collect(), false)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn file_kv_store_persists_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let store = FileKvStore::open_at(tmp.path(), "stream").unwrap();
    store.set("demo", serde_json::json!({ "a": 1 })).unwrap();
    store.set("other", serde_json::json!(2)).unwrap();
    store.close().unwrap();

    let reopened = FileKvStore::open_at(tmp.path(), "stream").unwrap();
    assert_eq!(reopened.keys().unwrap(), vec!["demo", "other"]);
    assert_eq!(reopened.get("demo").unwrap(), Some(serde_json::json!({ "a": 1 })));
  }

  #[test]
  fn set_rejects_existing_key_and_replace_overwrites() {
    let tmp = TempDir::new().unwrap();
    let store = FileKvStore::open_at(tmp.path(), "kv").unwrap();
    store.set("k", serde_json::json!(1)).unwrap();
    let err = store.set("k", serde_json::json!(2)).unwrap_err();
    assert_eq!(err.to_string(), "Item k already exists");
    store.replace("k", serde_json::json!(3)).unwrap();
    assert_eq!(get_as::<i64>(&store, "k").unwrap(), Some(3));
  }

  #[test]
  fn delete_missing_key_is_error() {
    let tmp = TempDir::new().unwrap();
    let store = FileKvStore::open_at(tmp.path(), "kv").unwrap();
    assert!(matches!(store.delete("nope"), Err(StoreError::NotFound(_))));
    store.set("k", serde_json::json!(true)).unwrap();
    store.delete("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
  }

  #[test]
  fn closed_store_is_not_usable() {
    let tmp = TempDir::new().unwrap();
    let store = FileKvStore::new(tmp.path(), "kv");
    assert!(matches!(store.get("k"), Err(StoreError::NotOpen(_))));
    store.open().unwrap();
    store.close().unwrap();
    assert!(matches!(store.keys(), Err(StoreError::NotOpen(_))));
  }
}
