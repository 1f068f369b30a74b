//! # Sink cache
//!
//! A durable buffer between a sink node and its delivery worker. Every batch gets the
//! next index and stays in the pending map until its delivery is confirmed with
//! [`Cache::complete`]. Pending batches are periodically saved to a [`KeyValueStore`]
//! and replayed, in index order, when the sink starts again.
//!
//! ## Save policy
//!
//! The node calls [`Cache::tick`] every `cache_save_interval`. A tick saves when the
//! cache changed during the tick and holds more than [`SAVE_THRESHOLD`] entries, or when
//! it did not change during the tick but has changes that were never saved. Bursts are
//! therefore saved once they settle, and large backlogs are saved while they grow.
//!
//! ## Sequencing
//!
//! A tick returns a [`SaveJob`] holding a cloned snapshot, written off the node task.
//! Jobs carry increasing versions and a job never overwrites a newer version, so
//! out-of-order completion of background writes cannot roll the stored state back.
//!
//! ## Indices
//!
//! Indices strictly increase for the lifetime of a cache and continue after the largest
//! loaded index; they are never reset or reused.

use super::Payload;
use crate::error::StoreError;
use crate::store::{KeyValueStore, get_as, replace_as};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Pending entries above which a changing cache is saved on every tick.
pub const SAVE_THRESHOLD: usize = 10;

/// The persisted form of a cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
  /// Index the next added batch will get.
  pub next_index: u64,
  /// Undelivered batches by index.
  pub pending: BTreeMap<u64, Payload>,
}

/// The sink cache of one sink instance.
pub struct Cache {
  key: String,
  store: Arc<dyn KeyValueStore>,
  next_index: u64,
  pending: BTreeMap<u64, Payload>,
  /// Mutated since the last tick.
  changed: bool,
  /// Mutated since the last snapshot.
  dirty: bool,
  version: u64,
  written: Arc<Mutex<u64>>,
}

impl Cache {
  /// Loads the cache stored under `key`, or starts an empty one.
  ///
  /// # Errors
  ///
  /// Fails if the store cannot be read or holds a malformed snapshot.
  pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self, StoreError> {
    let key = key.into();
    let snapshot: CacheSnapshot = get_as(store.as_ref(), &key)?.unwrap_or_default();
    let after_last = snapshot
      .pending
      .keys()
      .next_back()
      .map(|i| i + 1)
      .unwrap_or(0);
    let next_index = snapshot.next_index.max(after_last);
    if !snapshot.pending.is_empty() {
      debug!(key = %key, pending = snapshot.pending.len(), next_index, "sink cache loaded");
    }
    Ok(Self {
      key,
      store,
      next_index,
      pending: snapshot.pending,
      changed: false,
      dirty: false,
      version: 0,
      written: Arc::new(Mutex::new(0)),
    })
  }

  /// Store key of the cache.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Index the next added batch will get.
  pub fn next_index(&self) -> u64 {
    self.next_index
  }

  /// Number of undelivered batches.
  pub fn len(&self) -> usize {
    self.pending.len()
  }

  /// Returns true when every batch has been delivered.
  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Returns true if there are changes not captured by a snapshot yet.
  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  /// Undelivered batches in ascending index order.
  pub fn pending(&self) -> impl Iterator<Item = (u64, &Payload)> {
    self.pending.iter().map(|(i, p)| (*i, p))
  }

  /// Appends a batch and returns its index.
  pub fn add(&mut self, payload: Payload) -> u64 {
    let index = self.next_index;
    self.next_index += 1;
    self.pending.insert(index, payload);
    self.changed = true;
    self.dirty = true;
    trace!(key = %self.key, index, "cache add");
    index
  }

  /// Marks a batch as delivered. Returns false for an unknown index.
  pub fn complete(&mut self, index: u64) -> bool {
    let removed = self.pending.remove(&index).is_some();
    if removed {
      self.changed = true;
      self.dirty = true;
    }
    removed
  }

  /// Applies the save policy for one save interval.
  ///
  /// # Returns
  ///
  /// The write to perform, when a save is due.
  pub fn tick(&mut self) -> Option<SaveJob> {
    let due = if self.changed {
      self.pending.len() > SAVE_THRESHOLD
    } else {
      self.dirty
    };
    self.changed = false;
    due.then(|| self.snapshot_job())
  }

  /// Writes unsaved changes immediately.
  pub fn save_now(&mut self) -> Result<(), StoreError> {
    if !self.dirty {
      return Ok(());
    }
    self.snapshot_job().write().map(|_| ())
  }

  fn snapshot_job(&mut self) -> SaveJob {
    self.version += 1;
    self.dirty = false;
    SaveJob {
      key: self.key.clone(),
      store: Arc::clone(&self.store),
      version: self.version,
      written: Arc::clone(&self.written),
      snapshot: CacheSnapshot {
        next_index: self.next_index,
        pending: self.pending.clone(),
      },
    }
  }
}

/// A snapshot waiting to be written.
pub struct SaveJob {
  key: String,
  store: Arc<dyn KeyValueStore>,
  version: u64,
  written: Arc<Mutex<u64>>,
  snapshot: CacheSnapshot,
}

impl SaveJob {
  /// Version of the snapshot; later snapshots have larger versions.
  pub fn version(&self) -> u64 {
    self.version
  }

  /// The snapshot to write.
  pub fn snapshot(&self) -> &CacheSnapshot {
    &self.snapshot
  }

  /// Writes the snapshot unless a newer one was already written.
  ///
  /// # Returns
  ///
  /// `Ok(false)` when the snapshot was superseded and skipped.
  pub fn write(self) -> Result<bool, StoreError> {
    let mut written = self.written.lock().unwrap_or_else(|p| p.into_inner());
    if *written >= self.version {
      debug!(key = %self.key, version = self.version, "stale cache snapshot skipped");
      return Ok(false);
    }
    replace_as(self.store.as_ref(), &self.key, &self.snapshot)?;
    *written = self.version;
    trace!(key = %self.key, version = self.version, pending = self.snapshot.pending.len(), "cache saved");
    Ok(true)
  }
}
