//! Durable key-value state that outlives cache generations.
//!
//! Two backings implement [`KeyValueBackend`]: a transactional record store
//! and a synchronous flat file. One is chosen when the store is created;
//! call sites never branch on which.

mod flat;
mod records;

pub use flat::FlatStore;
pub use records::RecordStore;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::path::Path;
use tracing::{info, warn};

use crate::config::StorageBackend;
use crate::error::{Error, Result};

/// Outcome of a read. A stored JSON `null` is `Found(Value::Null)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
  Found(Value),
  NotFound,
}

impl Lookup {
  pub fn into_option(self) -> Option<Value> {
    match self {
      Lookup::Found(value) => Some(value),
      Lookup::NotFound => None,
    }
  }
}

/// Storage capability behind the key-value store.
///
/// Concurrent puts to one key are last-writer-wins.
pub trait KeyValueBackend: Send + Sync {
  fn get(&self, key: &str) -> Result<Lookup>;

  fn put(&self, key: &str, value: &Value) -> Result<()>;

  /// Short backing name for logs.
  fn name(&self) -> &'static str;
}

/// Flat namespace of JSON values keyed by short dotted names.
pub struct KeyValueStore {
  backend: Box<dyn KeyValueBackend>,
}

impl KeyValueStore {
  pub fn new(backend: Box<dyn KeyValueBackend>) -> Self {
    Self { backend }
  }

  /// Choose a backing for `dir` by probing what the host supports.
  ///
  /// `Auto` prefers the record store and falls back to flat storage; if
  /// neither can be used the store is unavailable.
  pub fn select(kind: StorageBackend, dir: &Path, collection: &str) -> Result<Self> {
    let records_path = dir.join(format!("{}.db", collection));
    let flat_path = dir.join(format!("{}.json", collection));

    let backend: Box<dyn KeyValueBackend> = match kind {
      StorageBackend::Records => {
        RecordStore::probe(&records_path)?;
        Box::new(RecordStore::new(Some(records_path), collection)?)
      }
      StorageBackend::Flat => {
        FlatStore::probe(&flat_path)?;
        Box::new(FlatStore::new(flat_path))
      }
      StorageBackend::Auto => match RecordStore::probe(&records_path) {
        Ok(()) => Box::new(RecordStore::new(Some(records_path), collection)?),
        Err(e) => {
          warn!(error = %e, "record store unavailable, using flat storage");
          FlatStore::probe(&flat_path).map_err(|flat_err| {
            Error::StorageUnavailable(format!("{}; {}", e, flat_err))
          })?;
          Box::new(FlatStore::new(flat_path))
        }
      },
    };

    let store = Self::new(backend);
    info!(backend = store.backend_name(), dir = %dir.display(), "key-value store ready");
    Ok(store)
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  pub fn get(&self, key: &str) -> Result<Lookup> {
    self.backend.get(key)
  }

  pub fn put(&self, key: &str, value: &Value) -> Result<()> {
    self.backend.put(key, value)
  }

  /// Read and deserialize a record. `Ok(None)` when absent.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.get(key)? {
      Lookup::Found(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| Error::Storage(format!("unexpected shape for {}: {}", key, e))),
      Lookup::NotFound => Ok(None),
    }
  }

  pub fn put_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)
      .map_err(|e| Error::Storage(format!("failed to serialize {}: {}", key, e)))?;
    self.put(key, &value)
  }
}

/// Check that `dir` exists (creating it if needed) and is writable.
fn probe_dir(dir: &Path) -> Result<()> {
  fs::create_dir_all(dir).map_err(|e| {
    Error::StorageUnavailable(format!("cannot create {}: {}", dir.display(), e))
  })?;

  let test_file = dir.join(".write_test");
  File::create(&test_file)
    .and_then(|_| fs::remove_file(&test_file))
    .map_err(|e| {
      Error::StorageUnavailable(format!("no write permission for {}: {}", dir.display(), e))
    })
}
