//! Synchronous flat storage: a single file of key to serialized-text pairs.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{KeyValueBackend, Lookup};
use crate::error::{Error, Result};

/// Values are stored as their JSON text and parsed back on read.
pub struct FlatStore {
  path: PathBuf,
  lock: Mutex<()>,
}

impl FlatStore {
  pub fn new(path: PathBuf) -> Self {
    Self {
      path,
      lock: Mutex::new(()),
    }
  }

  /// Whether a storage file can be written at `path`.
  pub fn probe(path: &Path) -> Result<()> {
    if path.is_dir() {
      return Err(Error::StorageUnavailable(format!(
        "flat storage path is a directory: {}",
        path.display()
      )));
    }
    match path.parent() {
      Some(dir) => super::probe_dir(dir),
      None => Ok(()),
    }
  }

  fn load(&self) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(&self.path) {
      Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
        Error::Storage(format!("corrupt storage file {}: {}", self.path.display(), e))
      }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
      Err(e) => Err(Error::Storage(format!(
        "failed to read {}: {}",
        self.path.display(),
        e
      ))),
    }
  }

  fn save(&self, items: &BTreeMap<String, String>) -> Result<()> {
    let contents = serde_json::to_string_pretty(items)
      .map_err(|e| Error::Storage(format!("failed to serialize storage: {}", e)))?;

    // Write beside the target, then rename over it.
    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, contents)
      .and_then(|_| std::fs::rename(&tmp, &self.path))
      .map_err(|e| Error::Storage(format!("failed to write {}: {}", self.path.display(), e)))
  }
}

impl KeyValueBackend for FlatStore {
  fn get(&self, key: &str) -> Result<Lookup> {
    let _guard = self
      .lock
      .lock()
      .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))?;

    match self.load()?.get(key) {
      Some(text) => serde_json::from_str(text)
        .map(Lookup::Found)
        .map_err(|e| Error::Storage(format!("corrupt value for {}: {}", key, e))),
      None => Ok(Lookup::NotFound),
    }
  }

  fn put(&self, key: &str, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)
      .map_err(|e| Error::Storage(format!("failed to serialize {}: {}", key, e)))?;

    let _guard = self
      .lock
      .lock()
      .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))?;

    let mut items = self.load()?;
    items.insert(key.to_string(), text);
    self.save(&items)
  }

  fn name(&self) -> &'static str {
    "flat"
  }
}
