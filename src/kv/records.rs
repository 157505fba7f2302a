//! Transactional record store: one SQLite table keyed by the caller's key.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{KeyValueBackend, Lookup};
use crate::error::{Error, Result};

pub struct RecordStore {
  /// `None` keeps the records in memory.
  path: Option<PathBuf>,
  collection: String,
  /// Opened on first use.
  conn: Mutex<Option<Connection>>,
}

impl RecordStore {
  pub fn new(path: Option<PathBuf>, collection: &str) -> Result<Self> {
    if collection.is_empty()
      || !collection
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
      return Err(Error::Config(format!(
        "collection name must be alphanumeric: {:?}",
        collection
      )));
    }

    Ok(Self {
      path,
      collection: collection.to_string(),
      conn: Mutex::new(None),
    })
  }

  /// Whether a database can be created at `path`.
  pub fn probe(path: &Path) -> Result<()> {
    if path.is_dir() {
      return Err(Error::StorageUnavailable(format!(
        "record store path is a directory: {}",
        path.display()
      )));
    }
    match path.parent() {
      Some(dir) => super::probe_dir(dir),
      None => Ok(()),
    }
  }

  fn connect(&self) -> Result<Connection> {
    let conn = match &self.path {
      Some(path) => Connection::open(path),
      None => Connection::open_in_memory(),
    }
    .map_err(|e| Error::StorageUnavailable(format!("failed to open record store: {}", e)))?;

    conn
      .execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        self.collection
      ))
      .map_err(|e| Error::StorageUnavailable(format!("failed to create collection: {}", e)))?;

    debug!(collection = %self.collection, "record store opened");
    Ok(conn)
  }

  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))?;

    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    let conn = guard
      .as_ref()
      .ok_or_else(|| Error::StorageUnavailable("record store is not open".into()))?;
    f(conn)
  }
}

impl KeyValueBackend for RecordStore {
  fn get(&self, key: &str) -> Result<Lookup> {
    self.with_conn(|conn| {
      let text: Option<String> = conn
        .query_row(
          &format!("SELECT value FROM {} WHERE key = ?", self.collection),
          params![key],
          |row| row.get(0),
        )
        .optional()?;

      match text {
        Some(text) => serde_json::from_str(&text)
          .map(Lookup::Found)
          .map_err(|e| Error::Storage(format!("corrupt record {}: {}", key, e))),
        None => Ok(Lookup::NotFound),
      }
    })
  }

  fn put(&self, key: &str, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)
      .map_err(|e| Error::Storage(format!("failed to serialize {}: {}", key, e)))?;

    self.with_conn(|conn| {
      conn.execute(
        &format!(
          "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
          self.collection
        ),
        params![key, text],
      )?;
      Ok(())
    })
  }

  fn name(&self) -> &'static str {
    "records"
  }
}
