//! Lifecycle of versioned response caches.

use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{info, warn};
use url::Url;

use super::storage::{CacheStore, CachedEntry};
use crate::error::{Error, Result};
use crate::net::{NetworkClient, Request, RequestKey, Response};

/// Name of a cache generation: a prefix plus a version bumped on every deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub prefix: String,
  pub version: u32,
}

impl Generation {
  pub fn name(&self) -> String {
    format!("{}{}", self.prefix, self.version)
  }
}

/// Owns the current generation: precaches it, retires the others and
/// mediates reads and writes against it.
pub struct CacheManager {
  store: Arc<dyn CacheStore>,
  client: NetworkClient,
  /// Generation this build installs and activates.
  current: String,
  /// Generation requests are served from.
  active: std::sync::RwLock<String>,
  /// Held exclusively while stale generations are being deleted.
  gate: RwLock<()>,
}

impl CacheManager {
  /// Serve from the current generation when it is installed, otherwise
  /// from the newest earlier one.
  pub fn new(
    store: Arc<dyn CacheStore>,
    client: NetworkClient,
    generation: &Generation,
  ) -> Result<Self> {
    let current = generation.name();
    let manager = Self {
      store,
      client,
      active: std::sync::RwLock::new(current.clone()),
      current,
      gate: RwLock::new(()),
    };
    if !manager.store.has(&manager.current)? {
      manager.fall_back()?;
    }
    Ok(manager)
  }

  /// Name of the generation this build installs.
  pub fn current(&self) -> &str {
    &self.current
  }

  /// Name of the generation eligible to serve requests.
  pub fn active(&self) -> String {
    self
      .active
      .read()
      .map(|active| active.clone())
      .unwrap_or_else(|_| self.current.clone())
  }

  fn set_active(&self, name: &str) {
    if let Ok(mut active) = self.active.write() {
      *active = name.to_string();
    }
  }

  /// Keep serving the newest earlier generation after a failed install.
  ///
  /// Returns the generation now active; the current one stays active if
  /// no other generation exists.
  pub fn fall_back(&self) -> Result<String> {
    let previous = self
      .store
      .keys()?
      .into_iter()
      .filter(|name| *name != self.current)
      .last();

    if let Some(name) = &previous {
      warn!(generation = %name, "current generation not installed, serving previous one");
      self.set_active(name);
    }
    Ok(self.active())
  }

  /// Fetch every manifest URL and store the responses in the current generation.
  ///
  /// Nothing is written unless every fetch succeeds with a 2xx status; the
  /// entries then land in one transaction.
  pub async fn install(&self, manifest: &[Url]) -> Result<usize> {
    info!(generation = %self.current, urls = manifest.len(), "installing");

    let fetches = manifest.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let response = self
          .client
          .fetch(&request)
          .await
          .map_err(|e| Error::InstallFailed {
            url: url.to_string(),
            reason: e.to_string(),
          })?;

        if !response.is_ok() {
          return Err(Error::InstallFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status),
          });
        }
        Ok((request.key(), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.store.put_all(&self.current, &entries)?;

    info!(generation = %self.current, entries = entries.len(), "installed");
    Ok(entries.len())
  }

  /// Delete every generation other than the current one.
  ///
  /// Request handling that goes through [`CacheManager::serving`] cannot
  /// start until this returns.
  ///
  /// Fails without deleting anything when the current generation was never
  /// installed.
  pub async fn activate_latest(&self) -> Result<Vec<String>> {
    let _exclusive = self.gate.write().await;

    if !self.store.has(&self.current)? {
      return Err(Error::NotInstalled(self.current.clone()));
    }

    let mut deleted = Vec::new();
    for name in self.generations()? {
      if name != self.current {
        self.store.delete(&name)?;
        info!(generation = %name, "deleted stale generation");
        deleted.push(name);
      }
    }
    self.set_active(&self.current);

    info!(generation = %self.current, "activated");
    Ok(deleted)
  }

  /// Shared guard held while handling a request.
  pub async fn serving(&self) -> RwLockReadGuard<'_, ()> {
    self.gate.read().await
  }

  pub fn read(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.store.match_entry(generation, key)
  }

  /// Returns false when `generation` does not exist.
  pub fn write(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<bool> {
    self.store.put(generation, key, response)
  }

  /// Store a background refresh, unless activation retired `generation`
  /// after the refresh started.
  pub async fn write_back(
    &self,
    generation: &str,
    key: &RequestKey,
    response: &Response,
  ) -> Result<bool> {
    let _serving = self.serving().await;
    if self.active() != generation {
      return Ok(false);
    }
    self.write(generation, key, response)
  }

  pub fn generations(&self) -> Result<Vec<String>> {
    self.store.keys()
  }

  pub fn entry_count(&self, generation: &str) -> Result<usize> {
    self.store.entry_count(generation)
  }
}
