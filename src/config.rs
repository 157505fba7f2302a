use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Generation;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL the application is served from
  pub origin: String,
  pub cache: CacheConfig,
  pub rates: RatesConfig,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
  pub notification: NotificationConfig,
  pub sync: SyncConfig,
  /// File the configuration was read from; `None` for built-in defaults
  #[serde(skip)]
  pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation name prefix, e.g. "converter-v"
  pub prefix: String,
  /// Bump on every deploy
  pub version: u32,
  /// Paths precached at install time
  pub manifest: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
  /// Volatile endpoint, never cached
  pub path: String,
  /// Key-value record holding the last fetched rates
  pub key: String,
  /// Tag of the deferred refresh task
  pub sync_tag: String,
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Record store if usable, flat file otherwise
  #[default]
  Auto,
  Records,
  Flat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Defaults to $XDG_DATA_HOME/ratecache
  pub dir: Option<PathBuf>,
  pub backend: StorageBackend,
  pub collection: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Deliveries of a failing deferred task before it is dropped
  pub max_attempts: u32,
  pub probe_interval_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      cache: CacheConfig::default(),
      rates: RatesConfig::default(),
      network: NetworkConfig::default(),
      storage: StorageConfig::default(),
      notification: NotificationConfig::default(),
      sync: SyncConfig::default(),
      source: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "converter-v".to_string(),
      version: 1,
      manifest: [
        "/",
        "/index.html",
        "/scripts/app.js",
        "/scripts/idb-keyval.js",
        "/data/currencies.json",
        "/images/icon-192.png",
        "/images/icon-512.png",
        "/images/badge.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

impl Default for RatesConfig {
  fn default() -> Self {
    Self {
      path: "/rates".to_string(),
      key: "rates".to_string(),
      sync_tag: "rates-sync".to_string(),
      timeout_ms: 10_000,
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_ms: 10_000 }
  }
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      dir: None,
      backend: StorageBackend::Auto,
      collection: "keyval".to_string(),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "Rates updated".to_string(),
      body: "The latest exchange rates are now available offline.".to_string(),
      icon: "/images/icon-192.png".to_string(),
      badge: "/images/badge.png".to_string(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      probe_interval_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ratecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ratecache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => {
        let mut config = Self::load_from_path(&p)?;
        config.source = Some(p);
        config
      }
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ratecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ratecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if !self.rates.path.starts_with('/') {
      return Err(eyre!("rates.path must start with '/': {}", self.rates.path));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Manifest paths resolved against the origin.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    let origin = self.origin_url()?;
    self
      .cache
      .manifest
      .iter()
      .map(|p| {
        origin
          .join(p)
          .map_err(|e| eyre!("Invalid manifest entry {}: {}", p, e))
      })
      .collect()
  }

  pub fn generation(&self) -> Generation {
    Generation {
      prefix: self.cache.prefix.clone(),
      version: self.cache.version,
    }
  }

  /// Directory holding the cache database, key-value records and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ratecache"))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network.timeout_ms)
  }

  pub fn rates_timeout(&self) -> Duration {
    Duration::from_millis(self.rates.timeout_ms)
  }
}
