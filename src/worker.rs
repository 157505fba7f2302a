//! Host adapter: lifecycle and request events arrive here as explicit calls.

use color_eyre::{eyre::eyre, Result as EyreResult};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStore, SqliteCacheStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::net::{NetworkClient, Request};
use crate::notify::{Notification, Notifier};
use crate::router::{Route, Router, Served, Strategies};
use crate::sync::{DeferredQueue, RateRefresh};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  /// Constructed, nothing precached yet
  Parsed,
  /// Current generation precached
  Installed,
  /// Stale generations retired
  Activated,
}

pub struct OfflineWorker {
  origin: Url,
  manifest: Vec<Url>,
  rates_tag: String,
  cache: Arc<CacheManager>,
  router: Router,
  store: Arc<KeyValueStore>,
  rates: Arc<RateRefresh>,
  queue: Arc<DeferredQueue>,
  state: Mutex<Lifecycle>,
}

impl OfflineWorker {
  /// Build every component from `config`. `online` is the host's
  /// connectivity signal.
  pub fn from_config(
    config: &Config,
    online: watch::Receiver<bool>,
    notifier: Arc<dyn Notifier>,
  ) -> EyreResult<Self> {
    let origin = config.origin_url()?;
    let manifest = config.manifest_urls()?;
    let data_dir = config.data_dir()?;

    let client = NetworkClient::new(config.network_timeout())?;
    let cache_store: Arc<dyn CacheStore> =
      Arc::new(SqliteCacheStore::open_at(&data_dir.join("caches.db"))?);
    let cache = Arc::new(CacheManager::new(
      cache_store,
      client.clone(),
      &config.generation(),
    )?);

    let router = Router::new(
      origin.clone(),
      &config.rates.path,
      &manifest,
      Strategies::new(Arc::clone(&cache), client.clone()),
      client.clone(),
    );

    let store = Arc::new(KeyValueStore::select(
      config.storage.backend,
      &data_dir,
      &config.storage.collection,
    )?);

    let rates_url = origin
      .join(&config.rates.path)
      .map_err(|e| eyre!("Invalid rates path {}: {}", config.rates.path, e))?;
    let rates = Arc::new(RateRefresh::new(
      client,
      rates_url,
      config.rates_timeout(),
      Arc::clone(&store),
      &config.rates.key,
      notifier,
      Notification::from(&config.notification),
    ));

    Ok(Self {
      origin,
      manifest,
      rates_tag: config.rates.sync_tag.clone(),
      cache,
      router,
      store,
      rates,
      queue: DeferredQueue::new(online, config.sync.max_attempts),
      state: Mutex::new(Lifecycle::Parsed),
    })
  }

  pub fn state(&self) -> Lifecycle {
    self
      .state
      .lock()
      .map(|state| *state)
      .unwrap_or(Lifecycle::Parsed)
  }

  fn set_state(&self, next: Lifecycle) {
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  /// Install event: precache the manifest into the current generation.
  pub async fn install(&self) -> Result<usize> {
    let count = self.cache.install(&self.manifest).await?;
    self.set_state(Lifecycle::Installed);
    Ok(count)
  }

  /// Activate event: retire every other generation. Refused while the
  /// current generation is not installed.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let deleted = self.cache.activate_latest().await?;
    self.set_state(Lifecycle::Activated);
    Ok(deleted)
  }

  /// Fetch event for a path relative to the origin.
  pub async fn fetch_path(&self, path: &str) -> Result<Served> {
    let request = Request::get_path(&self.origin, path)?;
    self.fetch(&request).await
  }

  /// Fetch event: route the request and run its strategy.
  ///
  /// When the rate endpoint cannot be reached, the rate refresh is
  /// registered to run once the host is back online.
  pub async fn fetch(&self, request: &Request) -> Result<Served> {
    let _serving = self.cache.serving().await;

    let route = self.router.route(request);
    let result = self.router.handle(route, request).await;

    if let Err(e) = &result {
      if route == Route::NetworkOnly && e.is_offline() {
        warn!(error = %e, "rates unreachable, deferring refresh");
        self.schedule_rate_refresh();
      }
    }
    result
  }

  /// Sync event: run the task registered under `tag`.
  pub async fn sync(&self, tag: &str) -> Result<()> {
    if tag != self.rates_tag {
      return Err(Error::Config(format!("unknown sync tag {}", tag)));
    }
    self.rates.run().await.map(|_| ())
  }

  pub fn schedule_rate_refresh(&self) {
    let rates = Arc::clone(&self.rates);
    self.queue.schedule_when_online(&self.rates_tag, move || {
      let rates = Arc::clone(&rates);
      async move { rates.run().await.map(|_| ()) }
    });
  }

  pub fn queue(&self) -> &Arc<DeferredQueue> {
    &self.queue
  }

  pub fn store(&self) -> &KeyValueStore {
    &self.store
  }

  pub fn rates(&self) -> &RateRefresh {
    &self.rates
  }

  /// Install then activate, as the host does on a fresh start.
  ///
  /// A failed install leaves older generations untouched and keeps serving
  /// the newest of them; the host retries installation on the next start.
  pub async fn start(&self) -> Result<Lifecycle> {
    let count = match self.install().await {
      Ok(count) => count,
      Err(e) => {
        warn!(generation = %self.cache.current(), error = %e, "install failed");
        let active = self.cache.fall_back()?;
        info!(
          generation = %active,
          entries = self.cache.entry_count(&active)?,
          "serving without activation"
        );
        return Ok(self.state());
      }
    };

    let deleted = self.activate().await?;
    info!(
      generation = %self.cache.active(),
      entries = count,
      retired = deleted.len(),
      "worker ready"
    );
    Ok(self.state())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StorageBackend;
  use crate::kv::Lookup;
  use crate::notify::RecordingNotifier;
  use crate::router::Source;
  use mockito::Matcher;
  use tokio::net::TcpListener;

  fn config(origin: &str, dir: &std::path::Path, version: u32) -> Config {
    let mut config = Config::default();
    config.origin = origin.to_string();
    config.cache.prefix = "v".to_string();
    config.cache.version = version;
    config.cache.manifest = vec!["/".to_string(), "/a.js".to_string()];
    config.storage.dir = Some(dir.to_path_buf());
    config.storage.backend = StorageBackend::Records;
    config
  }

  fn worker(config: &Config, online: bool) -> (OfflineWorker, Arc<RecordingNotifier>) {
    let (_tx, rx) = watch::channel(online);
    let notifier = Arc::new(RecordingNotifier::default());
    let worker = OfflineWorker::from_config(config, rx, notifier.clone()).unwrap();
    (worker, notifier)
  }

  #[tokio::test]
  async fn test_lifecycle_and_offline_serving() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/")
      .match_query(Matcher::Any)
      .with_status(200)
      .with_body("<html>shell</html>")
      .create_async()
      .await;
    let script = server
      .mock("GET", "/a.js")
      .with_status(200)
      .with_body("app()")
      .expect(1)
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (worker, _) = worker(&config(&server.url(), dir.path(), 1), true);
    assert_eq!(worker.state(), Lifecycle::Parsed);

    assert_eq!(worker.start().await.unwrap(), Lifecycle::Activated);

    let served = worker.fetch_path("/a.js").await.unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"app()");

    let shell = worker.fetch_path("/").await.unwrap();
    assert_eq!(shell.source, Source::Cache);
    assert_eq!(shell.response.body, b"<html>shell</html>");

    // Only the install fetched the script.
    script.assert_async().await;
  }

  #[tokio::test]
  async fn test_new_version_retires_old_generation() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", Matcher::Any)
      .with_status(200)
      .with_body("ok")
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (v1, _) = worker(&config(&server.url(), dir.path(), 1), true);
    v1.start().await.unwrap();
    drop(v1);

    let (v2, _) = worker(&config(&server.url(), dir.path(), 2), true);
    v2.install().await.unwrap();
    let deleted = v2.activate().await.unwrap();

    assert_eq!(deleted, vec!["v1".to_string()]);
    assert_eq!(v2.cache.generations().unwrap(), vec!["v2".to_string()]);
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_generation() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", Matcher::Any)
      .with_status(200)
      .with_body("v1 body")
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (v1, _) = worker(&config(&server.url(), dir.path(), 1), true);
    v1.start().await.unwrap();
    drop(v1);

    server.reset_async().await;
    server
      .mock("GET", "/a.js")
      .with_status(503)
      .create_async()
      .await;

    let (v2, _) = worker(&config(&server.url(), dir.path(), 2), true);
    assert_eq!(v2.start().await.unwrap(), Lifecycle::Parsed);
    assert_eq!(v2.cache.generations().unwrap(), vec!["v1".to_string()]);

    let served = v2.fetch_path("/a.js").await.unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"v1 body");
  }

  #[tokio::test]
  async fn test_activate_after_failed_install_keeps_previous_generation() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", Matcher::Any)
      .with_status(200)
      .with_body("v1 body")
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (v1, _) = worker(&config(&server.url(), dir.path(), 1), true);
    v1.start().await.unwrap();
    drop(v1);

    server.reset_async().await;
    server
      .mock("GET", "/a.js")
      .with_status(503)
      .create_async()
      .await;

    let (v2, _) = worker(&config(&server.url(), dir.path(), 2), true);
    assert!(v2.install().await.is_err());
    let err = v2.activate().await.unwrap_err();

    assert!(matches!(err, Error::NotInstalled(_)));
    assert_eq!(v2.state(), Lifecycle::Parsed);
    assert_eq!(v2.cache.generations().unwrap(), vec!["v1".to_string()]);
    let served = v2.fetch_path("/a.js").await.unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"v1 body");
  }

  #[tokio::test]
  async fn test_fetch_before_install_serves_previous_generation() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", Matcher::Any)
      .with_status(200)
      .with_body("v1 body")
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (v1, _) = worker(&config(&server.url(), dir.path(), 1), true);
    v1.start().await.unwrap();
    drop(v1);

    let (v2, _) = worker(&config(&server.url(), dir.path(), 2), true);

    let cached = v2.fetch_path("/a.js").await.unwrap();
    assert_eq!(cached.source, Source::Cache);

    // A miss is answered from the network without creating a partial v2.
    let fresh = v2.fetch_path("/extra.js").await.unwrap();
    assert_eq!(fresh.source, Source::Network);
    assert_eq!(v2.cache.generations().unwrap(), vec!["v1".to_string()]);
    assert!(v2.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_unreachable_rates_defer_refresh() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let (worker, _) = worker(&config(&origin, dir.path(), 1), false);

    let err = worker.fetch_path("/rates").await.unwrap_err();
    assert!(err.is_offline());
    assert_eq!(worker.queue().pending_tags(), vec!["rates-sync".to_string()]);
  }

  #[tokio::test]
  async fn test_rates_server_error_does_not_defer() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/rates")
      .with_status(500)
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (worker, _) = worker(&config(&server.url(), dir.path(), 1), true);

    let served = worker.fetch_path("/rates").await.unwrap();
    assert_eq!(served.response.status, 500);
    assert!(worker.queue().pending_tags().is_empty());
  }

  #[tokio::test]
  async fn test_sync_event_refreshes_rates() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/rates")
      .with_status(200)
      .with_body(r#"{"base":"EUR","date":"2017-06-01","rates":{"USD":1.1221}}"#)
      .create_async()
      .await;

    let dir = tempfile::tempdir().unwrap();
    let (worker, notifier) = worker(&config(&server.url(), dir.path(), 1), true);

    worker.sync("rates-sync").await.unwrap();

    assert!(matches!(worker.store().get("rates").unwrap(), Lookup::Found(_)));
    assert_eq!(notifier.shown().len(), 1);
    assert!(worker.sync("other-tag").await.is_err());
  }
}
