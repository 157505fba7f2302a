//! Caching strategies applied to routed requests.

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{CacheManager, CachedEntry};
use crate::error::{Error, Result};
use crate::net::{NetworkClient, Request, Response};

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh from the network
  Network,
  /// From the active cache generation
  Cache,
  /// Not intercepted; forwarded as is
  Passthrough,
}

/// A response plus metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: Source,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: Source::Network,
    }
  }

  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: Source::Cache,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: Source::Passthrough,
    }
  }
}

/// The three strategies, sharing the cache manager and network client.
#[derive(Clone)]
pub struct Strategies {
  cache: Arc<CacheManager>,
  client: NetworkClient,
}

impl Strategies {
  pub fn new(cache: Arc<CacheManager>, client: NetworkClient) -> Self {
    Self { cache, client }
  }

  /// Forward to the network without reading or writing the cache.
  pub async fn network_only(&self, request: &Request) -> Result<Served> {
    let response = self.client.fetch(request).await?;
    Ok(Served::from_network(response))
  }

  /// Serve a hit without touching the network; on a miss fetch, store a 2xx
  /// response and return it. Network and storage failures on a miss reach
  /// the caller.
  pub async fn cache_first(&self, request: &Request) -> Result<Served> {
    let generation = self.cache.active();
    let key = request.key();

    if let Some(entry) = self.cache.read(&generation, &key)? {
      debug!(%key, cached_at = %entry.cached_at, "cache hit");
      return Ok(Served::from_cache(entry));
    }

    let response = self.client.fetch(request).await?;
    if response.is_ok() && !self.cache.write(&generation, &key, &response)? {
      debug!(%key, generation = %generation, "generation not installed, response not cached");
    }
    Ok(Served::from_network(response))
  }

  /// Start a cache-busted fetch, answer from the cache if possible, and
  /// write the fresh response back under the original identity once it
  /// arrives.
  ///
  /// On a miss the caller waits for the same network fetch. Failures of the
  /// write-back are logged and dropped, and nothing is written once
  /// activation has retired the generation the request was served from.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served> {
    let generation = self.cache.active();
    let key = request.key();
    let busted = request.cache_busted();

    let (tx, rx) = oneshot::channel();
    {
      let cache = Arc::clone(&self.cache);
      let client = self.client.clone();
      let key = key.clone();
      tokio::spawn(async move {
        let result = client.fetch(&busted).await;
        let fresh = match &result {
          Ok(response) if response.is_ok() => Some(response.clone()),
          Ok(response) => {
            debug!(%key, status = response.status, "revalidation not cached");
            None
          }
          Err(e) => {
            warn!(%key, error = %e, "revalidation fetch failed");
            None
          }
        };
        // Answer a waiting caller before queueing behind a pending activation.
        let _ = tx.send(result);

        if let Some(response) = fresh {
          match cache.write_back(&generation, &key, &response).await {
            Ok(true) => debug!(%key, "revalidated"),
            Ok(false) => debug!(%key, generation = %generation, "generation retired, revalidation dropped"),
            Err(e) => warn!(%key, error = %e, "revalidation write failed"),
          }
        }
      });
    }

    if let Some(entry) = self.cache.read(&self.cache.active(), &key)? {
      debug!(%key, "serving cached copy while revalidating");
      return Ok(Served::from_cache(entry));
    }

    match rx.await {
      Ok(result) => result.map(Served::from_network),
      Err(_) => Err(Error::network(
        &key.to_string(),
        "revalidation task ended without a result",
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, Generation, SqliteCacheStore};
  use mockito::Matcher;
  use std::time::{Duration, Instant};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use url::Url;

  struct Fixture {
    strategies: Strategies,
    cache: Arc<CacheManager>,
  }

  fn fixture_at(store: Arc<dyn CacheStore>, version: u32) -> Fixture {
    let client = NetworkClient::new(Duration::from_secs(5)).unwrap();
    let generation = Generation {
      prefix: "v".into(),
      version,
    };
    let cache = Arc::new(CacheManager::new(store, client.clone(), &generation).unwrap());
    Fixture {
      strategies: Strategies::new(cache.clone(), client),
      cache,
    }
  }

  fn fixture() -> Fixture {
    let store: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    store.open("v1").unwrap();
    fixture_at(store, 1)
  }

  fn request(base: &str, path: &str) -> Request {
    Request::get_path(&Url::parse(base).unwrap(), path).unwrap()
  }

  fn response(body: &str) -> Response {
    Response {
      status: 200,
      headers: Vec::new(),
      body: body.as_bytes().to_vec(),
    }
  }

  async fn refused_base() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
  }

  /// Answer every request with `body` after `delay`.
  async fn slow_base(body: &'static str, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
          let mut buf = [0u8; 1024];
          let _ = socket.read(&mut buf).await;
          tokio::time::sleep(delay).await;
          let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
          );
          let _ = socket.write_all(reply.as_bytes()).await;
          let _ = socket.shutdown().await;
        });
      }
    });
    format!("http://{}", addr)
  }

  /// Poll the cache until the entry body matches or a deadline passes.
  async fn wait_for_body(cache: &CacheManager, request: &Request, expected: &[u8]) -> bool {
    for _ in 0..100 {
      if let Ok(Some(entry)) = cache.read(&cache.active(), &request.key()) {
        if entry.response.body == expected {
          return true;
        }
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_network_only_bypasses_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/rates")
      .with_status(200)
      .with_body(r#"{"base":"EUR"}"#)
      .expect(1)
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/rates");
    f.cache.write("v1", &req.key(), &response("stale")).unwrap();

    let served = f.strategies.network_only(&req).await.unwrap();

    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body, br#"{"base":"EUR"}"#);
    let entry = f.cache.read("v1", &req.key()).unwrap().unwrap();
    assert_eq!(entry.response.body, b"stale");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_cache_first_hit_is_idempotent_without_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/scripts/app.js")
      .with_status(200)
      .with_body("fresh")
      .expect(0)
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/scripts/app.js");
    f.cache.write("v1", &req.key(), &response("cached")).unwrap();

    let first = f.strategies.cache_first(&req).await.unwrap();
    let second = f.strategies.cache_first(&req).await.unwrap();

    assert_eq!(first.source, Source::Cache);
    assert_eq!(first.response.body, second.response.body);
    assert_eq!(first.response, second.response);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/data/currencies.json")
      .with_status(200)
      .with_body(r#"["EUR","USD"]"#)
      .expect(1)
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/data/currencies.json");

    let first = f.strategies.cache_first(&req).await.unwrap();
    let second = f.strategies.cache_first(&req).await.unwrap();

    assert_eq!(first.source, Source::Network);
    assert_eq!(second.source, Source::Cache);
    assert_eq!(second.response.body, br#"["EUR","USD"]"#);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/images/missing.png")
      .with_status(404)
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/images/missing.png");

    let served = f.strategies.cache_first(&req).await.unwrap();

    assert_eq!(served.response.status, 404);
    assert!(f.cache.read("v1", &req.key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_propagates() {
    let f = fixture();
    let req = request(&refused_base().await, "/scripts/app.js");

    let err = f.strategies.cache_first(&req).await.unwrap_err();
    assert!(err.is_offline());
  }

  #[tokio::test]
  async fn test_revalidate_hit_returns_cached_then_updates() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/")
      .match_query(Matcher::Any)
      .with_status(200)
      .with_body("new shell")
      .expect(1)
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/");
    f.cache.write("v1", &req.key(), &response("old shell")).unwrap();

    let served = f.strategies.stale_while_revalidate(&req).await.unwrap();

    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"old shell");
    assert!(wait_for_body(&f.cache, &req, b"new shell").await);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_revalidate_miss_waits_and_converges() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/")
      .match_query(Matcher::Any)
      .with_status(200)
      .with_body("shell R")
      .create_async()
      .await;

    let f = fixture();
    let req = request(&server.url(), "/");

    let served = f.strategies.stale_while_revalidate(&req).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body, b"shell R");

    // Written under the original identity, not the cache-busted one.
    assert!(wait_for_body(&f.cache, &req, b"shell R").await);
    let later = f.strategies.cache_first(&req).await.unwrap();
    assert_eq!(later.source, Source::Cache);
    assert_eq!(later.response.body, b"shell R");
  }

  #[tokio::test]
  async fn test_revalidate_hit_offline_is_silent() {
    let f = fixture();
    let req = request(&refused_base().await, "/");
    f.cache.write("v1", &req.key(), &response("old shell")).unwrap();

    let served = f.strategies.stale_while_revalidate(&req).await.unwrap();
    assert_eq!(served.response.body, b"old shell");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = f.cache.read("v1", &req.key()).unwrap().unwrap();
    assert_eq!(entry.response.body, b"old shell");
  }

  #[tokio::test]
  async fn test_revalidate_miss_offline_rejects() {
    let f = fixture();
    let req = request(&refused_base().await, "/");

    let err = f.strategies.stale_while_revalidate(&req).await.unwrap_err();
    assert!(err.is_offline());
    assert!(f.cache.read("v1", &req.key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_revalidate_hit_does_not_wait_for_network() {
    let f = fixture();
    let req = request(&slow_base("new shell", Duration::from_millis(500)).await, "/");
    f.cache.write("v1", &req.key(), &response("old shell")).unwrap();

    let started = Instant::now();
    let served = f.strategies.stale_while_revalidate(&req).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"old shell");
    assert!(wait_for_body(&f.cache, &req, b"new shell").await);
  }

  #[tokio::test]
  async fn test_late_revalidation_does_not_restore_retired_generation() {
    let store: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let req = request(&slow_base("fresh", Duration::from_millis(300)).await, "/");
    store.put_all("v1", &[(req.key(), response("old"))]).unwrap();
    let f = fixture_at(store.clone(), 2);
    assert_eq!(f.cache.active(), "v1");

    let served = f.strategies.stale_while_revalidate(&req).await.unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(served.response.body, b"old");

    // v2 installs and activates before the refresh lands.
    store.put_all("v2", &[]).unwrap();
    f.cache.activate_latest().await.unwrap();
    assert_eq!(f.cache.generations().unwrap(), vec!["v2".to_string()]);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(f.cache.generations().unwrap(), vec!["v2".to_string()]);
    assert!(f.cache.read("v1", &req.key()).unwrap().is_none());
    assert!(f.cache.read("v2", &req.key()).unwrap().is_none());
  }
}
