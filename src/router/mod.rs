//! Request classification and dispatch to a caching strategy.

mod strategy;

pub use strategy::{Served, Source, Strategies};

use reqwest::Method;
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::net::{NetworkClient, Request};

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Volatile rate quotes: always the network
  NetworkOnly,
  /// The document root: cached copy now, fresh copy next time
  StaleWhileRevalidate,
  /// Manifest and same-origin assets
  CacheFirst,
  /// Not intercepted
  Passthrough,
}

pub struct Router {
  origin: Url,
  volatile_path: String,
  manifest: HashSet<String>,
  strategies: Strategies,
  client: NetworkClient,
}

impl Router {
  pub fn new(
    origin: Url,
    volatile_path: &str,
    manifest: &[Url],
    strategies: Strategies,
    client: NetworkClient,
  ) -> Self {
    let manifest = manifest
      .iter()
      .map(|url| Request::get(url.clone()).key().url)
      .collect();

    Self {
      origin,
      volatile_path: volatile_path.to_string(),
      manifest,
      strategies,
      client,
    }
  }

  /// Pick the strategy for `request`, first match wins.
  pub fn route(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Passthrough;
    }

    let same_origin = request.url.origin() == self.origin.origin();
    let path = request.url.path();

    if same_origin && path == self.volatile_path {
      Route::NetworkOnly
    } else if same_origin && path == "/" {
      Route::StaleWhileRevalidate
    } else if same_origin || self.manifest.contains(&request.key().url) {
      Route::CacheFirst
    } else {
      Route::Passthrough
    }
  }

  /// Run `request` through the strategy for `route`.
  pub async fn handle(&self, route: Route, request: &Request) -> Result<Served> {
    debug!(?route, url = %request.url, "routing");
    match route {
      Route::NetworkOnly => self.strategies.network_only(request).await,
      Route::StaleWhileRevalidate => self.strategies.stale_while_revalidate(request).await,
      Route::CacheFirst => self.strategies.cache_first(request).await,
      Route::Passthrough => Ok(Served::passthrough(self.client.fetch(request).await?)),
    }
  }
}
