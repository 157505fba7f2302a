//! Requests, responses and the normalized request identity used as a cache key.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use url::Url;

use crate::error::{Error, Result};

/// Query parameter appended when bypassing intermediate caches.
pub const CACHE_BUST_PARAM: &str = "_";

/// An outbound resource request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
    }
  }

  /// Resolve `path` against `origin` and build a GET request.
  pub fn get_path(origin: &Url, path: &str) -> Result<Self> {
    let url = origin
      .join(path)
      .map_err(|e| Error::Config(format!("invalid request path {}: {}", path, e)))?;
    Ok(Self::get(url))
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  /// Copy of this request with a strictly increasing disambiguator appended.
  pub fn cache_busted(&self) -> Self {
    let mut url = self.url.clone();
    url
      .query_pairs_mut()
      .append_pair(CACHE_BUST_PARAM, &next_stamp().to_string());
    Self {
      method: self.method.clone(),
      url,
    }
  }
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Current time in milliseconds, bumped so no two calls return the same value.
fn next_stamp() -> i64 {
  let now = chrono::Utc::now().timestamp_millis();
  let mut last = LAST_STAMP.load(Ordering::Relaxed);
  loop {
    let next = now.max(last + 1);
    match LAST_STAMP.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
      Ok(_) => return next,
      Err(actual) => last = actual,
    }
  }
}

/// Normalized request identity: method plus URL, query significant, fragment dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_uppercase(),
      url: url.to_string(),
    }
  }

  /// Stable fixed-length key for the durable store.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Opaque response payload: status, headers and body. Header values are
/// kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, Vec<u8>)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Value of header `name` when it is valid UTF-8.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .and_then(|(_, v)| std::str::from_utf8(v).ok())
  }
}
