//! Timed, classified network requests.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::request::{Request, Response};
use crate::error::{Error, Result};

/// HTTP client whose every request is bounded by a timeout.
///
/// Each exchange settles in exactly one of: a response, a transport
/// failure, or a timeout. Dropping the timer with the finished exchange
/// cancels it, so no pending timer outlives a request.
#[derive(Clone)]
pub struct NetworkClient {
  http: reqwest::Client,
  default_timeout: Duration,
}

impl NetworkClient {
  pub fn new(default_timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      default_timeout,
    })
  }

  /// Issue `request` with the default timeout, returning any HTTP status verbatim.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    let label = format!("{} {}", request.method, request.url);
    self.send(request, &label, self.default_timeout).await
  }

  /// GET `url` and parse the body as JSON.
  ///
  /// Non-2xx answers become [`Error::HttpStatus`], bodies that fail to parse
  /// become [`Error::Parse`], and transport failures or an expired deadline
  /// carry `label`.
  pub async fn fetch_json(&self, url: &Url, label: &str, timeout: Duration) -> Result<Value> {
    let response = self.send(&Request::get(url.clone()), label, timeout).await?;

    if !response.is_ok() {
      return Err(Error::HttpStatus {
        url: url.to_string(),
        status: response.status,
      });
    }

    serde_json::from_slice(&response.body).map_err(|e| Error::Parse {
      url: url.to_string(),
      message: e.to_string(),
    })
  }

  async fn send(&self, request: &Request, label: &str, timeout: Duration) -> Result<Response> {
    if timeout.is_zero() {
      return Err(Error::timeout(label));
    }

    let exchange = async {
      let resp = self
        .http
        .request(request.method.clone(), request.url.clone())
        .send()
        .await
        .map_err(|e| Error::network(label, e))?;

      let status = resp.status().as_u16();
      let headers = resp
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();
      let body = resp
        .bytes()
        .await
        .map_err(|e| Error::network(label, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    };

    match tokio::time::timeout(timeout, exchange).await {
      Ok(result) => {
        if let Ok(response) = &result {
          debug!(status = response.status, url = %request.url, "fetched");
        }
        result
      }
      Err(_) => Err(Error::timeout(label)),
    }
  }
}
