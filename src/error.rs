//! Error kinds shared by the cache, storage, network and sync layers.

use thiserror::Error;

/// Errors surfaced by the offline layer.
///
/// An absent key-value record is not an error; see [`crate::kv::Lookup`].
#[derive(Debug, Error)]
pub enum Error {
  /// Transport failure (connection refused, DNS, reset, unreadable body).
  #[error("{label}: network error: {message}")]
  Network { label: String, message: String },

  /// The request did not settle before its deadline.
  #[error("{label}: timed out")]
  Timeout { label: String },

  /// The server answered with a non-2xx status.
  #[error("{url} returned HTTP {status}")]
  HttpStatus { url: String, status: u16 },

  /// The body was not the JSON document we expected.
  #[error("malformed response from {url}: {message}")]
  Parse { url: String, message: String },

  /// Neither the record store nor the flat fallback can be used.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A read or write against a usable store failed.
  #[error("storage error: {0}")]
  Storage(String),

  /// A manifest entry could not be precached.
  #[error("install failed while caching {url}: {reason}")]
  InstallFailed { url: String, reason: String },

  /// Activation was requested for a generation that was never installed.
  #[error("generation {0} is not installed")]
  NotInstalled(String),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  pub fn network(label: &str, err: impl std::fmt::Display) -> Self {
    Error::Network {
      label: label.to_string(),
      message: err.to_string(),
    }
  }

  pub fn timeout(label: &str) -> Self {
    Error::Timeout {
      label: label.to_string(),
    }
  }

  /// True for failures caused by not reaching the server at all.
  pub fn is_offline(&self) -> bool {
    matches!(self, Error::Network { .. } | Error::Timeout { .. })
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Error::Storage(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_classification() {
    assert!(Error::timeout("rates").is_offline());
    assert!(Error::network("rates", "connection refused").is_offline());
    assert!(!Error::HttpStatus {
      url: "/rates".into(),
      status: 500
    }
    .is_offline());
  }

  #[test]
  fn test_label_in_message() {
    let err = Error::timeout("Fetching rates");
    assert_eq!(err.to_string(), "Fetching rates: timed out");
  }
}
