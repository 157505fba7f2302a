//! The deferred rate refresh: fetch quotes, persist them, tell the user.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::net::NetworkClient;
use crate::notify::{Notification, Notifier};

/// Exchange rates relative to `base`, as published for `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rates {
  pub base: String,
  pub date: NaiveDate,
  pub rates: BTreeMap<String, f64>,
}

impl Rates {
  fn validate(&self) -> std::result::Result<(), String> {
    let is_code = |code: &str| code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase());

    if !is_code(&self.base) {
      return Err(format!("invalid base currency {:?}", self.base));
    }
    if let Some(code) = self.rates.keys().find(|code| !is_code(code)) {
      return Err(format!("invalid currency code {:?}", code));
    }
    Ok(())
  }
}

pub struct RateRefresh {
  client: NetworkClient,
  url: Url,
  timeout: Duration,
  store: Arc<KeyValueStore>,
  key: String,
  notifier: Arc<dyn Notifier>,
  notification: Notification,
}

impl RateRefresh {
  pub fn new(
    client: NetworkClient,
    url: Url,
    timeout: Duration,
    store: Arc<KeyValueStore>,
    key: &str,
    notifier: Arc<dyn Notifier>,
    notification: Notification,
  ) -> Self {
    Self {
      client,
      url,
      timeout,
      store,
      key: key.to_string(),
      notifier,
      notification,
    }
  }

  /// Fetch the current rates, store them under the rates key and notify.
  ///
  /// Nothing is stored or shown unless the whole document is valid.
  pub async fn run(&self) -> Result<Rates> {
    let value = self
      .client
      .fetch_json(&self.url, "Fetching rates", self.timeout)
      .await?;

    let rates: Rates = serde_json::from_value(value).map_err(|e| Error::Parse {
      url: self.url.to_string(),
      message: e.to_string(),
    })?;
    rates.validate().map_err(|message| Error::Parse {
      url: self.url.to_string(),
      message,
    })?;

    self.store.put_as(&self.key, &rates)?;
    info!(date = %rates.date, currencies = rates.rates.len(), "rates stored");

    self.notifier.show(&self.notification);
    Ok(rates)
  }

  /// Last stored rates, if any.
  pub fn stored(&self) -> Result<Option<Rates>> {
    self.store.get_as(&self.key)
  }
}
