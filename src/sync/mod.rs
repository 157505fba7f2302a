//! Work deferred until the host reports connectivity.
//!
//! Tasks are registered by tag and carry no payload: running one re-derives
//! its work. The dispatcher delivers every registered task once the
//! connectivity signal is online, keeps a failed task for the next delivery
//! and gives up after a fixed number of attempts.

mod rates;

pub use rates::{RateRefresh, Rates};

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;

/// A boxed future that returns the task outcome
type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A factory producing one run of a task
type TaskFn = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct Registration {
  run: TaskFn,
  attempts: u32,
}

pub struct DeferredQueue {
  pending: Mutex<BTreeMap<String, Registration>>,
  online: watch::Receiver<bool>,
  wake: Notify,
  max_attempts: u32,
}

impl DeferredQueue {
  pub fn new(online: watch::Receiver<bool>, max_attempts: u32) -> Arc<Self> {
    Arc::new(Self {
      pending: Mutex::new(BTreeMap::new()),
      online,
      wake: Notify::new(),
      max_attempts: max_attempts.max(1),
    })
  }

  /// Register `on_run` under `tag`, replacing any task already registered
  /// with that tag.
  pub fn schedule_when_online<F, Fut>(&self, tag: &str, on_run: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let run: TaskFn = Arc::new(move || Box::pin(on_run()) as BoxFuture);

    if let Ok(mut pending) = self.pending.lock() {
      let attempts = pending.get(tag).map(|r| r.attempts).unwrap_or(0);
      pending.insert(tag.to_string(), Registration { run, attempts });
    }
    info!(tag, "deferred task registered");
    self.wake.notify_one();
  }

  pub fn pending_tags(&self) -> Vec<String> {
    self
      .pending
      .lock()
      .map(|pending| pending.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Deliver every registered task once. Returns how many succeeded.
  pub async fn run_pending(&self) -> usize {
    let batch: Vec<(String, TaskFn)> = match self.pending.lock() {
      Ok(pending) => pending
        .iter()
        .map(|(tag, r)| (tag.clone(), Arc::clone(&r.run)))
        .collect(),
      Err(_) => return 0,
    };

    let mut succeeded = 0;
    for (tag, run) in batch {
      let outcome = run().await;

      let Ok(mut pending) = self.pending.lock() else {
        continue;
      };
      match outcome {
        Ok(()) => {
          info!(tag = %tag, "deferred task completed");
          pending.remove(&tag);
          succeeded += 1;
        }
        Err(e) => {
          let attempts = match pending.get_mut(&tag) {
            Some(registration) => {
              registration.attempts += 1;
              registration.attempts
            }
            None => continue,
          };
          if attempts >= self.max_attempts {
            error!(tag = %tag, attempts, error = %e, "deferred task dropped");
            pending.remove(&tag);
          } else {
            warn!(tag = %tag, attempts, error = %e, "deferred task failed, will retry when online");
          }
        }
      }
    }
    succeeded
  }

  /// Spawn the dispatcher that delivers tasks whenever the host is online.
  pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
    let queue = Arc::clone(self);
    tokio::spawn(async move {
      let mut online = queue.online.clone();
      loop {
        if *online.borrow_and_update() {
          queue.run_pending().await;
        }

        tokio::select! {
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
          }
          _ = queue.wake.notified() => {}
        }
      }
    })
  }
}
