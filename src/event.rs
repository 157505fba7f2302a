use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::net::{NetworkClient, Request};

/// Host events forwarded to the worker
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
  /// Intercepted request for a path
  Fetch(String),
  /// Connectivity changed
  Online(bool),
  /// Run a deferred task now
  Sync(Option<String>),
  Quit,
}

impl Event {
  /// Parse one command line: `GET /path`, `/path`, `online`, `offline`,
  /// `sync [tag]` or `quit`.
  pub fn parse(line: &str) -> Option<Self> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    match first {
      "online" => Some(Event::Online(true)),
      "offline" => Some(Event::Online(false)),
      "sync" => Some(Event::Sync(parts.next().map(String::from))),
      "quit" | "exit" => Some(Event::Quit),
      "GET" | "get" => parts.next().map(|p| Event::Fetch(p.to_string())),
      path if path.starts_with('/') => Some(Event::Fetch(path.to_string())),
      _ => None,
    }
  }
}

/// Event handler that produces events from stdin commands
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => match Event::parse(&line) {
            Some(event) => {
              if tx.send(event).is_err() {
                break;
              }
            }
            None if line.trim().is_empty() => {}
            None => eprintln!("unrecognized command: {}", line.trim()),
          },
          _ => {
            let _ = tx.send(Event::Quit);
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Periodically probe `origin` and publish reachability on `online`.
pub fn spawn_connectivity_probe(
  client: NetworkClient,
  origin: Url,
  interval: Duration,
  online: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    let probe = Request {
      method: Method::HEAD,
      url: origin,
    };
    loop {
      ticker.tick().await;
      // Any HTTP answer means the origin is reachable.
      let reachable = client.fetch(&probe).await.is_ok();
      let previous = online.send_replace(reachable);
      if previous != reachable {
        info!(online = reachable, "connectivity changed");
      } else {
        debug!(online = reachable, "connectivity probe");
      }
    }
  })
}
