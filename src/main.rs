mod cache;
mod config;
mod error;
mod event;
mod kv;
mod logging;
mod net;
mod notify;
mod router;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use event::{Event, EventHandler};
use net::NetworkClient;
use notify::TerminalNotifier;
use router::Served;
use worker::OfflineWorker;

#[derive(Parser, Debug)]
#[command(name = "ratecache")]
#[command(about = "Offline availability layer for the currency converter")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ratecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest into the current generation
  Install,
  /// Delete every generation except the current one
  Activate,
  /// Route a request for a path through the caching strategies
  Fetch { path: String },
  /// Read a key-value record
  Get { key: String },
  /// Store a JSON value under a key
  Put { key: String, value: String },
  /// Fetch and store the latest rates now
  RefreshRates,
  /// Start, then serve commands from stdin until EOF
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?, args.verbose)?;
  match &config.source {
    Some(path) => info!(path = %path.display(), "configuration loaded"),
    None => info!("no configuration file found, using defaults"),
  }

  let notifier = Arc::new(TerminalNotifier);

  match args.command {
    Command::Run => {
      let (online_tx, online_rx) = watch::channel(false);
      let worker = Arc::new(OfflineWorker::from_config(&config, online_rx, notifier)?);
      run(worker, &config, Arc::new(online_tx)).await
    }
    command => {
      // One-shot commands assume the host is online.
      let (_online_tx, online_rx) = watch::channel(true);
      let worker = OfflineWorker::from_config(&config, online_rx, notifier)?;
      run_once(&worker, &config, command).await
    }
  }
}

async fn run_once(worker: &OfflineWorker, config: &config::Config, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      let count = worker.install().await?;
      println!("cached {} entries in {}", count, config.generation().name());
    }
    Command::Activate => {
      let deleted = worker.activate().await?;
      if deleted.is_empty() {
        println!("no stale generations");
      }
      for name in deleted {
        println!("deleted {}", name);
      }
    }
    Command::Fetch { path } => {
      let served = worker.fetch_path(&path).await?;
      print_served(&served)?;
    }
    Command::Get { key } => match worker.store().get(&key)?.into_option() {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => return Err(eyre!("{}: not found", key)),
    },
    Command::Put { key, value } => {
      let value: serde_json::Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
      worker.store().put(&key, &value)?;
    }
    Command::RefreshRates => {
      worker.sync(&config.rates.sync_tag).await?;
      if let Some(rates) = worker.rates().stored()? {
        println!(
          "{} rates for {} (base {})",
          rates.rates.len(),
          rates.date,
          rates.base
        );
      }
    }
    Command::Run => unreachable!("handled by main"),
  }
  Ok(())
}

/// Long-running host loop: start the worker, deliver deferred tasks while
/// online and route requests read from stdin.
async fn run(
  worker: Arc<OfflineWorker>,
  config: &config::Config,
  online: Arc<watch::Sender<bool>>,
) -> Result<()> {
  let state = worker.start().await?;
  info!(?state, "worker started");

  let dispatcher = worker.queue().spawn();
  let probe = if config.sync.probe_interval_secs > 0 {
    Some(event::spawn_connectivity_probe(
      NetworkClient::new(config.network_timeout())?,
      config.origin_url()?,
      Duration::from_secs(config.sync.probe_interval_secs),
      Arc::clone(&online),
    ))
  } else {
    online.send_replace(true);
    None
  };

  let mut events = EventHandler::new();
  while let Some(event) = events.next().await {
    match event {
      Event::Fetch(path) => {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
          match worker.fetch_path(&path).await {
            Ok(served) => {
              println!(
                "{} {} {:?} {} bytes",
                path,
                served.response.status,
                served.source,
                served.response.body.len()
              );
            }
            Err(e) => println!("{} failed: {}", path, e),
          }
        });
      }
      Event::Online(value) => {
        online.send_replace(value);
      }
      Event::Sync(tag) => {
        let tag = tag.unwrap_or_else(|| config.rates.sync_tag.clone());
        if let Err(e) = worker.sync(&tag).await {
          warn!(tag = %tag, error = %e, "sync failed");
          println!("sync {} failed: {}", tag, e);
        }
      }
      Event::Quit => break,
    }
  }

  let pending = worker.queue().pending_tags();
  if !pending.is_empty() {
    warn!(?pending, "exiting with deferred tasks still registered");
  }

  dispatcher.abort();
  if let Some(probe) = probe {
    probe.abort();
  }
  Ok(())
}

fn print_served(served: &Served) -> Result<()> {
  eprintln!(
    "{} ({:?}) {}",
    served.response.status,
    served.source,
    served.response.header("content-type").unwrap_or("-")
  );
  let mut out = std::io::stdout().lock();
  out.write_all(&served.response.body)?;
  out.flush()?;
  Ok(())
}
