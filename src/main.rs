mod cache;
mod classify;
mod config;
mod db;
mod engine;
mod error;
mod host;
mod http;
mod notify;
mod queue;
mod sync;
#[cfg(test)]
mod testing;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::SqliteNamespaceStorage;
use db::Database;
use engine::{Engine, HostMessage, MessageReply, WriteOutcome};
use error::EngineResult;
use host::StdoutHost;
use http::{Destination, HttpNetwork, Request, RequestMode};
use notify::Interaction;
use queue::PendingWriteQueue;
use sync::FlushOutcome;

type AppEngine = Engine<SqliteNamespaceStorage, HttpNetwork, StdoutHost>;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-resilient request cache and write-behind sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, overrides the configured one
  #[arg(long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the cache from the install manifest
  Install,
  /// Delete superseded cache generations and start serving
  Activate,
  /// Intercept a request and print the response. A cached static asset is
  /// printed at once; the command then waits for its background refresh
  Fetch {
    url: String,
    #[arg(long)]
    accept: Option<String>,
    #[arg(long, value_enum, default_value_t = Destination::Empty)]
    destination: Destination,
    #[arg(long, value_enum)]
    mode: Option<RequestMode>,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Send a write, queueing it if the backend cannot take it
  Write { write_type: String, payload: String },
  /// Queue a write without trying the network
  Enqueue { write_type: String, payload: String },
  /// Fire a background trigger
  Sync { tag: String },
  /// Signal that connectivity came back
  Online,
  /// Show lifecycle state and cached entries per namespace
  Status,
  /// Show pending writes
  Queue {
    write_type: Option<String>,
    /// Only writes queued in the last N minutes, across all types
    #[arg(long)]
    since: Option<i64>,
  },
  /// Deliver a push payload (JSON)
  Push { payload: Option<String> },
  /// Resolve a notification action
  Click {
    action: String,
    #[arg(long)]
    tag: Option<String>,
    /// Notification context data (JSON)
    #[arg(long)]
    data: Option<String>,
  },
  /// Post a host message (skip-wait, get-version)
  Message { message: String },
}

/// Initialize logging to stderr and a daily log file
fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "offsync.log"));

  // Use RUST_LOG to control the level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing()?;

  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let db = Database::open(&config.database_path()?)?;
  let storage = SqliteNamespaceStorage::new(db.clone());
  let engine: AppEngine = Engine::new(
    &config,
    storage.clone(),
    PendingWriteQueue::new(db),
    Arc::new(HttpNetwork::new()?),
    Arc::new(StdoutHost),
  )?;
  let state = engine.restore_state()?;
  info!(?state, "Engine ready");

  match args.command {
    Command::Install => {
      engine::ensure_configured(&config)?;
      let entries = engine.install().await?;
      println!("installed {} entries", entries);
    }
    Command::Activate => {
      for name in engine.activate()? {
        println!("deleted {}", name);
      }
    }
    Command::Fetch {
      url,
      accept,
      destination,
      mode,
      navigate,
    } => {
      let url = config.resolve(&url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      if let Some(accept) = accept {
        request = request.with_accept(accept);
      }
      request = request.with_destination(destination);
      if let Some(mode) = mode {
        request = request.with_mode(mode);
      }

      let response = engine.intercept(&request).await?;
      println!("{}", response.status);
      match response.json() {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&response.body)),
      }
      engine.settle_background().await;
    }
    Command::Write {
      write_type,
      payload,
    } => match engine.submit_write(&write_type, parse_json(&payload)?).await? {
      WriteOutcome::Delivered => println!("delivered"),
      WriteOutcome::Queued(id) => println!("queued {}", id),
    },
    Command::Enqueue {
      write_type,
      payload,
    } => {
      let id = engine.queue().enqueue(&write_type, &parse_json(&payload)?)?;
      println!("queued {}", id);
    }
    Command::Sync { tag } => print_outcomes(&engine.background_trigger(&tag).await)?,
    Command::Online => print_outcomes(&engine.connectivity_restored().await)?,
    Command::Status => {
      println!("state\t{:?}", state);
      for namespace in engine.namespaces() {
        println!("{}\t{}", namespace, storage.entry_count(namespace)?);
      }
    }
    Command::Queue { write_type, since } => {
      let entries = match (write_type, since) {
        (Some(write_type), _) => engine.queue().list_by_type(&write_type)?,
        (None, Some(minutes)) => {
          let (from, to) = recent_window(Utc::now(), minutes)?;
          engine.queue().list_created_between(from, to)?
        }
        (None, None) => {
          for (write_type, count) in engine.queue().count_by_type()? {
            println!("{}\t{}", write_type, count);
          }
          return Ok(());
        }
      };
      for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
      }
    }
    Command::Push { payload } => {
      if engine.push(payload.as_deref().map(str::as_bytes))?.is_none() {
        println!("no payload, nothing shown");
      }
    }
    Command::Click { action, tag, data } => {
      let context = match data {
        Some(data) => parse_json(&data)?,
        None => serde_json::Value::Null,
      };
      if engine.notification_interaction(&action, tag.as_deref(), &context)? == Interaction::Dismissed
      {
        println!("dismissed");
      }
    }
    Command::Message { message } => match engine.message(message.parse::<HostMessage>()?)? {
      MessageReply::Ack => println!("ok"),
      MessageReply::Version(version) => println!("{}", version),
    },
  }

  Ok(())
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))
}

/// `[now - minutes, now)`, rejecting spans chrono cannot represent
fn recent_window(now: DateTime<Utc>, minutes: i64) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
  let span = Duration::try_minutes(minutes)
    .ok_or_else(|| eyre!("--since {} minutes is out of range", minutes))?;
  let from = now
    .checked_sub_signed(span)
    .ok_or_else(|| eyre!("--since {} minutes reaches past the supported date range", minutes))?;
  Ok((from, now))
}

/// Print every per-type result; fail if any type hit a storage error.
fn print_outcomes(results: &[EngineResult<FlushOutcome>]) -> Result<()> {
  let mut failed = 0;
  for result in results {
    match result {
      Ok(outcome) if outcome.is_complete() => {
        println!("{}: flushed {}", outcome.queue_type, outcome.flushed)
      }
      Ok(outcome) => {
        if let Some((id, reason)) = &outcome.failure {
          println!(
            "{}: flushed {}, {} remaining, stopped at {}: {}",
            outcome.queue_type, outcome.flushed, outcome.remaining, id, reason
          );
        }
      }
      Err(e) => {
        println!("error: {}", e);
        failed += 1;
      }
    }
  }

  if failed > 0 {
    return Err(eyre!("{} queue type(s) could not be flushed", failed));
  }
  Ok(())
}
