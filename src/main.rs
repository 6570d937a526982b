use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use harbor::net::HttpRequest;
use harbor::{config, logging, CachingEngine, WriteOutcome};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(about = "Offline-first HTTP cache and background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/harbor/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a URL through the cache
  Fetch { url: String },
  /// Send a write; queue it for replay if the network is down
  Send {
    method: String,
    url: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay queued writes now
  Sync,
  /// List queued writes
  Queue {
    /// Show dead-lettered operations instead
    #[arg(long)]
    dead: bool,
    /// Delete dead-lettered operations
    #[arg(long, requires = "dead")]
    purge: bool,
  },
  /// Put a dead-lettered operation back in the queue
  Requeue { id: i64 },
  /// Print cache and queue statistics
  Stats,
  /// Precache the configured URLs and drop stale cache versions
  Install,
  /// Evict expired entries and old cache versions
  Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _log_guard = logging::init(&config)?;
  let engine = CachingEngine::open(config)?;

  let output = match args.command {
    Command::Fetch { url } => {
      let url = engine.origin().resolve(&url)?;
      let served = engine.handle_fetch(&HttpRequest::get(url)).await;
      json!({
        "status": served.response.status,
        "source": format!("{:?}", served.source),
        "headers": served.response.headers,
        "body": String::from_utf8_lossy(&served.response.body),
      })
    }
    Command::Send { method, url, data } => {
      let url = engine.origin().resolve(&url)?;
      let mut request = HttpRequest::new(&method, url);
      if let Some(data) = data {
        request = request
          .with_header("content-type", "application/json")
          .with_body(data);
      }
      match engine.submit_write(&request).await? {
        WriteOutcome::Sent(response) => json!({
          "sent": true,
          "status": response.status,
          "body": String::from_utf8_lossy(&response.body),
        }),
        WriteOutcome::Queued(op) => json!({ "sent": false, "queued": op }),
      }
    }
    Command::Sync => serde_json::to_value(engine.sync_now().await)?,
    Command::Queue { purge: true, .. } => {
      json!({ "purged": engine.log().purge_dead_letters()? })
    }
    Command::Queue { dead, .. } => {
      let ops = if dead {
        engine.log().dead_letters()?
      } else {
        engine.log().pending()?
      };
      serde_json::to_value(ops)?
    }
    Command::Requeue { id } => {
      if !engine.log().requeue(id)? {
        return Err(eyre!("No dead-lettered operation with id {}", id));
      }
      json!({ "requeued": id })
    }
    Command::Stats => serde_json::to_value(engine.control().stats().await?)?,
    Command::Install => {
      let installed = engine.install().await;
      let activated = engine.activate()?;
      json!({ "install": installed, "activate": activated })
    }
    Command::Prune => serde_json::to_value(engine.activate()?)?,
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}
