use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use feedsync::cache::CacheDomain;
use feedsync::sync::ConflictStrategy;
use feedsync::{db, Config, Event, EventHandler, OfflineLayer};
use serde::Serialize;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feedsync")]
#[command(about = "Inspect and operate the offline cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sync queue and network status
  Status,
  /// Cache statistics per domain
  Stats,
  /// Remove expired entries from the store and the cache index
  Cleanup,
  /// Drain the sync queue once
  Sync,
  /// List queued items and pending conflicts
  Queue,
  /// Give items that ran out of retries another round
  RetryFailed,
  /// Drop a queued item
  Discard { item_id: String },
  /// Resolve a pending conflict in favour of the local or remote copy
  Resolve {
    conflict_id: String,
    strategy: ConflictStrategy,
  },
  /// Invalidate one cache domain (optionally one scope), or everything with --all
  Invalidate {
    domain: Option<CacheDomain>,
    scope: Option<String>,
    #[arg(long, conflicts_with = "domain")]
    all: bool,
  },
  /// Run the background tasks and stream network and sync events until interrupted
  Watch,
}

fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = db::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "feedsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("FEEDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", json);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let mut layer = OfflineLayer::start(config).await?;

  match args.command {
    Command::Status => {
      print_json(&layer.status())?;
      println!(
        "network: {} ({:?}), storage: {}{}",
        layer.network().state(),
        layer.network().speed(),
        layer.store().backend_name(),
        if layer.store().is_degraded() {
          " (degraded)"
        } else {
          ""
        }
      );
    }
    Command::Stats => print_json(&layer.cache().stats())?,
    Command::Cleanup => {
      let store_removed = layer.store().cleanup();
      let cache_removed = layer.cache().cleanup_expired();
      println!(
        "removed {} expired entries ({} tracked by the cache index)",
        store_removed + cache_removed,
        cache_removed
      );
    }
    Command::Sync => {
      layer.network().probe_once().await;
      if !layer.network().is_online() {
        return Err(eyre!("Backend unreachable; queue left untouched"));
      }
      print_json(&layer.sync().start_sync().await)?;
    }
    Command::Queue => {
      print_json(&layer.sync().queue_items())?;
      print_json(&layer.sync().pending_conflicts())?;
    }
    Command::RetryFailed => {
      let count = layer.sync().retry_failed();
      println!("re-queued {} items", count);
      layer.sync().settle().await;
      print_json(&layer.status())?;
    }
    Command::Discard { item_id } => {
      layer.sync().discard(&item_id)?;
      println!("discarded {}", item_id);
    }
    Command::Resolve {
      conflict_id,
      strategy,
    } => {
      layer.sync().resolve_conflict(&conflict_id, strategy)?;
      println!("resolved {} as {:?}", conflict_id, strategy);
    }
    Command::Invalidate { domain, scope, all } => {
      let removed = match (domain, all) {
        (_, true) => layer.cache().invalidate_all(),
        (Some(domain), false) => layer.cache().invalidate(domain, scope.as_deref()),
        (None, false) => return Err(eyre!("Give a cache domain or --all")),
      };
      println!("invalidated {} entries", removed);
    }
    Command::Watch => {
      layer.spawn_background();
      let mut events = EventHandler::new(layer.network(), layer.sync());
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          event = events.next() => match event {
            Some(Event::Network(transition)) => {
              println!("network: {} -> {}", transition.from, transition.to)
            }
            Some(Event::Sync(event)) => print_json(&event)?,
            None => break,
          },
        }
      }
    }
  }

  layer.shutdown().await;
  Ok(())
}
