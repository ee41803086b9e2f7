use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use fieldsync::cache::CacheSource;
use fieldsync::config::Config;
use fieldsync::event::SyncEvent;
use fieldsync::logging;
use fieldsync::model::Establishment;
use fieldsync::placeholder::{Row, VisibleState};
use fieldsync::push::{PushChannel, RealtimeChannel};
use fieldsync::remote::{RemoteStore, RestRemoteStore};
use fieldsync::storage::{DurableStorage, MemoryStorage, SqliteStorage};
use fieldsync::{AddOutcome, EngineOptions, Scope, SyncContext, SyncDomain, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-tolerant sync for congregation field-service records")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Congregation to sync
  #[arg(long)]
  congregation: Option<String>,

  /// Keep cache, ledger and outbox in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the congregation's establishments
  List,
  /// Follow the list as it changes until interrupted
  Watch,
  /// Add an establishment
  Add {
    name: String,
    #[arg(long)]
    address: Option<String>,
  },
  /// Delete an establishment
  Remove { id: String },
  /// Rename an establishment
  Rename { id: String, name: String },
  /// Show queued and refused writes
  Outbox,
  /// Replay queued writes and refresh
  Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(None)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override congregation if specified on command line
  let config = if let Some(congregation) = args.congregation {
    Config {
      congregation_id: Some(congregation),
      ..config
    }
  } else {
    config
  };

  let congregation = config
    .congregation_id
    .clone()
    .ok_or_else(|| eyre!("No congregation configured. Set congregation_id or pass --congregation"))?;

  let storage: Arc<dyn DurableStorage> = if args.ephemeral {
    Arc::new(MemoryStorage::new())
  } else {
    match &config.storage.path {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    }
  };
  let remote: Arc<dyn RemoteStore<Establishment>> = Arc::new(RestRemoteStore::new(&config)?);
  let push: Option<Arc<dyn PushChannel>> = match args.command {
    Command::Watch => Some(Arc::new(RealtimeChannel::new(&config)?)),
    _ => None,
  };

  let domain = SyncDomain::new(congregation.as_str());
  let options = EngineOptions::from_config(&config.sync, domain);
  let engine = SyncEngine::new(SyncContext { storage, remote, push }, options).await?;

  let result = run(&engine, args.command, &congregation).await;
  engine.shutdown();
  result
}

async fn run(engine: &SyncEngine<Establishment>, command: Command, congregation: &str) -> Result<()> {
  let mut events = engine.events();
  engine.open_scope(Scope::congregation(congregation)).await;

  match command {
    Command::List => print_state(&engine.visible().borrow()),
    Command::Watch => {
      let mut visible = engine.visible();
      print_state(&visible.borrow_and_update());
      loop {
        tokio::select! {
          changed = visible.changed() => {
            if changed.is_err() {
              break;
            }
            print_state(&visible.borrow_and_update());
          }
          Some(event) = events.next() => println!("{}", describe(&event)),
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
    Command::Add { name, address } => {
      let mut shop = Establishment::new(Uuid::new_v4().to_string(), congregation, name);
      shop.address = address;
      match engine.optimistic_add(shop).await? {
        AddOutcome::Created(id) => println!("Added {}", id),
        AddOutcome::Queued(id) => println!("Offline; {} will be added when the server is reachable", id),
        AddOutcome::AlreadyPresent => println!("Already on the list"),
      }
    }
    Command::Remove { id } => {
      engine.optimistic_delete(&id).await?;
      println!("Removed {}", id);
    }
    Command::Rename { id, name } => {
      engine.update(&id, serde_json::json!({ "name": name })).await?;
      println!("Renamed {}", id);
    }
    Command::Outbox => {
      let pending = engine.outbox().await;
      println!("{} queued", pending.len());
      for entry in pending {
        println!(
          "  {}  {:<6}  {}",
          entry.enqueued_at.format("%Y-%m-%d %H:%M"),
          entry.operation.kind(),
          entry.operation.entity_id()
        );
      }
      let rejected = engine.rejected_writes().await;
      if !rejected.is_empty() {
        println!("{} refused by the server", rejected.len());
        for refused in rejected {
          println!(
            "  {}  {:<6}  {}  ({})",
            refused.rejected_at.format("%Y-%m-%d %H:%M"),
            refused.entry.operation.kind(),
            refused.entry.operation.entity_id(),
            refused.reason
          );
        }
      }
    }
    Command::Sync => {
      let report = engine.drain_outbox().await;
      println!(
        "Replayed {}, refused {}, still queued {}",
        report.replayed,
        report.rejected.len(),
        report.remaining
      );
      if let Some(e) = report.stopped_by {
        println!("Stopped: {}", e);
      }
      engine.refresh_now().await;
      print_state(&engine.visible().borrow());
    }
  }

  while let Some(event) = events.try_next() {
    println!("{}", describe(&event));
  }
  Ok(())
}

fn print_state(state: &VisibleState<Establishment>) {
  let scope = state.scope.as_ref().map(|s| s.to_string()).unwrap_or_default();
  let source = match state.source {
    CacheSource::Empty => "nothing loaded",
    CacheSource::Network => "live",
    CacheSource::CacheFresh => "cached",
    CacheSource::CacheStale => "cached, stale",
    CacheSource::Offline => "offline",
  };
  let syncing = if state.syncing { ", syncing" } else { "" };
  println!("{} ({} rows, {}{})", scope, state.rows.len(), source, syncing);

  for row in &state.rows {
    match row {
      Row::Confirmed(shop) => match &shop.address {
        Some(address) => println!("  {:<36}  {}  [{}]", shop.id, shop.name, address),
        None => println!("  {:<36}  {}", shop.id, shop.name),
      },
      Row::Placeholder(p) => println!("  {:<36}  {} (saving...)", p.temp_id.to_string(), p.display_value),
    }
  }
  if let Some(error) = &state.last_error {
    println!("  ! {}", error);
  }
}

fn describe(event: &SyncEvent) -> String {
  match event {
    SyncEvent::QueuedOffline {
      display_value,
      operation,
    } => format!("queued {} of {} until back online", operation, display_value),
    SyncEvent::ActionFailed {
      display_value,
      reason,
    } => format!("could not save {}: {}", display_value, reason),
    SyncEvent::Online(true) => "back online".to_string(),
    SyncEvent::Online(false) => "offline".to_string(),
    SyncEvent::OutboxReplayed { replayed, remaining } => {
      format!("sent {} queued change(s), {} left", replayed, remaining)
    }
    SyncEvent::OutboxRejected { count } => {
      format!("server refused {} queued change(s); see `fieldsync outbox`", count)
    }
    SyncEvent::RefreshFailed { scope, reason } => format!("refresh of {} failed: {}", scope, reason),
  }
}
