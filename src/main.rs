use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use shiftsync::{config, Connectivity, Engine, ListQuery, OfflineStore, Transaction, TransactionState};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shiftsync")]
#[command(about = "Inspect and replay the ShiftWork offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shiftsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Company to act on (overrides company_id from the config)
  #[arg(long)]
  company: Option<String>,

  /// Treat the device as offline: reads come from the cache only
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Installation identity, queue counts and cached collections
  Status,
  /// Transactions waiting for replay
  Pending,
  /// Transactions the server rejected, awaiting manual resolution
  Failed,
  /// Put a failed transaction back in the replay queue
  Retry { id: i64 },
  /// Drop a transaction from the log
  Discard { id: i64 },
  /// Replay the queue once against the API
  Sync,
  /// Read one entity through the cache
  Get {
    /// Resource path, e.g. /people
    path: String,
    id: String,
    /// Identity field in server responses
    #[arg(long, default_value = "id")]
    id_field: String,
  },
  /// Read a list through the cache
  List {
    /// Resource path, e.g. /people
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Remove every cached record of a collection
  Clear { collection: String },
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

fn init_logging(config: &config::Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let db_path = config.database_path()?;
  let log_dir = db_path
    .parent()
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&log_dir, "shiftsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shiftsync=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_transactions(txs: &[Transaction]) {
  if txs.is_empty() {
    println!("(none)");
    return;
  }
  for tx in txs {
    println!(
      "#{:<5} {:<6} {:<12} {} [{} attempt(s)] {}",
      tx.id,
      tx.method,
      tx.collection,
      tx.endpoint,
      tx.attempts,
      tx.timestamp.to_rfc3339()
    );
    if let Some(err) = &tx.last_error {
      println!("       last error: {}", err);
    }
    if let Some(parent) = tx.depends_on {
      println!("       waits for #{}", parent);
    }
  }
}

/// Rejected entries, each followed by the pending entries it holds back.
fn print_failed(store: &dyn OfflineStore) -> Result<()> {
  let failed = store.failed()?;
  print_transactions(&failed);
  for tx in &failed {
    let held = store.dependents(tx.id)?;
    if !held.is_empty() {
      println!("#{} holds back:", tx.id);
      print_transactions(&held);
    }
  }
  Ok(())
}

fn print_json(value: &Option<Value>) -> Result<()> {
  match value {
    Some(v) => println!("{}", serde_json::to_string_pretty(v)?),
    None => println!("null"),
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override company if specified on command line
  let config = if let Some(company) = args.company {
    config::Config {
      company_id: Some(company),
      ..config
    }
  } else {
    config
  };

  let _log_guard = init_logging(&config)?;

  let connectivity = Connectivity::new(!args.offline);
  let (engine, installation) = Engine::from_config(&config, connectivity)?;
  run(args.command, &engine, &installation).await
}

async fn run(
  command: Command,
  engine: &Engine,
  installation: &shiftsync::Installation,
) -> Result<()> {
  let store = engine.store();

  match command {
    Command::Status => {
      println!("installation: {} ({:?})", installation.id, installation.boot);
      println!("pending:      {}", store.count(TransactionState::Pending)?);
      println!("failed:       {}", store.count(TransactionState::Failed)?);
      println!("audit:        {}", store.count(TransactionState::Audit)?);
      println!("collections:  {}", store.collections()?.join(", "));
    }
    Command::Pending => print_transactions(&store.drain()?),
    Command::Failed => print_failed(&**store)?,
    Command::Retry { id } => {
      if store.retry(id)? {
        println!("#{} queued for replay", id);
      } else {
        return Err(eyre!("#{} is not a failed transaction", id));
      }
    }
    Command::Discard { id } => {
      if store.transaction(id)?.is_none() {
        return Err(eyre!("no transaction #{}", id));
      }
      store.remove(id)?;
      println!("#{} discarded", id);
    }
    Command::Sync => {
      let report = engine.coordinator().replay().await?;
      println!(
        "replayed {}, failed {}, quarantined {}, skipped {}, blocked {}",
        report.replayed, report.failed, report.quarantined, report.skipped, report.blocked
      );
    }
    Command::Get { path, id, id_field } => {
      let resource = engine.resource::<Value>(&path, &id_field)?;
      print_json(&resource.get(&id).await?)?;
    }
    Command::List { path, params } => {
      let resource = engine.resource::<Value>(&path, "id")?;
      let query = params
        .into_iter()
        .fold(ListQuery::new(), |q, (k, v)| q.param(k, v));
      let list = resource.get_all(&query).await?;
      print_json(&list.map(Value::Array))?;
    }
    Command::Clear { collection } => {
      store.clear(&collection)?;
      println!("cleared {}", collection);
    }
  }

  Ok(())
}
