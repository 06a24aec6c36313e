mod config;
mod offline;
mod service;
mod store;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use offline::registry::ResolverRegistry;
use service::dispatcher::Dispatcher;
use store::Collection;

#[derive(Parser, Debug)]
#[command(name = "ombra")]
#[command(about = "A client-side offline mirror for portal-style data services")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ombra/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch the application snapshot and persist it for offline use
  Snapshot,
  /// Fetch a query, reconstructing it offline when the service is unreachable
  Query {
    /// Query id
    id: String,
  },
  /// Fetch a persistent object, reconstructing it offline when the service
  /// is unreachable
  Object {
    /// Persistent-object type id
    type_id: String,
    /// Object id
    object_id: String,
  },
  /// Fetch and cache the configured static-asset manifest
  InstallAssets,
  /// Show row counts per store collection
  Status,
  /// Wipe the offline store
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config)?;

  let registry = Arc::new(ResolverRegistry::new());
  let dispatcher = Dispatcher::new(&config, registry)?;

  match args.command {
    Command::Snapshot => {
      dispatcher.get_client_data().await?;
      dispatcher.get_application().await?;
      let queries = dispatcher
        .store()
        .context(|ctx| ctx.count(Collection::Queries))?;
      println!("Snapshot persisted ({} queries)", queries);
    }
    Command::Query { id } => {
      let query = dispatcher.get_query(&id).await?;
      println!("{}", serde_json::to_string_pretty(&query)?);
    }
    Command::Object { type_id, object_id } => {
      let object = dispatcher
        .get_persistent_object(&type_id, Some(&object_id), false)
        .await?;
      println!("{}", serde_json::to_string_pretty(&object)?);
    }
    Command::InstallAssets => {
      let installed = dispatcher.install_assets().await?;
      println!("Installed {} assets", installed);
    }
    Command::Status => {
      dispatcher.store().context(|ctx| {
        for collection in Collection::ALL {
          println!("{:>20}: {}", collection.table(), ctx.count(collection)?);
        }
        Ok(())
      })?;
    }
    Command::Clear => {
      dispatcher.store().context(|ctx| {
        for collection in Collection::ALL {
          ctx.clear(collection)?;
        }
        Ok(())
      })?;
      println!("Offline store cleared");
    }
  }

  Ok(())
}

/// Log to a daily-rolling file in the data directory so command output
/// stays clean.
fn init_tracing(
  config: &config::Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let dir = config.offline.data_dir()?;
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create data directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(dir, "ombra.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
