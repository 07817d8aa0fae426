//! tessera-server binary.
//!
//! Reads `tessera.toml` (or the path given with `--config`) layered with
//! `TESSERA_*` environment variables, opens the SQLite fragment store and
//! serves the fragment API over HTTP.
//!
//! Nested keys use a double underscore, e.g.
//! `TESSERA_RESOLVER__MAX_VERTICES=50000`.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context as _;
use clap::Parser;
use tessera_overlay::OverlapResolver;
use tessera_server::{AppState, FragmentService, ServerConfig};
use tessera_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tessera sketch fragment server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tessera.toml")]
  config: PathBuf,

  /// Delete fragments no sketch references, then exit.
  #[arg(long)]
  sweep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("TESSERA")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let store_path = expand_tilde(&server_cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  if cli.sweep {
    let swept = store.sweep_orphans().await.context("orphan sweep failed")?;
    tracing::info!(swept, "swept orphaned fragments");
    return Ok(());
  }

  let service = FragmentService::new(
    Arc::new(store),
    OverlapResolver::new(server_cfg.resolver.clone()),
    Duration::from_millis(server_cfg.resolve_timeout_ms),
  );
  let state = AppState { service: Arc::new(service), config: Arc::new(server_cfg.clone()) };

  let app = tessera_server::router(state);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
