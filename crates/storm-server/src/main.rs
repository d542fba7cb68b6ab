use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use storm_api::{build_app, AppState};
use storm_engine::{run_dispatcher, run_sweeper, PlainRenderer};
use storm_store::{DocumentStore, EntityStore, MemoryStore, RedbStore};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The Perfect Storm coordinator.
#[derive(Debug, Parser)]
#[command(name = "stormd")]
struct Args {
    /// Document store URI: `memory:` or `redb:<path>`.
    #[arg(long, env = "STORM_STORE_URI", default_value = "memory:")]
    store_uri: String,

    /// Address to listen on.
    #[arg(long, env = "STORM_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Log at debug level unless RUST_LOG overrides it.
    #[arg(long, env = "STORM_DEBUG", default_value_t = false)]
    debug: bool,
}

fn open_store(uri: &str) -> Result<Arc<dyn DocumentStore>> {
    if uri == "memory:" || uri == "memory://" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(path) = uri.strip_prefix("redb:") {
        let store = RedbStore::open(&PathBuf::from(path))
            .with_context(|| format!("opening store at {path}"))?;
        return Ok(Arc::new(store));
    }
    bail!("unsupported store URI: {uri} (expected memory: or redb:<path>)")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let db = open_store(&args.store_uri)?;
    let entities = EntityStore::new(db);
    let state = AppState::new(entities.clone(), Arc::new(PlainRenderer));

    // Background tasks carry their own shutdown signal and re-read all state
    // from the store every iteration, so they tolerate restarts.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(
        entities.clone(),
        state.sweep.clone(),
        shutdown_rx.clone(),
    ));
    let dispatcher = tokio::spawn(run_dispatcher(
        entities,
        state.renderer.clone(),
        shutdown_rx,
    ));

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, store = %args.store_uri, "stormd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, dispatcher);
    info!("stormd stopped");
    Ok(())
}
