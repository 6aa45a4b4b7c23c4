mod config;
mod debounce;
mod link;
mod state;
mod store;
mod sync;
mod web;
mod wire;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

use link::machine::LinkStatus;
use link::{Link, LinkSupervisor};
use state::{ControlSettings, DashState, SharedState};
use store::{MemStore, SqliteStore, Store};
use sync::Synchronizer;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::from_env()?;

    // Either backend satisfies the same gateway contract; pick at startup.
    if cfg.database.url == "memory" {
        info!("using in-memory store");
        run(cfg, MemStore::new()).await
    } else {
        let store = SqliteStore::connect(&cfg.database.url).await?;
        store.migrate().await?;
        info!(url = %cfg.database.url, "sqlite store ready");
        run(cfg, store).await
    }
}

async fn run<S: Store>(cfg: config::Config, store: S) -> Result<()> {
    // Hydrate the mirrored settings so a restart reflects the last known
    // state before the first telemetry arrives.
    let persisted = store.get_state().await?;
    let settings = ControlSettings::from_kv(&persisted);
    let shared: SharedState = Arc::new(RwLock::new(DashState::new(settings)));
    shared
        .write()
        .await
        .record_system("dashboard started".to_string());

    // ── Broker link plumbing ────────────────────────────────────────
    let client_slot = Arc::new(RwLock::new(None));
    let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let link = Link::new(
        Arc::clone(&client_slot),
        status_rx,
        cfg.topics.command.clone(),
    );
    let sync = Synchronizer::new(store.clone(), Arc::clone(&shared), link);

    let supervisor = LinkSupervisor::new(
        cfg.broker.clone(),
        cfg.topics.clone(),
        client_slot,
        status_tx,
        Arc::clone(&shared),
        sync.clone(),
        shutdown_rx,
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        state: Arc::clone(&shared),
        store,
        sync,
    };
    tokio::spawn(web::serve(app, cfg.web.port));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = supervisor_task.await;
    Ok(())
}
