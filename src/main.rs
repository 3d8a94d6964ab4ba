// =============================================================================
// Meridian Engine — Main Entry Point
// =============================================================================
//
// Builds the dependency graph, spawns the long-running tasks, and serves the
// API until a shutdown signal arrives.  The persistence writer flushes its
// current batch before exit; LP adapters close their connections gracefully.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod config;
mod dispatcher;
mod hub;
mod ledger;
mod lp;
mod market_data;
mod persistence;
mod routing;
mod symbols;
mod toxicity;
mod types;

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::EngineState;
use crate::config::RuntimeConfig;
use crate::lp::LpEvent;

/// Capacity of the adapter -> ingestion event channel.
const LP_EVENT_QUEUE: usize = 8_192;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Engine starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides();
        config
    });

    info!(
        bind_addr = %config.bind_addr,
        symbols = config.symbols.len(),
        lps = config.lps.len(),
        accounts = config.accounts.len(),
        "runtime config resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let (lp_events_tx, mut lp_events_rx) = tokio::sync::mpsc::channel::<LpEvent>(LP_EVENT_QUEUE);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (state, writer) = EngineState::new(config, lp_events_tx);
    let state = Arc::new(state);

    // ── 3. Persistence writer task ───────────────────────────────────────
    let writer_shutdown = shutdown_rx.clone();
    let writer_task = tokio::spawn(writer.run(writer_shutdown));

    // ── 4. Ingestion task: adapters -> pipeline ──────────────────────────
    let ingest_state = state.clone();
    tokio::spawn(async move {
        while let Some(event) = lp_events_rx.recv().await {
            match event {
                LpEvent::Tick(tick) => ingest_state.ingest_tick(tick),
                LpEvent::Fill(fill) => {
                    // A-book fills resolve synchronously inside the
                    // dispatcher; the event stream is informational.
                    debug!(
                        lp = %fill.lp,
                        symbol = %fill.symbol,
                        volume = fill.volume,
                        price = fill.price,
                        "LP fill reported"
                    );
                }
            }
        }
        info!("ingestion task stopped");
    });

    // ── 5. LP adapters ───────────────────────────────────────────────────
    for lp_config in &state.config.lps {
        state.spawn_lp(lp_config);
    }
    info!(count = state.config.lps.len(), "LP adapters launched");

    // ── 6. Hub flusher (frame-rate delta batching) ───────────────────────
    let flusher_state = state.clone();
    let mut flusher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut frame = tokio::time::interval(tokio::time::Duration::from_millis(
            flusher_state.config.broadcast_interval_ms.max(1),
        ));
        loop {
            tokio::select! {
                _ = frame.tick() => {
                    let closed = flusher_state.hub.flush_all();
                    for conn_id in closed {
                        warn!(conn_id, "slow consumer flagged for close");
                    }
                }
                _ = flusher_shutdown.changed() => break,
            }
        }
    });

    // ── 7. Retention janitor (daily archive/expiry sweep) ────────────────
    let janitor_state = state.clone();
    let mut janitor_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(tokio::time::Duration::from_secs(24 * 3600));
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let data_dir = std::path::PathBuf::from(&janitor_state.config.data_dir);
                    let archive_after = janitor_state.config.archive_after_days;
                    let retention = janitor_state.config.retention_days;
                    let result = tokio::task::spawn_blocking(move || {
                        persistence::retention::run_sweep(
                            &data_dir,
                            archive_after,
                            retention,
                            chrono::Utc::now().date_naive(),
                        )
                    })
                    .await;
                    match result {
                        Ok(Ok(report)) => info!(
                            archived = report.archived,
                            deleted = report.deleted,
                            "retention sweep complete"
                        ),
                        Ok(Err(e)) => error!(error = %e, "retention sweep failed"),
                        Err(e) => error!(error = %e, "retention sweep panicked"),
                    }
                }
                _ = janitor_shutdown.changed() => break,
            }
        }
    });

    // ── 8. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    });
    let server_task = tokio::spawn(async move { server.await });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    state.stop_all_lps();

    // The writer drains its batch before exiting; give it a bounded wait.
    match tokio::time::timeout(std::time::Duration::from_secs(10), writer_task).await {
        Ok(Ok(())) => info!("persistence writer drained"),
        Ok(Err(e)) => error!(error = %e, "persistence writer task failed"),
        Err(_) => warn!("persistence writer did not drain in time"),
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_task).await;

    info!("Meridian Engine shut down complete");
    Ok(())
}
