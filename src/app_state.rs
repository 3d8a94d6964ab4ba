// =============================================================================
// Central Engine State — Meridian Trading Engine
// =============================================================================
//
// The single place the dependency graph is tied together.  Every subsystem
// manages its own interior mutability; `EngineState` holds Arcs, provides the
// tick ingestion glue (ring -> OHLC -> persistence -> ledger mark -> hub),
// and exposes the operational snapshot the REST surface serves.
//
// Constructed once in `main` and injected everywhere; there are no
// package-level globals.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::api::auth::{AuthProvider, StaticTokenProvider};
use crate::audit::AuditLog;
use crate::config::{LpConfig, LpKind, RuntimeConfig};
use crate::dispatcher::ExecutionDispatcher;
use crate::hub::QuoteHub;
use crate::ledger::Ledger;
use crate::lp::{self, LpEvent, LpManager};
use crate::market_data::{OhlcAggregator, Tick, TickStats, TickStore};
use crate::persistence::{TickWriter, TickWriterHandle};
use crate::routing::RoutingEngine;
use crate::symbols::SymbolRegistry;
use crate::toxicity::RollingToxicityScorer;

/// Central state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub config: RuntimeConfig,

    // ── Market data ─────────────────────────────────────────────────────
    pub symbols: Arc<SymbolRegistry>,
    pub ticks: Arc<TickStore>,
    pub ohlc: Arc<OhlcAggregator>,

    // ── Fan-out ─────────────────────────────────────────────────────────
    pub hub: Arc<QuoteHub>,

    // ── Trading ─────────────────────────────────────────────────────────
    pub ledger: Arc<Ledger>,
    pub router: Arc<RoutingEngine>,
    pub lps: Arc<LpManager>,
    pub toxicity: Arc<RollingToxicityScorer>,
    pub dispatcher: Arc<ExecutionDispatcher>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub writer: TickWriterHandle,

    // ── Collaborators ───────────────────────────────────────────────────
    pub auth: Arc<dyn AuthProvider>,
    pub audit: AuditLog,

    // ── LP task plumbing (used by startup and the admin LP surface) ─────
    lp_events: mpsc::Sender<LpEvent>,
    lp_stops: Mutex<HashMap<String, watch::Sender<bool>>>,

    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Build the full dependency graph. Returns the state plus the
    /// persistence writer, which the caller spawns onto its own task.
    pub fn new(
        config: RuntimeConfig,
        lp_events: mpsc::Sender<LpEvent>,
    ) -> (Self, TickWriter) {
        let symbols = Arc::new(SymbolRegistry::new(&config.symbols));
        let ticks = Arc::new(TickStore::new(
            config.max_ticks_per_symbol,
            config.throttle_epsilon,
        ));
        let ohlc = Arc::new(OhlcAggregator::new(config.ohlc_history_bars));
        let hub = Arc::new(QuoteHub::new(
            config.broadcast_batch_size,
            config.outbound_queue_capacity,
            config.slow_consumer_cycles,
        ));
        let ledger = Arc::new(Ledger::new(&config.accounts, config.stop_out_level_pct));
        let router = Arc::new(RoutingEngine::new(
            config.default_route,
            config.decision_history,
        ));
        let lps = Arc::new(LpManager::new());
        let toxicity = Arc::new(RollingToxicityScorer::default());

        let (writer, writer_handle) = TickWriter::new(
            config.data_dir.clone(),
            config.persist_queue_capacity,
            config.persist_batch_size,
            config.persist_flush_secs,
        );

        let dispatcher = Arc::new(ExecutionDispatcher::new(
            ledger.clone(),
            router.clone(),
            lps.clone(),
            ticks.clone(),
            hub.clone(),
            symbols.clone(),
            toxicity.clone(),
            std::time::Duration::from_secs(config.lp_order_timeout_secs),
            std::time::Duration::from_secs(config.dedup_window_secs),
        ));

        let auth: Arc<dyn AuthProvider> =
            Arc::new(StaticTokenProvider::new(config.tokens.clone()));
        let audit = AuditLog::new(std::path::Path::new(&config.data_dir));

        let state = Self {
            symbols,
            ticks,
            ohlc,
            hub,
            ledger,
            router,
            lps,
            toxicity,
            dispatcher,
            writer: writer_handle,
            auth,
            audit,
            lp_events,
            lp_stops: Mutex::new(HashMap::new()),
            start_time: std::time::Instant::now(),
            config,
        };
        (state, writer)
    }

    // -------------------------------------------------------------------------
    // Tick ingestion glue
    // -------------------------------------------------------------------------

    /// Drive one upstream tick through the whole pipeline. Called from the
    /// ingestion task for every `LpEvent::Tick`; never blocks on I/O.
    pub fn ingest_tick(&self, tick: Tick) {
        let symbol = tick.symbol.clone();
        let (bid, ask) = (tick.bid, tick.ask);

        if !self.ticks.store(tick.clone()) {
            // Throttled: indistinguishable downstream from never occurring.
            return;
        }

        self.ohlc.on_tick(&tick);
        self.writer.enqueue(&tick);

        let outcome = self.ledger.mark_to_market(&symbol, bid, ask);
        for trade in &outcome.triggered {
            self.hub.publish_execution(
                trade.account_id,
                &serde_json::json!({ "type": "position_closed", "trade": trade }),
            );
        }
        for event in &outcome.liquidations {
            self.hub.publish_execution(
                event.account_id,
                &serde_json::json!({ "type": "liquidation", "event": event }),
            );
        }

        self.hub.publish_tick(&tick);
    }

    // -------------------------------------------------------------------------
    // LP lifecycle
    // -------------------------------------------------------------------------

    /// Build, register, and start an adapter for one configured LP.
    pub fn spawn_lp(&self, cfg: &LpConfig) {
        if !cfg.enabled {
            info!(lp = %cfg.name, "LP disabled, skipping");
            return;
        }

        let health = self.lps.health();
        let adapter: Arc<dyn lp::LpAdapter> = match cfg.kind {
            LpKind::Fix => Arc::new(lp::fix::FixAdapter::new(
                cfg.name.clone(),
                cfg.endpoint.clone(),
                cfg.sender_comp_id.clone(),
                cfg.target_comp_id.clone(),
                &cfg.symbols,
                health.clone(),
            )),
            LpKind::WsJson => Arc::new(lp::ws_json::WsJsonAdapter::new(
                cfg.name.clone(),
                cfg.endpoint.clone(),
                &cfg.symbols,
                health.clone(),
            )),
            LpKind::RestPoll => Arc::new(lp::rest_poll::RestPollAdapter::new(
                cfg.name.clone(),
                cfg.endpoint.clone(),
                cfg.api_key.clone(),
                cfg.api_secret.clone(),
                &cfg.symbols,
                health.clone(),
            )),
        };

        self.lps.register(adapter.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        self.lp_stops.lock().insert(cfg.name.clone(), stop_tx);

        let events = self.lp_events.clone();
        tokio::spawn(lp::run_adapter(adapter, health, events, stop_rx));
    }

    /// Stop an adapter's reconnect loop and drop it from the registry.
    pub fn stop_lp(&self, name: &str) -> bool {
        if let Some(stop) = self.lp_stops.lock().remove(name) {
            let _ = stop.send(true);
        }
        let removed = self.lps.remove(name);
        if removed {
            info!(lp = name, "LP adapter stopped");
        }
        removed
    }

    /// Stop every adapter (process shutdown).
    pub fn stop_all_lps(&self) {
        let names: Vec<String> = self.lp_stops.lock().keys().cloned().collect();
        for name in names {
            self.stop_lp(&name);
        }
    }

    // -------------------------------------------------------------------------
    // Operational snapshot
    // -------------------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            uptime_secs: self.start_time.elapsed().as_secs(),
            tick_stats: self.ticks.stats(),
            persistence_dropped: self.writer.dropped(),
            ws_connections: self.hub.connection_count(),
            lp_health: self.lps.health_snapshot(),
            account_count: self.ledger.account_ids().len(),
            symbol_count: self.symbols.names().len(),
        }
    }
}

/// Operator-facing status payload for `GET /api/state`.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub uptime_secs: u64,
    pub tick_stats: TickStats,
    pub persistence_dropped: u64,
    pub ws_connections: usize,
    pub lp_health: HashMap<String, crate::lp::LpHealth>,
    pub account_count: usize,
    pub symbol_count: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::types::{Classification, MarginMode};

    fn state() -> EngineState {
        let mut config = RuntimeConfig::default();
        config.accounts = vec![AccountConfig {
            id: 1,
            user_id: 1,
            group: "retail".into(),
            leverage: 100,
            margin_mode: MarginMode::Hedging,
            balance: 10_000.0,
            credit: 0.0,
            classification: Classification::Normal,
        }];
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (state, _writer) = EngineState::new(config, events_tx);
        state
    }

    fn tick(bid: f64, ask: f64, seq: u64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: seq as i64 * 1_000_000_000,
            sequence: seq,
        }
    }

    #[test]
    fn ingest_feeds_ring_ohlc_and_ledger_mark() {
        let state = state();
        state.ingest_tick(tick(1.10000, 1.10002, 1));
        assert_eq!(state.ticks.count("EURUSD"), 1);
        assert!(state
            .ohlc
            .current_bar("EURUSD", crate::market_data::Timeframe::M1)
            .is_some());

        // A throttled tick changes nothing downstream.
        state.ingest_tick(tick(1.100005, 1.100025, 2));
        assert_eq!(state.ticks.count("EURUSD"), 1);
        let stats = state.ticks.stats();
        assert_eq!(stats.throttled, 1);
    }

    #[test]
    fn status_reports_counters() {
        let state = state();
        state.ingest_tick(tick(1.10000, 1.10002, 1));
        let status = state.status();
        assert_eq!(status.tick_stats.stored, 1);
        assert_eq!(status.account_count, 1);
        assert!(status.symbol_count >= 5);
    }
}
