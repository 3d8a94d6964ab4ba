// =============================================================================
// LP Adapter Layer — uniform capability set over heterogeneous providers
// =============================================================================
//
// Every upstream liquidity provider is wrapped in an adapter that normalizes
// quotes and fills into internal events delivered over one shared channel.
// Adapters implement `run_session` (one connection's lifetime); the manager
// drives the reconnect loop with exponential backoff and keeps the per-LP
// health record the operators see.
// =============================================================================

pub mod fix;
pub mod rest_poll;
pub mod ws_json;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::market_data::Tick;
use crate::types::Side;

/// Reconnect backoff bounds (seconds).
const BACKOFF_INITIAL_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Events and order types
// ---------------------------------------------------------------------------

/// A fill reported by an LP outside the synchronous order path.
#[derive(Debug, Clone, Serialize)]
pub struct LpFill {
    pub lp: String,
    pub client_ref: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Normalized upstream event emitted by every adapter.
#[derive(Debug, Clone)]
pub enum LpEvent {
    Tick(Tick),
    Fill(LpFill),
}

/// Outbound order handed to an adapter.
#[derive(Debug, Clone)]
pub struct LpOrderRequest {
    /// Correlation id, echoed back in the result.
    pub client_ref: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// Advisory price for providers that want one; market execution
    /// otherwise.
    pub price_hint: Option<f64>,
}

/// Terminal outcome of an LP order.
#[derive(Debug, Clone)]
pub enum LpOrderStatus {
    Filled,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct LpOrderResult {
    pub lp_order_id: String,
    pub client_ref: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub status: LpOrderStatus,
}

// ---------------------------------------------------------------------------
// Adapter capability set
// ---------------------------------------------------------------------------

/// The uniform capability set every LP transport satisfies.
#[async_trait]
pub trait LpAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Run one connection's lifetime: connect, resubscribe the current
    /// symbol set, and pump events into `events` until the connection drops.
    /// The manager handles reconnection; returning (Ok or Err) means the
    /// session ended.
    async fn run_session(&self, events: mpsc::Sender<LpEvent>) -> Result<()>;

    async fn disconnect(&self);

    /// Add symbols to the subscription set (applied live when connected,
    /// replayed after every reconnect).
    async fn subscribe(&self, symbols: &[String]) -> Result<()>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()>;

    fn symbols(&self) -> Vec<String>;

    async fn place_order(&self, request: &LpOrderRequest) -> Result<LpOrderResult>;

    /// Best-effort cancel by client ref after a timeout. Providers without a
    /// cancel path accept the default no-op.
    async fn cancel_order(&self, _client_ref: &str) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Operator-visible status of one LP connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LpHealth {
    pub connected: bool,
    pub last_tick_ts: Option<i64>,
    pub error_message: Option<String>,
    pub symbol_count: usize,
}

#[derive(Default)]
pub struct LpHealthRegistry {
    records: RwLock<HashMap<String, LpHealth>>,
}

impl LpHealthRegistry {
    pub fn mark_connected(&self, lp: &str, symbol_count: usize) {
        let mut records = self.records.write();
        let record = records.entry(lp.to_string()).or_default();
        record.connected = true;
        record.error_message = None;
        record.symbol_count = symbol_count;
    }

    pub fn mark_disconnected(&self, lp: &str, error: Option<String>) {
        let mut records = self.records.write();
        let record = records.entry(lp.to_string()).or_default();
        record.connected = false;
        record.error_message = error;
    }

    pub fn record_tick(&self, lp: &str, ts: i64) {
        let mut records = self.records.write();
        let record = records.entry(lp.to_string()).or_default();
        record.last_tick_ts = Some(ts);
    }

    pub fn is_healthy(&self, lp: &str) -> bool {
        self.records
            .read()
            .get(lp)
            .map(|r| r.connected)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<String, LpHealth> {
        self.records.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every adapter and their shared health registry.
pub struct LpManager {
    adapters: RwLock<HashMap<String, Arc<dyn LpAdapter>>>,
    health: Arc<LpHealthRegistry>,
}

impl LpManager {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            health: Arc::new(LpHealthRegistry::default()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn LpAdapter>) {
        info!(lp = adapter.name(), "LP adapter registered");
        self.adapters
            .write()
            .insert(adapter.name().to_string(), adapter);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.adapters.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LpAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    pub fn health(&self) -> Arc<LpHealthRegistry> {
        self.health.clone()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.health.is_healthy(name)
    }

    pub fn health_snapshot(&self) -> HashMap<String, LpHealth> {
        self.health.snapshot()
    }

    /// Place an order with a named LP.
    pub async fn place_order(
        &self,
        lp: &str,
        request: &LpOrderRequest,
    ) -> Result<LpOrderResult> {
        let adapter = self
            .get(lp)
            .ok_or_else(|| anyhow::anyhow!("unknown LP {lp}"))?;
        adapter.place_order(request).await
    }
}

impl Default for LpManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reconnect loop
// ---------------------------------------------------------------------------

/// Drive one adapter's session with exponential backoff (1 s doubling to a
/// 60 s cap, reset on a successful session). Runs until shutdown.
pub async fn run_adapter(
    adapter: Arc<dyn LpAdapter>,
    health: Arc<LpHealthRegistry>,
    events: mpsc::Sender<LpEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = adapter.name().to_string();
    let mut backoff = BACKOFF_INITIAL_SECS;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Adapters flip the health record to connected themselves once the
        // transport is actually up; this loop only records the downs.
        let session = adapter.run_session(events.clone());
        tokio::select! {
            result = session => {
                match result {
                    Ok(()) => {
                        warn!(lp = %name, "LP session ended, reconnecting");
                        health.mark_disconnected(&name, None);
                        backoff = BACKOFF_INITIAL_SECS;
                    }
                    Err(e) => {
                        error!(lp = %name, error = %e, backoff_secs = backoff, "LP session error");
                        health.mark_disconnected(&name, Some(e.to_string()));
                    }
                }
            }
            _ = shutdown.changed() => {
                adapter.disconnect().await;
                health.mark_disconnected(&name, None);
                info!(lp = %name, "LP adapter shut down");
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(backoff)) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_registry_round_trip() {
        let registry = LpHealthRegistry::default();
        assert!(!registry.is_healthy("OANDA"));

        registry.mark_connected("OANDA", 5);
        registry.record_tick("OANDA", 123);
        assert!(registry.is_healthy("OANDA"));

        let snapshot = registry.snapshot();
        let record = snapshot.get("OANDA").unwrap();
        assert_eq!(record.symbol_count, 5);
        assert_eq!(record.last_tick_ts, Some(123));

        registry.mark_disconnected("OANDA", Some("socket closed".into()));
        assert!(!registry.is_healthy("OANDA"));
    }

    #[test]
    fn manager_lookup_unknown_lp_fails() {
        let manager = LpManager::new();
        assert!(manager.get("GHOST").is_none());
        assert!(manager.names().is_empty());
    }
}
