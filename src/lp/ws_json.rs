// =============================================================================
// WebSocket JSON LP Adapter — exchange-style quote and order stream
// =============================================================================
//
// Speaks a line-of-JSON protocol over a single WebSocket:
//
//   -> {"op":"subscribe","symbols":["EURUSD"]}
//   -> {"op":"unsubscribe","symbols":["EURUSD"]}
//   -> {"op":"order","ref":"...","symbol":"EURUSD","side":"BUY","volume":1.0}
//   <- {"type":"quote","symbol":"EURUSD","bid":1.1,"ask":1.10002,"ts":...}
//   <- {"type":"order_result","ref":"...","order_id":"...","status":"filled",
//       "price":1.10002}
//
// Order results resolve pending oneshot waiters keyed by the client ref; the
// dispatcher applies its own deadline on top.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::lp::{
    LpAdapter, LpEvent, LpFill, LpHealthRegistry, LpOrderRequest, LpOrderResult, LpOrderStatus,
};
use crate::market_data::Tick;
use crate::types::Side;

enum WsCommand {
    Send(String),
    Close,
}

pub struct WsJsonAdapter {
    name: String,
    url: String,
    health: Arc<LpHealthRegistry>,
    symbols: RwLock<HashSet<String>>,
    connected: AtomicBool,
    sequence: AtomicU64,
    cmd_tx: RwLock<Option<mpsc::Sender<WsCommand>>>,
    pending_orders: Mutex<HashMap<String, oneshot::Sender<LpOrderResult>>>,
}

impl WsJsonAdapter {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        symbols: &[String],
        health: Arc<LpHealthRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health,
            symbols: RwLock::new(symbols.iter().cloned().collect()),
            connected: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            cmd_tx: RwLock::new(None),
            pending_orders: Mutex::new(HashMap::new()),
        }
    }

    async fn send_command(&self, command: WsCommand) -> Result<()> {
        let tx = self
            .cmd_tx
            .read()
            .clone()
            .context("LP WebSocket not connected")?;
        tx.send(command)
            .await
            .map_err(|_| anyhow::anyhow!("LP WebSocket session gone"))?;
        Ok(())
    }

    fn subscribe_payload(symbols: &[String]) -> String {
        serde_json::json!({ "op": "subscribe", "symbols": symbols }).to_string()
    }

    /// Decode one inbound frame into an event or an order resolution.
    fn handle_text(&self, text: &str, events: &mpsc::Sender<LpEvent>) {
        let parsed = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(lp = %self.name, error = %e, "unparseable LP frame");
                return;
            }
        };

        match parsed["type"].as_str() {
            Some("quote") => match self.parse_quote(&parsed) {
                Ok(tick) => {
                    self.health.record_tick(&self.name, tick.timestamp_ns);
                    if events.try_send(LpEvent::Tick(tick)).is_err() {
                        debug!(lp = %self.name, "ingestion channel full, quote dropped");
                    }
                }
                Err(e) => warn!(lp = %self.name, error = %e, "bad quote frame"),
            },
            Some("order_result") => self.resolve_order(&parsed, events),
            other => debug!(lp = %self.name, kind = ?other, "ignored LP frame"),
        }
    }

    fn parse_quote(&self, value: &serde_json::Value) -> Result<Tick> {
        let symbol = value["symbol"]
            .as_str()
            .context("missing field symbol")?
            .to_uppercase();
        let bid = value["bid"].as_f64().context("missing field bid")?;
        let ask = value["ask"].as_f64().context("missing field ask")?;
        let ts_ms = value["ts"]
            .as_i64()
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        Ok(Tick {
            symbol,
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: ts_ms * 1_000_000,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn resolve_order(&self, value: &serde_json::Value, events: &mpsc::Sender<LpEvent>) {
        let Some(client_ref) = value["ref"].as_str() else {
            warn!(lp = %self.name, "order_result without ref");
            return;
        };
        let waiter = self.pending_orders.lock().remove(client_ref);
        let Some(waiter) = waiter else {
            debug!(lp = %self.name, client_ref, "order_result with no waiter");
            return;
        };

        let symbol = value["symbol"].as_str().unwrap_or_default().to_uppercase();
        let side = value["side"]
            .as_str()
            .and_then(|s| s.parse::<Side>().ok())
            .unwrap_or(Side::Buy);
        let volume = value["volume"].as_f64().unwrap_or(0.0);
        let price = value["price"].as_f64().unwrap_or(0.0);
        let filled = value["status"].as_str() == Some("filled");

        let result = LpOrderResult {
            lp_order_id: value["order_id"].as_str().unwrap_or_default().to_string(),
            client_ref: client_ref.to_string(),
            symbol: symbol.clone(),
            side,
            volume,
            price,
            status: if filled {
                LpOrderStatus::Filled
            } else {
                LpOrderStatus::Rejected(
                    value["reason"].as_str().unwrap_or("LP reject").to_string(),
                )
            },
        };

        if filled {
            let fill = LpFill {
                lp: self.name.clone(),
                client_ref: client_ref.to_string(),
                symbol,
                side,
                volume,
                price,
                at: Utc::now(),
            };
            let _ = events.try_send(LpEvent::Fill(fill));
        }
        let _ = waiter.send(result);
    }

    fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending_orders.lock();
        for (client_ref, waiter) in pending.drain() {
            let _ = waiter.send(LpOrderResult {
                lp_order_id: String::new(),
                client_ref,
                symbol: String::new(),
                side: Side::Buy,
                volume: 0.0,
                price: 0.0,
                status: LpOrderStatus::Rejected(reason.to_string()),
            });
        }
    }
}

#[async_trait]
impl LpAdapter for WsJsonAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_session(&self, events: mpsc::Sender<LpEvent>) -> Result<()> {
        info!(lp = %self.name, url = %self.url, "connecting LP WebSocket");
        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect LP WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(64);
        *self.cmd_tx.write() = Some(cmd_tx);
        self.connected.store(true, Ordering::Relaxed);
        self.health
            .mark_connected(&self.name, self.symbols.read().len());
        info!(lp = %self.name, "LP WebSocket connected");

        // Resubscribe the current set on every (re)connect.
        let current: Vec<String> = self.symbols.read().iter().cloned().collect();
        if !current.is_empty() {
            write
                .send(Message::Text(Self::subscribe_payload(&current)))
                .await
                .context("failed to send LP subscribe")?;
        }

        let result = loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(WsCommand::Send(payload)) => {
                            if let Err(e) = write.send(Message::Text(payload)).await {
                                break Err(anyhow::Error::from(e)
                                    .context("LP WebSocket write failed"));
                            }
                        }
                        Some(WsCommand::Close) | None => break Ok(()),
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, &events),
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                break Ok(());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(anyhow::Error::from(e)
                                .context("LP WebSocket read error"));
                        }
                    }
                }
            }
        };

        self.connected.store(false, Ordering::Relaxed);
        *self.cmd_tx.write() = None;
        self.fail_pending("LP connection lost");
        result
    }

    async fn disconnect(&self) {
        let _ = self.send_command(WsCommand::Close).await;
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        {
            let mut set = self.symbols.write();
            for symbol in symbols {
                set.insert(symbol.clone());
            }
        }
        if self.is_connected() {
            self.send_command(WsCommand::Send(Self::subscribe_payload(symbols)))
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        {
            let mut set = self.symbols.write();
            for symbol in symbols {
                set.remove(symbol);
            }
        }
        if self.is_connected() {
            let payload =
                serde_json::json!({ "op": "unsubscribe", "symbols": symbols }).to_string();
            self.send_command(WsCommand::Send(payload)).await?;
        }
        Ok(())
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }

    async fn place_order(&self, request: &LpOrderRequest) -> Result<LpOrderResult> {
        if !self.is_connected() {
            anyhow::bail!("LP {} is not connected", self.name);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_orders
            .lock()
            .insert(request.client_ref.clone(), tx);

        let payload = serde_json::json!({
            "op": "order",
            "ref": request.client_ref,
            "symbol": request.symbol,
            "side": request.side,
            "volume": request.volume,
            "price": request.price_hint,
        })
        .to_string();

        if let Err(e) = self.send_command(WsCommand::Send(payload)).await {
            self.pending_orders.lock().remove(&request.client_ref);
            return Err(e);
        }

        rx.await
            .map_err(|_| anyhow::anyhow!("LP order waiter dropped"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WsJsonAdapter {
        WsJsonAdapter::new(
            "TESTLP",
            "wss://example.invalid/ws",
            &["EURUSD".to_string()],
            Arc::new(LpHealthRegistry::default()),
        )
    }

    #[test]
    fn quote_frames_parse_into_ticks() {
        let adapter = adapter();
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"quote","symbol":"eurusd","bid":1.10000,"ask":1.10002,"ts":1700000000000}"#,
        )
        .unwrap();

        let tick = adapter.parse_quote(&value).unwrap();
        assert_eq!(tick.symbol, "EURUSD");
        assert!((tick.spread - 0.00002).abs() < 1e-12);
        assert_eq!(tick.timestamp_ns, 1_700_000_000_000_000_000);
    }

    #[test]
    fn quote_missing_bid_is_an_error() {
        let adapter = adapter();
        let value: serde_json::Value =
            serde_json::from_str(r#"{"type":"quote","symbol":"EURUSD","ask":1.1}"#).unwrap();
        assert!(adapter.parse_quote(&value).is_err());
    }

    #[tokio::test]
    async fn order_result_resolves_pending_waiter() {
        let adapter = adapter();
        let (tx, rx) = oneshot::channel();
        adapter.pending_orders.lock().insert("ref-1".into(), tx);

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"order_result","ref":"ref-1","order_id":"X7","status":"filled",
                "symbol":"EURUSD","side":"BUY","volume":1.0,"price":1.10002}"#,
        )
        .unwrap();
        adapter.resolve_order(&value, &events_tx);

        let result = rx.await.unwrap();
        assert!(matches!(result.status, LpOrderStatus::Filled));
        assert_eq!(result.price, 1.10002);

        // A fill event is emitted alongside the synchronous result.
        match events_rx.try_recv().unwrap() {
            LpEvent::Fill(fill) => assert_eq!(fill.client_ref, "ref-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn lost_connection_rejects_pending_orders() {
        let adapter = adapter();
        let (tx, mut rx) = oneshot::channel();
        adapter.pending_orders.lock().insert("ref-2".into(), tx);

        adapter.fail_pending("LP connection lost");
        let result = rx.try_recv().unwrap();
        assert!(matches!(result.status, LpOrderStatus::Rejected(_)));
    }
}
