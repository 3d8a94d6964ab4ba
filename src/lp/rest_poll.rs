// =============================================================================
// REST Polling LP Adapter — signed HTTP quote polling and order placement
// =============================================================================
//
// For providers without a streaming feed.  Quotes are polled on an interval
// from `GET /quotes` and orders go out via `POST /orders`; both requests are
// signed with HMAC-SHA256 over the query string, API key in a header.
//
// SECURITY: the secret key is never logged or serialized.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lp::{
    LpAdapter, LpEvent, LpHealthRegistry, LpOrderRequest, LpOrderResult, LpOrderStatus,
};
use crate::market_data::Tick;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_POLL_MS: u64 = 250;

pub struct RestPollAdapter {
    name: String,
    base_url: String,
    api_key: String,
    secret: String,
    poll_interval_ms: u64,
    health: Arc<LpHealthRegistry>,
    symbols: RwLock<HashSet<String>>,
    connected: AtomicBool,
    stopping: AtomicBool,
    sequence: AtomicU64,
    client: reqwest::Client,
}

impl RestPollAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        symbols: &[String],
        health: Arc<LpHealthRegistry>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            poll_interval_ms: DEFAULT_POLL_MS,
            health,
            symbols: RwLock::new(symbols.iter().cloned().collect()),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Quote polling
    // -------------------------------------------------------------------------

    async fn poll_quotes(&self, events: &mpsc::Sender<LpEvent>) -> Result<()> {
        let symbols: Vec<String> = self.symbols.read().iter().cloned().collect();
        if symbols.is_empty() {
            return Ok(());
        }

        let qs = self.signed_query(&format!("symbols={}", symbols.join(",")));
        let url = format!("{}/quotes?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .context("quote poll request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse quote poll response")?;
        if !status.is_success() {
            anyhow::bail!("quote poll returned {status}: {body}");
        }

        let quotes = body
            .as_array()
            .or_else(|| body["quotes"].as_array())
            .context("quote poll response is not an array")?;

        for quote in quotes {
            match self.parse_quote(quote) {
                Ok(tick) => {
                    self.health.record_tick(&self.name, tick.timestamp_ns);
                    if events.try_send(LpEvent::Tick(tick)).is_err() {
                        debug!(lp = %self.name, "ingestion channel full, quote dropped");
                    }
                }
                Err(e) => warn!(lp = %self.name, error = %e, "bad polled quote"),
            }
        }
        Ok(())
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
            .unwrap_or_else(|| Self::timestamp_ms() as i64);

        Ok(Tick {
            symbol,
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: ts_ms * 1_000_000,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[async_trait]
impl LpAdapter for RestPollAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_session(&self, events: mpsc::Sender<LpEvent>) -> Result<()> {
        info!(lp = %self.name, base_url = %self.base_url, "starting REST quote polling");
        self.stopping.store(false, Ordering::Relaxed);

        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
            self.poll_interval_ms.max(50),
        ));

        loop {
            interval.tick().await;
            if self.stopping.load(Ordering::Relaxed) {
                self.connected.store(false, Ordering::Relaxed);
                return Ok(());
            }

            match self.poll_quotes(&events).await {
                Ok(()) => {
                    if !self.connected.swap(true, Ordering::Relaxed) {
                        self.health
                            .mark_connected(&self.name, self.symbols.read().len());
                        info!(lp = %self.name, "REST LP reachable");
                    }
                }
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    async fn disconnect(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        let mut set = self.symbols.write();
        for symbol in symbols {
            set.insert(symbol.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        let mut set = self.symbols.write();
        for symbol in symbols {
            set.remove(symbol);
        }
        Ok(())
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.read().iter().cloned().collect()
    }

    async fn place_order(&self, request: &LpOrderRequest) -> Result<LpOrderResult> {
        let params = format!(
            "ref={}&symbol={}&side={}&volume={}",
            request.client_ref, request.symbol, request.side, request.volume
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/orders?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .context("LP order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse LP order response")?;
        if !status.is_success() {
            anyhow::bail!("LP order returned {status}: {body}");
        }

        let filled = body["status"].as_str() == Some("filled");
        Ok(LpOrderResult {
            lp_order_id: body["order_id"].as_str().unwrap_or_default().to_string(),
            client_ref: request.client_ref.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            volume: body["volume"].as_f64().unwrap_or(request.volume),
            price: body["price"].as_f64().unwrap_or(0.0),
            status: if filled {
                LpOrderStatus::Filled
            } else {
                LpOrderStatus::Rejected(
                    body["reason"].as_str().unwrap_or("LP reject").to_string(),
                )
            },
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RestPollAdapter {
        RestPollAdapter::new(
            "RESTLP",
            "https://example.invalid",
            "key",
            "secret",
            &["EURUSD".to_string()],
            Arc::new(LpHealthRegistry::default()),
        )
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let adapter = adapter();
        let sig1 = adapter.sign("symbols=EURUSD&timestamp=1700000000000");
        let sig2 = adapter.sign("symbols=EURUSD&timestamp=1700000000000");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_appends_timestamp_and_signature() {
        let adapter = adapter();
        let qs = adapter.signed_query("symbols=EURUSD");
        assert!(qs.starts_with("symbols=EURUSD&timestamp="));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn polled_quote_parses() {
        let adapter = adapter();
        let value: serde_json::Value = serde_json::from_str(
            r#"{"symbol":"gbpusd","bid":1.2500,"ask":1.2502,"ts":1700000000000}"#,
        )
        .unwrap();
        let tick = adapter.parse_quote(&value).unwrap();
        assert_eq!(tick.symbol, "GBPUSD");
        assert!((tick.spread - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn subscription_set_is_mutable_offline() {
        let adapter = adapter();
        futures_util::FutureExt::now_or_never(
            adapter.subscribe(&["USDJPY".to_string()]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(adapter.symbols().len(), 2);
    }
}
