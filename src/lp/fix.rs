// =============================================================================
// FIX LP Adapter — FIX 4.4 session over TCP
// =============================================================================
//
// Implements the subset of FIX the engine needs from a quote LP:
//
//   35=A  Logon                      (outbound + inbound confirm)
//   35=0  Heartbeat                  (both directions, 30 s interval)
//   35=1  TestRequest                (answered with a Heartbeat echoing 112)
//   35=V  MarketDataRequest          (subscribe/unsubscribe, top of book)
//   35=W  MarketDataSnapshot         (inbound quotes -> Tick)
//   35=D  NewOrderSingle             (market orders, ClOrdID = client ref)
//   35=8  ExecutionReport            (fill/reject -> pending order waiters)
//   35=5  Logout                     (ends the session)
//
// The codec is tag=value with SOH separators and the standard trailer
// checksum.  Messages are parsed into an ordered field list because market
// data entries repeat tags (269/270 pairs).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lp::{
    LpAdapter, LpEvent, LpFill, LpHealthRegistry, LpOrderRequest, LpOrderResult, LpOrderStatus,
};
use crate::market_data::Tick;
use crate::types::Side;

const SOH: u8 = 0x01;
const BEGIN_STRING: &str = "FIX.4.4";
const HEARTBEAT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// An inbound message as an ordered tag/value list. Repeating-group tags keep
/// their order of appearance.
#[derive(Debug, Clone)]
pub(crate) struct FixMessage {
    fields: Vec<(u32, String)>,
}

impl FixMessage {
    pub(crate) fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn msg_type(&self) -> Option<&str> {
        self.get(35)
    }

    fn iter(&self) -> impl Iterator<Item = &(u32, String)> {
        self.fields.iter()
    }
}

/// Encode one message: body fields (starting at 35) get the standard header
/// and trailer wrapped around them.
pub(crate) fn encode(
    msg_type: &str,
    sender: &str,
    target: &str,
    seq_num: u64,
    body: &[(u32, String)],
) -> Vec<u8> {
    let sending_time = Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string();

    let mut inner = String::new();
    let mut push = |tag: u32, value: &str| {
        inner.push_str(&tag.to_string());
        inner.push('=');
        inner.push_str(value);
        inner.push(SOH as char);
    };
    push(35, msg_type);
    push(49, sender);
    push(56, target);
    push(34, &seq_num.to_string());
    push(52, &sending_time);
    for (tag, value) in body {
        push(*tag, value);
    }

    let mut message = format!(
        "8={BEGIN_STRING}{soh}9={len}{soh}",
        soh = SOH as char,
        len = inner.len()
    );
    message.push_str(&inner);

    let checksum: u32 = message.bytes().map(u32::from).sum::<u32>() % 256;
    message.push_str(&format!("10={checksum:03}{}", SOH as char));
    message.into_bytes()
}

/// Parse one complete raw message (from `8=` through the `10=xxx` trailer).
pub(crate) fn parse(raw: &[u8]) -> Result<FixMessage> {
    let text = std::str::from_utf8(raw).context("FIX message is not UTF-8")?;

    let mut fields = Vec::new();
    for part in text.split(SOH as char).filter(|p| !p.is_empty()) {
        let (tag, value) = part
            .split_once('=')
            .with_context(|| format!("malformed FIX field: {part}"))?;
        let tag: u32 = tag
            .parse()
            .with_context(|| format!("non-numeric FIX tag: {tag}"))?;
        fields.push((tag, value.to_string()));
    }

    // Verify the trailer checksum over everything before the 10= field.
    if let Some((_, declared)) = fields.iter().find(|(t, _)| *t == 10) {
        if let Some(pos) = find_subsequence(raw, b"10=") {
            let computed: u32 = raw[..pos].iter().map(|&b| u32::from(b)).sum::<u32>() % 256;
            let declared: u32 = declared.parse().unwrap_or(u32::MAX);
            if computed != declared {
                anyhow::bail!("FIX checksum mismatch: computed {computed}, declared {declared}");
            }
        }
    }

    Ok(FixMessage { fields })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Extract complete messages out of the read buffer, leaving any partial
/// trailing message in place.
fn drain_messages(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    loop {
        // A complete message ends with "<SOH>10=NNN<SOH>". The SOH prefix
        // keeps field values containing "10=" from splitting a message early.
        let Some(trailer_at) = buffer
            .windows(4)
            .position(|window| window == b"\x0110=")
        else {
            break;
        };
        let end = trailer_at + 4;
        let Some(soh_offset) = buffer[end..].iter().position(|&b| b == SOH) else {
            break;
        };
        let message_end = end + soh_offset + 1;
        let message: Vec<u8> = buffer.drain(..message_end).collect();
        messages.push(message);
    }
    messages
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

enum FixCommand {
    Send(Vec<(u32, String)>, &'static str),
    Close,
}

pub struct FixAdapter {
    name: String,
    endpoint: String,
    sender_comp_id: String,
    target_comp_id: String,
    health: Arc<LpHealthRegistry>,
    symbols: RwLock<HashSet<String>>,
    connected: AtomicBool,
    seq_num: AtomicU64,
    md_req_id: AtomicU64,
    tick_sequence: AtomicU64,
    cmd_tx: RwLock<Option<mpsc::Sender<FixCommand>>>,
    pending_orders: Mutex<HashMap<String, oneshot::Sender<LpOrderResult>>>,
}

impl FixAdapter {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        sender_comp_id: impl Into<String>,
        target_comp_id: impl Into<String>,
        symbols: &[String],
        health: Arc<LpHealthRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
            health,
            symbols: RwLock::new(symbols.iter().cloned().collect()),
            connected: AtomicBool::new(false),
            seq_num: AtomicU64::new(0),
            md_req_id: AtomicU64::new(0),
            tick_sequence: AtomicU64::new(0),
            cmd_tx: RwLock::new(None),
            pending_orders: Mutex::new(HashMap::new()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq_num.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn queue(&self, msg_type: &'static str, body: Vec<(u32, String)>) -> Result<()> {
        let tx = self
            .cmd_tx
            .read()
            .clone()
            .context("FIX session not connected")?;
        tx.send(FixCommand::Send(body, msg_type))
            .await
            .map_err(|_| anyhow::anyhow!("FIX session gone"))?;
        Ok(())
    }

    fn market_data_request(&self, symbols: &[String], subscribe: bool) -> Vec<(u32, String)> {
        let req_id = self.md_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut body = vec![
            (262, format!("md-{req_id}")),
            (263, if subscribe { "1" } else { "2" }.to_string()),
            (264, "1".to_string()),
            (267, "2".to_string()),
            (269, "0".to_string()),
            (269, "1".to_string()),
            (146, symbols.len().to_string()),
        ];
        for symbol in symbols {
            body.push((55, symbol.clone()));
        }
        body
    }

    /// Turn a MarketDataSnapshot (35=W) into a Tick. Entries arrive as
    /// repeating (269, 270) pairs: 269=0 bid, 269=1 offer.
    fn parse_snapshot(&self, message: &FixMessage) -> Result<Tick> {
        let symbol = message
            .get(55)
            .context("snapshot missing symbol (55)")?
            .to_uppercase();

        let mut bid: Option<f64> = None;
        let mut ask: Option<f64> = None;
        let mut current_entry: Option<char> = None;
        for (tag, value) in message.iter() {
            match tag {
                269 => current_entry = value.chars().next(),
                270 => {
                    let price: f64 = value
                        .parse()
                        .with_context(|| format!("bad FIX price: {value}"))?;
                    match current_entry {
                        Some('0') => bid = Some(price),
                        Some('1') => ask = Some(price),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let bid = bid.context("snapshot missing bid entry")?;
        let ask = ask.context("snapshot missing offer entry")?;
        Ok(Tick {
            symbol,
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            sequence: self.tick_sequence.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn handle_execution_report(&self, message: &FixMessage, events: &mpsc::Sender<LpEvent>) {
        let Some(client_ref) = message.get(11) else {
            warn!(lp = %self.name, "execution report without ClOrdID");
            return;
        };
        let Some(waiter) = self.pending_orders.lock().remove(client_ref) else {
            debug!(lp = %self.name, client_ref, "execution report with no waiter");
            return;
        };

        let symbol = message.get(55).unwrap_or_default().to_uppercase();
        let side = match message.get(54) {
            Some("2") => Side::Sell,
            _ => Side::Buy,
        };
        let volume: f64 = message
            .get(32)
            .or_else(|| message.get(38))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let price: f64 = message
            .get(31)
            .or_else(|| message.get(44))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let exec_type = message.get(150).unwrap_or("");
        let filled = matches!(exec_type, "F" | "2");

        let result = LpOrderResult {
            lp_order_id: message.get(37).unwrap_or_default().to_string(),
            client_ref: client_ref.to_string(),
            symbol: symbol.clone(),
            side,
            volume,
            price,
            status: if filled {
                LpOrderStatus::Filled
            } else {
                LpOrderStatus::Rejected(
                    message.get(58).unwrap_or("LP reject").to_string(),
                )
            },
        };

        if filled {
            let _ = events.try_send(LpEvent::Fill(LpFill {
                lp: self.name.clone(),
                client_ref: client_ref.to_string(),
                symbol,
                side,
                volume,
                price,
                at: Utc::now(),
            }));
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
impl LpAdapter for FixAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_session(&self, events: mpsc::Sender<LpEvent>) -> Result<()> {
        info!(lp = %self.name, endpoint = %self.endpoint, "connecting FIX session");
        let mut stream = TcpStream::connect(&self.endpoint)
            .await
            .context("FIX TCP connect failed")?;

        self.seq_num.store(0, Ordering::Relaxed);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<FixCommand>(64);
        *self.cmd_tx.write() = Some(cmd_tx);

        // Logon with a 30 s heartbeat interval.
        let logon = encode(
            "A",
            &self.sender_comp_id,
            &self.target_comp_id,
            self.next_seq(),
            &[(98, "0".to_string()), (108, HEARTBEAT_SECS.to_string())],
        );
        stream.write_all(&logon).await.context("FIX logon failed")?;

        let mut buffer: Vec<u8> = Vec::with_capacity(8 * 1024);
        let mut read_chunk = [0u8; 4096];
        let mut heartbeat =
            tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_SECS));
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(FixCommand::Send(body, msg_type)) => {
                            let raw = encode(
                                msg_type,
                                &self.sender_comp_id,
                                &self.target_comp_id,
                                self.next_seq(),
                                &body,
                            );
                            if let Err(e) = stream.write_all(&raw).await {
                                break Err(anyhow::Error::from(e).context("FIX write failed"));
                            }
                        }
                        Some(FixCommand::Close) | None => {
                            let logout = encode(
                                "5",
                                &self.sender_comp_id,
                                &self.target_comp_id,
                                self.next_seq(),
                                &[],
                            );
                            let _ = stream.write_all(&logout).await;
                            break Ok(());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let hb = encode(
                        "0",
                        &self.sender_comp_id,
                        &self.target_comp_id,
                        self.next_seq(),
                        &[],
                    );
                    if let Err(e) = stream.write_all(&hb).await {
                        break Err(anyhow::Error::from(e).context("FIX heartbeat failed"));
                    }
                }
                read = stream.read(&mut read_chunk) => {
                    match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => {
                            buffer.extend_from_slice(&read_chunk[..n]);

                            // Replies the inbound messages ask for; written
                            // after the drain so session-ending messages can
                            // break out of the select arm cleanly.
                            let mut replies: Vec<Vec<u8>> = Vec::new();
                            let mut session_over = false;

                            for raw in drain_messages(&mut buffer) {
                                let message = match parse(&raw) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        warn!(lp = %self.name, error = %e, "bad FIX message");
                                        continue;
                                    }
                                };
                                match message.msg_type() {
                                    Some("A") => {
                                        self.connected.store(true, Ordering::Relaxed);
                                        self.health.mark_connected(
                                            &self.name,
                                            self.symbols.read().len(),
                                        );
                                        info!(lp = %self.name, "FIX logon confirmed");
                                        let current: Vec<String> =
                                            self.symbols.read().iter().cloned().collect();
                                        if !current.is_empty() {
                                            let body =
                                                self.market_data_request(&current, true);
                                            replies.push(encode(
                                                "V",
                                                &self.sender_comp_id,
                                                &self.target_comp_id,
                                                self.next_seq(),
                                                &body,
                                            ));
                                        }
                                    }
                                    Some("1") => {
                                        // TestRequest: echo 112 in a heartbeat.
                                        let mut body = Vec::new();
                                        if let Some(id) = message.get(112) {
                                            body.push((112, id.to_string()));
                                        }
                                        replies.push(encode(
                                            "0",
                                            &self.sender_comp_id,
                                            &self.target_comp_id,
                                            self.next_seq(),
                                            &body,
                                        ));
                                    }
                                    Some("W") => match self.parse_snapshot(&message) {
                                        Ok(tick) => {
                                            self.health
                                                .record_tick(&self.name, tick.timestamp_ns);
                                            if events.try_send(LpEvent::Tick(tick)).is_err() {
                                                debug!(lp = %self.name, "ingestion channel full, quote dropped");
                                            }
                                        }
                                        Err(e) => {
                                            warn!(lp = %self.name, error = %e, "bad market data snapshot")
                                        }
                                    },
                                    Some("8") => self.handle_execution_report(&message, &events),
                                    Some("5") => {
                                        session_over = true;
                                    }
                                    Some("0") => {}
                                    other => {
                                        debug!(lp = %self.name, msg_type = ?other, "ignored FIX message")
                                    }
                                }
                            }

                            let mut write_error = None;
                            for raw in replies {
                                if let Err(e) = stream.write_all(&raw).await {
                                    write_error = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = write_error {
                                break Err(anyhow::Error::from(e).context("FIX write failed"));
                            }
                            if session_over {
                                break Ok(());
                            }
                        }
                        Err(e) => break Err(anyhow::Error::from(e).context("FIX read error")),
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
        let tx = self.cmd_tx.read().clone();
        if let Some(tx) = tx {
            let _ = tx.send(FixCommand::Close).await;
        }
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
            let body = self.market_data_request(symbols, true);
            self.queue("V", body).await?;
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
            let body = self.market_data_request(symbols, false);
            self.queue("V", body).await?;
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

        let body = vec![
            (11, request.client_ref.clone()),
            (55, request.symbol.clone()),
            (
                54,
                match request.side {
                    Side::Buy => "1",
                    Side::Sell => "2",
                }
                .to_string(),
            ),
            (38, format!("{}", request.volume)),
            (40, "1".to_string()),
            (60, Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()),
        ];

        if let Err(e) = self.queue("D", body).await {
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> FixAdapter {
        FixAdapter::new(
            "FIXLP",
            "127.0.0.1:9878",
            "MERIDIAN",
            "FIXLP",
            &["EURUSD".to_string()],
            Arc::new(LpHealthRegistry::default()),
        )
    }

    #[test]
    fn encode_parse_round_trip_with_valid_checksum() {
        let raw = encode(
            "A",
            "MERIDIAN",
            "FIXLP",
            1,
            &[(98, "0".to_string()), (108, "30".to_string())],
        );
        let message = parse(&raw).unwrap();
        assert_eq!(message.msg_type(), Some("A"));
        assert_eq!(message.get(49), Some("MERIDIAN"));
        assert_eq!(message.get(108), Some("30"));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut raw = encode("0", "MERIDIAN", "FIXLP", 2, &[]);
        // Flip a byte inside the body.
        let idx = raw.len() / 2;
        raw[idx] = raw[idx].wrapping_add(1);
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn drain_extracts_complete_messages_and_keeps_partials() {
        let one = encode("0", "A", "B", 1, &[]);
        let two = encode("0", "A", "B", 2, &[]);
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&one);
        buffer.extend_from_slice(&two);
        // A partial third message.
        buffer.extend_from_slice(b"8=FIX.4.4\x019=12\x0135=0");

        let messages = drain_messages(&mut buffer);
        assert_eq!(messages.len(), 2);
        assert!(buffer.starts_with(b"8=FIX.4.4"));
    }

    #[test]
    fn market_data_snapshot_parses_bid_and_offer() {
        let adapter = adapter();
        let raw = encode(
            "W",
            "FIXLP",
            "MERIDIAN",
            7,
            &[
                (55, "EURUSD".to_string()),
                (268, "2".to_string()),
                (269, "0".to_string()),
                (270, "1.10000".to_string()),
                (269, "1".to_string()),
                (270, "1.10002".to_string()),
            ],
        );
        let message = parse(&raw).unwrap();
        let tick = adapter.parse_snapshot(&message).unwrap();
        assert_eq!(tick.symbol, "EURUSD");
        assert_eq!(tick.bid, 1.10000);
        assert_eq!(tick.ask, 1.10002);
    }

    #[tokio::test]
    async fn execution_report_fill_resolves_waiter() {
        let adapter = adapter();
        let (tx, rx) = oneshot::channel();
        adapter.pending_orders.lock().insert("ord-1".into(), tx);

        let raw = encode(
            "8",
            "FIXLP",
            "MERIDIAN",
            9,
            &[
                (37, "LP-77".to_string()),
                (11, "ord-1".to_string()),
                (150, "F".to_string()),
                (55, "EURUSD".to_string()),
                (54, "1".to_string()),
                (32, "1".to_string()),
                (31, "1.10002".to_string()),
            ],
        );
        let message = parse(&raw).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        adapter.handle_execution_report(&message, &events_tx);

        let result = rx.await.unwrap();
        assert!(matches!(result.status, LpOrderStatus::Filled));
        assert_eq!(result.lp_order_id, "LP-77");
        assert_eq!(result.price, 1.10002);
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            LpEvent::Fill(_)
        ));
    }

    #[test]
    fn execution_report_reject_carries_reason() {
        let adapter = adapter();
        let (tx, mut rx) = oneshot::channel();
        adapter.pending_orders.lock().insert("ord-2".into(), tx);

        let raw = encode(
            "8",
            "FIXLP",
            "MERIDIAN",
            10,
            &[
                (11, "ord-2".to_string()),
                (150, "8".to_string()),
                (58, "insufficient liquidity".to_string()),
            ],
        );
        let message = parse(&raw).unwrap();
        let (events_tx, _events_rx) = mpsc::channel(4);
        adapter.handle_execution_report(&message, &events_tx);

        match rx.try_recv().unwrap().status {
            LpOrderStatus::Rejected(reason) => {
                assert_eq!(reason, "insufficient liquidity")
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
