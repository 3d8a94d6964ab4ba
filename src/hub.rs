// =============================================================================
// Quote Multiplexer — per-symbol subscriber sets, delta diffing, batching
// =============================================================================
//
// The hub owns the subscription tables and the per-connection outbound
// queues.  `publish_tick` runs on the ingestion path: it takes the symbol's
// subscriber set under a read lock, diffs the tick against each subscriber's
// last-sent snapshot, and appends a delta to that subscriber's batch.  A
// flusher task drains batches every frame (16 ms) or as soon as a batch hits
// the configured size.
//
// Backpressure is per-subscriber: a bounded outbound queue drops its oldest
// entry when full, and sustained dropping (N consecutive flush cycles) marks
// the connection for closure as a slow consumer.  The ingestion path never
// blocks on a slow socket.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::market_data::{Tick, TickStore};

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Full price record, sent on initial subscription.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteSnapshot<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: &'a str,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub ts: i64,
}

/// Only the fields that changed vs the subscriber's last-sent snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteDelta {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    pub ts: i64,
}

#[derive(Debug, Serialize)]
struct DeltaBatch<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    deltas: &'a [QuoteDelta],
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

struct SubscriberState {
    symbols: HashSet<String>,
    last_sent: HashMap<String, Tick>,
    batch: Vec<QuoteDelta>,
}

/// Per-connection record owned by the hub, shared with the connection's
/// outbound pump.
pub struct Subscriber {
    pub conn_id: u64,
    pub account_id: u64,
    state: Mutex<SubscriberState>,
    outbound: Mutex<VecDeque<String>>,
    notify: Notify,
    queue_capacity: usize,
    dropped_batches: AtomicU64,
    dropped_this_cycle: AtomicBool,
    consecutive_drop_cycles: AtomicU32,
    closed: AtomicBool,
}

impl Subscriber {
    fn new(conn_id: u64, account_id: u64, queue_capacity: usize) -> Self {
        Self {
            conn_id,
            account_id,
            state: Mutex::new(SubscriberState {
                symbols: HashSet::new(),
                last_sent: HashMap::new(),
                batch: Vec::new(),
            }),
            outbound: Mutex::new(VecDeque::with_capacity(queue_capacity)),
            notify: Notify::new(),
            queue_capacity,
            dropped_batches: AtomicU64::new(0),
            dropped_this_cycle: AtomicBool::new(false),
            consecutive_drop_cycles: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an outbound message, evicting the oldest when full.
    fn enqueue(&self, message: String) {
        {
            let mut outbound = self.outbound.lock();
            if outbound.len() >= self.queue_capacity {
                outbound.pop_front();
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.dropped_this_cycle.store(true, Ordering::Relaxed);
            }
            outbound.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Queue a message addressed to this connection alone (error replies,
    /// direct acknowledgements).
    pub fn enqueue_direct(&self, message: String) {
        self.enqueue(message);
    }

    /// Await the next outbound message. Returns `None` once the hub has
    /// marked the connection closed and the queue is drained.
    pub async fn next_message(&self) -> Option<String> {
        loop {
            {
                let mut outbound = self.outbound.lock();
                if let Some(message) = outbound.pop_front() {
                    return Some(message);
                }
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct QuoteHub {
    subscribers_by_symbol: RwLock<HashMap<String, HashSet<u64>>>,
    connections: RwLock<HashMap<u64, Arc<Subscriber>>>,
    batch_size: usize,
    queue_capacity: usize,
    slow_consumer_cycles: u32,
    next_conn_id: AtomicU64,
}

impl QuoteHub {
    pub fn new(batch_size: usize, queue_capacity: usize, slow_consumer_cycles: u32) -> Self {
        Self {
            subscribers_by_symbol: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            batch_size,
            queue_capacity,
            slow_consumer_cycles,
            next_conn_id: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    pub fn register(&self, account_id: u64) -> Arc<Subscriber> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber::new(conn_id, account_id, self.queue_capacity));
        self.connections.write().insert(conn_id, subscriber.clone());
        info!(conn_id, account_id, "hub connection registered");
        subscriber
    }

    pub fn unregister(&self, conn_id: u64) {
        let removed = self.connections.write().remove(&conn_id);
        if let Some(subscriber) = removed {
            subscriber.closed.store(true, Ordering::Relaxed);
            subscriber.notify.notify_one();
            let mut by_symbol = self.subscribers_by_symbol.write();
            for symbol in subscriber.state.lock().symbols.iter() {
                if let Some(set) = by_symbol.get_mut(symbol) {
                    set.remove(&conn_id);
                    if set.is_empty() {
                        by_symbol.remove(symbol);
                    }
                }
            }
            info!(conn_id, "hub connection unregistered");
        }
    }

    pub fn connection(&self, conn_id: u64) -> Option<Arc<Subscriber>> {
        self.connections.read().get(&conn_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Add symbols to a connection and send an initial full snapshot for each
    /// from the most recent stored tick.
    pub fn subscribe(&self, conn_id: u64, symbols: &[String], ticks: &TickStore) {
        let Some(subscriber) = self.connection(conn_id) else {
            return;
        };

        {
            let mut by_symbol = self.subscribers_by_symbol.write();
            for symbol in symbols {
                by_symbol
                    .entry(symbol.clone())
                    .or_default()
                    .insert(conn_id);
            }
        }

        let mut state = subscriber.state.lock();
        for symbol in symbols {
            state.symbols.insert(symbol.clone());
            if let Some(tick) = ticks.latest(symbol) {
                let snapshot = QuoteSnapshot {
                    kind: "snapshot",
                    symbol,
                    bid: tick.bid,
                    ask: tick.ask,
                    spread: tick.spread,
                    ts: tick.timestamp_ns,
                };
                if let Ok(json) = serde_json::to_string(&snapshot) {
                    subscriber.enqueue(json);
                }
                state.last_sent.insert(symbol.clone(), tick);
            }
        }
        debug!(conn_id, count = symbols.len(), "symbols subscribed");
    }

    /// Remove symbols from a connection and purge its last-sent entries.
    pub fn unsubscribe(&self, conn_id: u64, symbols: &[String]) {
        let Some(subscriber) = self.connection(conn_id) else {
            return;
        };

        {
            let mut by_symbol = self.subscribers_by_symbol.write();
            for symbol in symbols {
                if let Some(set) = by_symbol.get_mut(symbol) {
                    set.remove(&conn_id);
                    if set.is_empty() {
                        by_symbol.remove(symbol);
                    }
                }
            }
        }

        let mut state = subscriber.state.lock();
        for symbol in symbols {
            state.symbols.remove(symbol);
            state.last_sent.remove(symbol);
            state.batch.retain(|d| &d.symbol != symbol);
        }
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Fan a stored tick out to the symbol's subscribers as deltas.
    pub fn publish_tick(&self, tick: &Tick) {
        let conn_ids: Vec<u64> = {
            let by_symbol = self.subscribers_by_symbol.read();
            match by_symbol.get(&tick.symbol) {
                Some(set) if !set.is_empty() => set.iter().copied().collect(),
                _ => return,
            }
        };

        for conn_id in conn_ids {
            let Some(subscriber) = self.connection(conn_id) else {
                continue;
            };
            let mut state = subscriber.state.lock();

            let delta = match state.last_sent.get(&tick.symbol) {
                Some(last) => {
                    let bid = (tick.bid != last.bid).then_some(tick.bid);
                    let ask = (tick.ask != last.ask).then_some(tick.ask);
                    let spread = (tick.spread != last.spread).then_some(tick.spread);
                    if bid.is_none() && ask.is_none() && spread.is_none() {
                        // Nothing moved meaningfully for this subscriber.
                        continue;
                    }
                    QuoteDelta {
                        symbol: tick.symbol.clone(),
                        bid,
                        ask,
                        spread,
                        ts: tick.timestamp_ns,
                    }
                }
                None => QuoteDelta {
                    symbol: tick.symbol.clone(),
                    bid: Some(tick.bid),
                    ask: Some(tick.ask),
                    spread: Some(tick.spread),
                    ts: tick.timestamp_ns,
                },
            };

            state.batch.push(delta);
            state.last_sent.insert(tick.symbol.clone(), tick.clone());
            let full = state.batch.len() >= self.batch_size;
            drop(state);

            if full {
                self.flush_subscriber(&subscriber);
            }
        }
    }

    /// Send an execution/account event to every connection bound to the
    /// account.
    pub fn publish_execution(&self, account_id: u64, event: &impl Serialize) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialise execution event");
                return;
            }
        };
        let connections: Vec<Arc<Subscriber>> =
            self.connections.read().values().cloned().collect();
        for subscriber in connections {
            if subscriber.account_id == account_id {
                subscriber.enqueue(json.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flushing
    // -------------------------------------------------------------------------

    fn flush_subscriber(&self, subscriber: &Subscriber) {
        let batch: Vec<QuoteDelta> = {
            let mut state = subscriber.state.lock();
            if state.batch.is_empty() {
                return;
            }
            std::mem::take(&mut state.batch)
        };
        let message = DeltaBatch {
            kind: "batch",
            deltas: &batch,
        };
        if let Ok(json) = serde_json::to_string(&message) {
            subscriber.enqueue(json);
        }
    }

    /// One flush cycle over every connection. Called by the flusher task at
    /// the frame interval; also applies the slow-consumer policy.
    pub fn flush_all(&self) -> Vec<u64> {
        let connections: Vec<Arc<Subscriber>> =
            self.connections.read().values().cloned().collect();

        let mut to_close = Vec::new();
        for subscriber in connections {
            self.flush_subscriber(&subscriber);

            let dropped = subscriber.dropped_this_cycle.swap(false, Ordering::Relaxed);
            let cycles = if dropped {
                subscriber
                    .consecutive_drop_cycles
                    .fetch_add(1, Ordering::Relaxed)
                    + 1
            } else {
                subscriber.consecutive_drop_cycles.store(0, Ordering::Relaxed);
                0
            };

            if cycles >= self.slow_consumer_cycles && !subscriber.is_closed() {
                warn!(
                    conn_id = subscriber.conn_id,
                    dropped_batches = subscriber.dropped_batches(),
                    "slow consumer, closing connection"
                );
                subscriber.closed.store(true, Ordering::Relaxed);
                subscriber.notify.notify_one();
                to_close.push(subscriber.conn_id);
            }
        }
        to_close
    }

    /// Subscriber count for a symbol (used by tests and the state snapshot).
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers_by_symbol
            .read()
            .get(symbol)
            .map_or(0, HashSet::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, bid: f64, ask: f64, ts: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: ts,
            sequence: ts as u64,
        }
    }

    fn hub() -> QuoteHub {
        QuoteHub::new(50, 256, 10)
    }

    #[tokio::test]
    async fn subscriber_receives_snapshot_then_delta() {
        let hub = hub();
        let ticks = TickStore::new(100, 1e-5);

        // Tick arrives before the subscriber connects.
        let t0 = tick("EURUSD", 1.10000, 1.10002, 1);
        assert!(ticks.store(t0.clone()));

        let subscriber = hub.register(1);
        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);

        let snapshot = subscriber.next_message().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["bid"], 1.10000);
        assert_eq!(value["ask"], 1.10002);

        // Next tick moves only the ask.
        let t1 = tick("EURUSD", 1.10000, 1.10003, 2);
        assert!(ticks.store(t1.clone()));
        hub.publish_tick(&t1);
        hub.flush_all();

        let batch = subscriber.next_message().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&batch).unwrap();
        assert_eq!(value["type"], "batch");
        let delta = &value["deltas"][0];
        assert_eq!(delta["ask"], 1.10003);
        assert!(delta.get("bid").is_none());
    }

    #[tokio::test]
    async fn no_delta_for_unsubscribed_symbol() {
        let hub = hub();
        let ticks = TickStore::new(100, 1e-5);
        let subscriber = hub.register(1);
        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);

        let other = tick("GBPUSD", 1.25, 1.2502, 1);
        hub.publish_tick(&other);
        hub.flush_all();

        assert!(subscriber.outbound.lock().is_empty());
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_prior_state() {
        let hub = hub();
        let ticks = TickStore::new(100, 1e-5);
        let subscriber = hub.register(1);

        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);
        assert_eq!(hub.subscriber_count("EURUSD"), 1);

        hub.unsubscribe(subscriber.conn_id, &["EURUSD".to_string()]);
        assert_eq!(hub.subscriber_count("EURUSD"), 0);
        assert!(subscriber.state.lock().last_sent.is_empty());
    }

    #[test]
    fn batch_flushes_at_size_threshold() {
        let hub = QuoteHub::new(3, 256, 10);
        let ticks = TickStore::new(100, 1e-5);
        let subscriber = hub.register(1);
        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);

        for i in 0..3 {
            hub.publish_tick(&tick("EURUSD", 1.10 + i as f64 * 0.001, 1.1002, i));
        }
        // Three deltas hit the batch size: flushed without waiting for the
        // frame timer.
        assert_eq!(subscriber.outbound.lock().len(), 1);
    }

    #[test]
    fn backpressure_drops_oldest_and_counts() {
        let hub = QuoteHub::new(1, 2, 10);
        let ticks = TickStore::new(100, 1e-5);
        let subscriber = hub.register(1);
        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);

        // Batch size 1: every tick flushes immediately into a queue of 2.
        for i in 0..5 {
            hub.publish_tick(&tick("EURUSD", 1.10 + i as f64 * 0.001, 1.2, i));
        }
        assert_eq!(subscriber.outbound.lock().len(), 2);
        assert_eq!(subscriber.dropped_batches(), 3);
    }

    #[test]
    fn sustained_dropping_closes_slow_consumer() {
        let hub = QuoteHub::new(1, 1, 3);
        let ticks = TickStore::new(100, 1e-5);
        let subscriber = hub.register(1);
        hub.subscribe(subscriber.conn_id, &["EURUSD".to_string()], &ticks);

        for cycle in 0..3 {
            // Two ticks per cycle guarantee at least one drop.
            hub.publish_tick(&tick("EURUSD", 1.10 + cycle as f64 * 0.01, 1.2, cycle * 2));
            hub.publish_tick(&tick(
                "EURUSD",
                1.105 + cycle as f64 * 0.01,
                1.2,
                cycle * 2 + 1,
            ));
            let closed = hub.flush_all();
            if cycle < 2 {
                assert!(closed.is_empty());
            } else {
                assert_eq!(closed, vec![subscriber.conn_id]);
            }
        }
        assert!(subscriber.is_closed());
    }

    #[tokio::test]
    async fn execution_events_reach_only_the_account() {
        let hub = hub();
        let sub_a = hub.register(1);
        let sub_b = hub.register(2);

        hub.publish_execution(1, &serde_json::json!({"type": "execution", "orderId": 7}));

        let msg = sub_a.next_message().await.unwrap();
        assert!(msg.contains("execution"));
        assert!(sub_b.outbound.lock().is_empty());
    }
}
