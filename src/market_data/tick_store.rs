// =============================================================================
// Tick Ring Store — per-symbol bounded circular buffers with quote throttling
// =============================================================================
//
// One fixed-capacity ring per symbol.  `store` is the ingestion hot path: it
// checks the throttle under a short-held lock on the last-mid map, then takes
// the per-ring writer lock for a single assignment plus two index updates.
// It never blocks on I/O and never allocates once a ring is warm.
//
// Counters are atomics so `stats()` is a lock-free snapshot and the invariant
// `received == stored + throttled` holds at every instant.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One quote from a liquidity provider. Immutable once emitted by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub timestamp_ns: i64,
    pub sequence: u64,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Atomic snapshot of the store's throttle counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TickStats {
    pub received: u64,
    pub stored: u64,
    pub throttled: u64,
}

// ---------------------------------------------------------------------------
// Per-symbol ring
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer of ticks.
///
/// `buf` grows by push until it reaches capacity (warm-up), after which every
/// store overwrites in place and the oldest element is evicted.
struct TickRing {
    buf: Vec<Tick>,
    capacity: usize,
    /// Index of the oldest element.
    head: usize,
    count: usize,
}

impl TickRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, tick: Tick) {
        if self.buf.len() < self.capacity {
            self.buf.push(tick);
            self.count += 1;
        } else {
            let tail = (self.head + self.count) % self.capacity;
            self.buf[tail] = tick;
            if self.count == self.capacity {
                self.head = (self.head + 1) % self.capacity;
            } else {
                self.count += 1;
            }
        }
    }

    /// The `n` most recent ticks, oldest first. Allocates exactly the result.
    fn recent(&self, n: usize) -> Vec<Tick> {
        let take = n.min(self.count);
        let mut out = Vec::with_capacity(take);
        for i in (self.count - take)..self.count {
            let idx = (self.head + i) % self.capacity.max(1);
            out.push(self.buf[idx].clone());
        }
        out
    }

    fn latest(&self) -> Option<Tick> {
        if self.count == 0 {
            return None;
        }
        let idx = (self.head + self.count - 1) % self.capacity.max(1);
        Some(self.buf[idx].clone())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe store of one ring per symbol, plus the quote throttle.
pub struct TickStore {
    rings: RwLock<HashMap<String, Arc<RwLock<TickRing>>>>,
    /// Per-symbol (bid, ask) of the last *stored* tick. Short-held lock,
    /// checked before any ring lock is taken.
    last_quotes: Mutex<HashMap<String, (f64, f64)>>,
    capacity: usize,
    epsilon: f64,
    received: AtomicU64,
    stored: AtomicU64,
    throttled: AtomicU64,
}

impl TickStore {
    pub fn new(capacity: usize, epsilon: f64) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            last_quotes: Mutex::new(HashMap::new()),
            capacity,
            epsilon,
            received: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    /// Store a tick, returning `true` if it was accepted.
    ///
    /// A tick is dropped when neither side of the book moved by at least
    /// epsilon against the last stored quote (strictly sub-epsilon on both
    /// bid and ask). Drops are silent: the counter is bumped and the caller
    /// sees `false`, nothing downstream fires.
    pub fn store(&self, tick: Tick) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);

        {
            let mut last_quotes = self.last_quotes.lock();
            match last_quotes.get(&tick.symbol) {
                Some(&(last_bid, last_ask))
                    if (tick.bid - last_bid).abs() < self.epsilon
                        && (tick.ask - last_ask).abs() < self.epsilon =>
                {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    debug!(symbol = %tick.symbol, bid = tick.bid, ask = tick.ask, "tick throttled");
                    return false;
                }
                _ => {
                    last_quotes.insert(tick.symbol.clone(), (tick.bid, tick.ask));
                }
            }
        }

        let ring = self.ring_for(&tick.symbol);
        ring.write().push(tick);
        self.stored.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn ring_for(&self, symbol: &str) -> Arc<RwLock<TickRing>> {
        if let Some(ring) = self.rings.read().get(symbol) {
            return ring.clone();
        }
        let mut rings = self.rings.write();
        rings
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TickRing::new(self.capacity))))
            .clone()
    }

    /// At most `min(n, count)` most-recent ticks, newest last.
    pub fn get_recent(&self, symbol: &str, n: usize) -> Vec<Tick> {
        match self.rings.read().get(symbol) {
            Some(ring) => ring.read().recent(n),
            None => Vec::new(),
        }
    }

    /// The single most recent stored tick for a symbol.
    pub fn latest(&self, symbol: &str) -> Option<Tick> {
        self.rings.read().get(symbol).and_then(|r| r.read().latest())
    }

    /// Number of ticks currently held for a symbol.
    pub fn count(&self, symbol: &str) -> usize {
        self.rings.read().get(symbol).map_or(0, |r| r.read().count)
    }

    pub fn stats(&self) -> TickStats {
        TickStats {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, bid: f64, ask: f64, seq: u64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: seq as i64 * 1_000_000,
            sequence: seq,
        }
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let store = TickStore::new(4, 0.0);
        for i in 0..10 {
            // Spread prices far enough apart that the throttle never fires.
            store.store(tick("EURUSD", 1.0 + i as f64 * 0.01, 1.0002 + i as f64 * 0.01, i));
        }
        assert_eq!(store.count("EURUSD"), 4);
    }

    #[test]
    fn get_recent_returns_newest_last_in_order() {
        let store = TickStore::new(4, 0.0);
        for i in 0..6 {
            store.store(tick("EURUSD", 1.0 + i as f64 * 0.01, 1.0002 + i as f64 * 0.01, i));
        }
        let recent = store.get_recent("EURUSD", 3);
        assert_eq!(recent.len(), 3);
        let seqs: Vec<u64> = recent.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn store_at_capacity_overwrites_oldest() {
        let store = TickStore::new(3, 0.0);
        for i in 0..3 {
            store.store(tick("EURUSD", 1.0 + i as f64 * 0.01, 1.0002 + i as f64 * 0.01, i));
        }
        assert_eq!(store.count("EURUSD"), 3);

        store.store(tick("EURUSD", 2.0, 2.0002, 99));
        assert_eq!(store.count("EURUSD"), 3);

        let recent = store.get_recent("EURUSD", 3);
        assert_eq!(recent[0].sequence, 1);
        assert_eq!(recent[2].sequence, 99);
    }

    #[test]
    fn throttle_drops_sub_epsilon_moves() {
        let store = TickStore::new(16, 1e-5);
        assert!(store.store(tick("EURUSD", 1.10000, 1.10002, 1)));

        // Sub-pip move: relative change ~4.5e-6 < 1e-5.
        assert!(!store.store(tick("EURUSD", 1.100005, 1.100025, 2)));

        let stats = store.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.throttled, 1);

        // The ring still holds the previous tick only.
        let recent = store.get_recent("EURUSD", 1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].sequence, 1);
    }

    #[test]
    fn one_sided_move_at_epsilon_is_stored() {
        let store = TickStore::new(16, 1e-5);
        assert!(store.store(tick("EURUSD", 1.10000, 1.10002, 1)));

        // Bid unchanged, ask up a full epsilon: informative, kept.
        assert!(store.store(tick("EURUSD", 1.10000, 1.10003, 2)));
        assert_eq!(store.stats().throttled, 0);
    }

    #[test]
    fn counters_balance_after_mixed_traffic() {
        let store = TickStore::new(16, 1e-5);
        for i in 0..50u64 {
            // Integer division makes every odd tick repeat the price of the
            // even tick before it, so half the traffic gets throttled.
            let px = 1.0 + (i / 2) as f64 * 0.001;
            store.store(tick("GBPUSD", px, px + 0.0002, i));
        }
        let stats = store.stats();
        assert_eq!(stats.received, stats.stored + stats.throttled);
        assert_eq!(stats.received, 50);
    }

    #[test]
    fn first_tick_per_symbol_is_always_stored() {
        let store = TickStore::new(8, 1e-5);
        assert!(store.store(tick("USDJPY", 150.00, 150.02, 1)));
        assert!(store.store(tick("AUDUSD", 0.6500, 0.6502, 1)));
        assert_eq!(store.stats().stored, 2);
    }
}
