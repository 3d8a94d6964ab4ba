// =============================================================================
// OHLC Aggregator — per-tick bar derivation across fixed timeframes
// =============================================================================
//
// Maintains one open bar per (symbol, timeframe).  Buckets are closed-left /
// open-right: a tick whose timestamp lands exactly on a boundary starts the
// new bucket.  Frozen bars move into a bounded per-key history; bars are a
// pure function of the accepted tick stream and are never persisted here.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::market_data::Tick;

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// The fixed set of supported bar timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn seconds(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
            Self::H1 => write!(f, "1h"),
            Self::H4 => write!(f, "4h"),
            Self::D1 => write!(f, "1d"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => anyhow::bail!("unknown timeframe: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

/// One OHLC bar over a single bucket. Mutable while the bucket is open,
/// frozen at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bucket start in epoch seconds.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_count: u64,
}

impl Bar {
    fn start(symbol: &str, timeframe: Timeframe, bucket_start: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            tick_count: 1,
        }
    }

    fn apply(&mut self, price: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.tick_count += 1;
    }
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct BarKey {
    symbol: String,
    timeframe: Timeframe,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// In-memory bar derivation, updated on every accepted tick.
pub struct OhlcAggregator {
    current: RwLock<HashMap<BarKey, Bar>>,
    history: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    max_bars: usize,
}

impl OhlcAggregator {
    /// `max_bars` frozen bars are retained per (symbol, timeframe).
    pub fn new(max_bars: usize) -> Self {
        Self {
            current: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Fold one accepted tick into every timeframe's open bar, freezing bars
    /// whose bucket has rolled over.
    pub fn on_tick(&self, tick: &Tick) {
        let price = tick.mid();
        let ts_secs = tick.timestamp_ns.div_euclid(1_000_000_000);

        for tf in Timeframe::ALL {
            let bucket = ts_secs.div_euclid(tf.seconds()) * tf.seconds();
            let key = BarKey {
                symbol: tick.symbol.clone(),
                timeframe: tf,
            };

            let mut current = self.current.write();
            match current.get_mut(&key) {
                Some(bar) if bar.bucket_start == bucket => {
                    bar.apply(price);
                }
                Some(bar) => {
                    let frozen = bar.clone();
                    *bar = Bar::start(&tick.symbol, tf, bucket, price);
                    drop(current);
                    self.freeze(key, frozen);
                }
                None => {
                    current.insert(key, Bar::start(&tick.symbol, tf, bucket, price));
                }
            }
        }
    }

    fn freeze(&self, key: BarKey, bar: Bar) {
        let mut history = self.history.write();
        let ring = history.entry(key).or_default();
        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// The open (in-progress) bar for a key, if any ticks have arrived.
    pub fn current_bar(&self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        let key = BarKey {
            symbol: symbol.to_string(),
            timeframe,
        };
        self.current.read().get(&key).cloned()
    }

    /// The most recent `count` frozen bars, oldest first.
    pub fn recent_bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Bar> {
        let key = BarKey {
            symbol: symbol.to_string(),
            timeframe,
        };
        match self.history.read().get(&key) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(count);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_at(secs: i64, bid: f64) -> Tick {
        Tick {
            symbol: "EURUSD".to_string(),
            bid,
            ask: bid + 0.0002,
            spread: 0.0002,
            timestamp_ns: secs * 1_000_000_000,
            sequence: secs as u64,
        }
    }

    #[test]
    fn bar_tracks_open_high_low_close() {
        let agg = OhlcAggregator::new(10);
        agg.on_tick(&tick_at(0, 1.1000));
        agg.on_tick(&tick_at(10, 1.1050));
        agg.on_tick(&tick_at(20, 1.0950));
        agg.on_tick(&tick_at(30, 1.1010));

        let bar = agg.current_bar("EURUSD", Timeframe::M1).unwrap();
        assert_eq!(bar.tick_count, 4);
        assert!((bar.open - 1.1001).abs() < 1e-9);
        assert!((bar.high - 1.1051).abs() < 1e-9);
        assert!((bar.low - 1.0951).abs() < 1e-9);
        assert!((bar.close - 1.1011).abs() < 1e-9);

        assert!(bar.low <= bar.open && bar.open <= bar.high);
        assert!(bar.low <= bar.close && bar.close <= bar.high);
    }

    #[test]
    fn boundary_tick_starts_the_new_bucket() {
        let agg = OhlcAggregator::new(10);
        agg.on_tick(&tick_at(59, 1.1000));
        // Exactly on the minute boundary: closed-left means this opens bar 60.
        agg.on_tick(&tick_at(60, 1.2000));

        let open = agg.current_bar("EURUSD", Timeframe::M1).unwrap();
        assert_eq!(open.bucket_start, 60);
        assert_eq!(open.tick_count, 1);

        let frozen = agg.recent_bars("EURUSD", Timeframe::M1, 10);
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].bucket_start, 0);
        assert_eq!(frozen[0].tick_count, 1);
    }

    #[test]
    fn bars_are_non_overlapping_and_ordered() {
        let agg = OhlcAggregator::new(10);
        for m in 0..5i64 {
            agg.on_tick(&tick_at(m * 60 + 1, 1.10 + m as f64 * 0.01));
            agg.on_tick(&tick_at(m * 60 + 30, 1.10 + m as f64 * 0.01 + 0.002));
        }

        let bars = agg.recent_bars("EURUSD", Timeframe::M1, 10);
        assert_eq!(bars.len(), 4);
        for pair in bars.windows(2) {
            assert_eq!(pair[0].bucket_start + 60, pair[1].bucket_start);
        }
        for bar in &bars {
            assert_eq!(bar.tick_count, 2);
        }
    }

    #[test]
    fn every_timeframe_gets_a_bar() {
        let agg = OhlcAggregator::new(10);
        agg.on_tick(&tick_at(100_000, 1.1000));
        for tf in Timeframe::ALL {
            let bar = agg.current_bar("EURUSD", tf).unwrap();
            assert_eq!(bar.bucket_start % tf.seconds(), 0);
        }
    }

    #[test]
    fn history_is_bounded() {
        let agg = OhlcAggregator::new(3);
        for m in 0..10i64 {
            agg.on_tick(&tick_at(m * 60, 1.10));
        }
        let bars = agg.recent_bars("EURUSD", Timeframe::M1, 100);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[2].bucket_start, 8 * 60);
    }
}
