pub mod ohlc;
pub mod tick_store;

// Re-export the hot-path types for convenient access
// (e.g. `use crate::market_data::Tick`).
pub use ohlc::{Bar, OhlcAggregator, Timeframe};
pub use tick_store::{Tick, TickStats, TickStore};
