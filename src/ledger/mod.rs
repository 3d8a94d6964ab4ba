// =============================================================================
// Position/Account Ledger — per-account state with per-account locking
// =============================================================================
//
// The Ledger owns every account book exclusively; everything outside refers
// to accounts and positions by id and receives cloned snapshots.  Each book
// sits behind its own `Mutex` so marking one account never contends with
// filling another; the outer map takes a read lock only.
// =============================================================================

pub mod accounts;
pub mod exposure;
pub mod positions;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use accounts::Account;
pub use exposure::ExposureSnapshot;
pub use positions::{
    ApplyOutcome, CloseReason, Fill, FillSource, IdGen, LiquidationEvent, Position,
    PositionStatus, Trade,
};

use crate::config::AccountConfig;
use crate::symbols::SymbolSpec;
use positions::AccountBook;

/// Everything a mark-to-market pass produced for one symbol.
#[derive(Debug, Default)]
pub struct MarkOutcome {
    /// SL/TP closes triggered by this tick.
    pub triggered: Vec<Trade>,
    /// Stop-out liquidations caused by this tick.
    pub liquidations: Vec<LiquidationEvent>,
}

/// Snapshot of one account plus its open positions.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account: Account,
    pub open_positions: Vec<Position>,
}

pub struct Ledger {
    books: RwLock<HashMap<u64, Arc<Mutex<AccountBook>>>>,
    ids: IdGen,
    stop_out_level_pct: f64,
}

impl Ledger {
    pub fn new(accounts: &[AccountConfig], stop_out_level_pct: f64) -> Self {
        let mut books = HashMap::new();
        for cfg in accounts {
            books.insert(
                cfg.id,
                Arc::new(Mutex::new(AccountBook::new(Account::from_config(cfg)))),
            );
        }
        Self {
            books: RwLock::new(books),
            ids: IdGen::default(),
            stop_out_level_pct,
        }
    }

    fn book(&self, account_id: u64) -> anyhow::Result<Arc<Mutex<AccountBook>>> {
        self.books
            .read()
            .get(&account_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("account {account_id} not found"))
    }

    // -------------------------------------------------------------------------
    // Admin surface
    // -------------------------------------------------------------------------

    /// Register a new account. Admin path.
    pub fn upsert_account(&self, cfg: &AccountConfig) {
        let mut books = self.books.write();
        books
            .entry(cfg.id)
            .or_insert_with(|| Arc::new(Mutex::new(AccountBook::new(Account::from_config(cfg)))));
    }

    pub fn account_ids(&self) -> Vec<u64> {
        self.books.read().keys().copied().collect()
    }

    pub fn snapshot(&self, account_id: u64) -> anyhow::Result<AccountSnapshot> {
        let book = self.book(account_id)?;
        let book = book.lock();
        Ok(AccountSnapshot {
            account: book.account.clone(),
            open_positions: book.open.clone(),
        })
    }

    pub fn is_frozen(&self, account_id: u64) -> bool {
        self.book(account_id)
            .map(|b| b.lock().account.frozen)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Fills / closes / modification
    // -------------------------------------------------------------------------

    pub fn apply_fill(&self, fill: &Fill, spec: &SymbolSpec) -> anyhow::Result<ApplyOutcome> {
        let book = self.book(fill.account_id)?;
        let mut book = book.lock();
        book.apply_fill(fill, spec, &self.ids)
    }

    pub fn close_position(
        &self,
        account_id: u64,
        position_id: u64,
        volume: Option<f64>,
        price: f64,
        reason: CloseReason,
    ) -> anyhow::Result<Trade> {
        let book = self.book(account_id)?;
        let mut book = book.lock();
        book.close_position(position_id, volume, price, reason, &self.ids)
    }

    pub fn modify_position(
        &self,
        account_id: u64,
        position_id: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> anyhow::Result<Position> {
        let book = self.book(account_id)?;
        let mut book = book.lock();
        book.modify_position(position_id, sl, tp)
    }

    pub fn open_positions(&self, account_id: u64) -> Vec<Position> {
        self.book(account_id)
            .map(|b| b.lock().open.clone())
            .unwrap_or_default()
    }

    pub fn recent_trades(&self, account_id: u64, count: usize) -> Vec<Trade> {
        self.book(account_id)
            .map(|b| {
                let book = b.lock();
                let skip = book.trades.len().saturating_sub(count);
                book.trades.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Marking
    // -------------------------------------------------------------------------

    /// Reprice every account's positions in `symbol`, evaluate SL/TP, and run
    /// stop-out checks. Called by the ingestion path on each accepted tick.
    pub fn mark_to_market(&self, symbol: &str, bid: f64, ask: f64) -> MarkOutcome {
        let books: Vec<Arc<Mutex<AccountBook>>> =
            self.books.read().values().cloned().collect();

        let mut outcome = MarkOutcome::default();
        for book in books {
            let mut book = book.lock();
            if book.open.iter().all(|p| p.symbol != symbol) {
                continue;
            }
            book.mark(symbol, bid, ask);
            outcome
                .triggered
                .extend(book.check_triggers(symbol, bid, ask, &self.ids));
            if let Some(event) = book.stop_out(self.stop_out_level_pct, &self.ids) {
                outcome.liquidations.push(event);
            }
        }
        outcome
    }

    /// Per-symbol exposure view over all open positions.
    pub fn exposure(&self, symbol: &str, limit_lots: f64) -> ExposureSnapshot {
        let books: Vec<Arc<Mutex<AccountBook>>> =
            self.books.read().values().cloned().collect();
        let mut long = 0.0;
        let mut short = 0.0;
        for book in books {
            let book = book.lock();
            for pos in book.open.iter().filter(|p| p.symbol == symbol) {
                match pos.side {
                    crate::types::Side::Buy => long += pos.volume,
                    crate::types::Side::Sell => short += pos.volume,
                }
            }
        }
        ExposureSnapshot::new(symbol, long, short, limit_lots)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, MarginMode, Side};
    use chrono::Utc;
    use rust_decimal::prelude::ToPrimitive;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            name: "EURUSD".into(),
            contract_size: 100_000.0,
            pip_size: 0.0001,
            pip_value: 10.0,
            margin_percent: 1.0,
            commission_per_lot: 0.0,
            min_lot: 0.01,
            exposure_limit_lots: 100.0,
            enabled: true,
        }
    }

    fn account(id: u64, balance: f64, mode: MarginMode) -> AccountConfig {
        AccountConfig {
            id,
            user_id: id,
            group: "retail".into(),
            leverage: 100,
            margin_mode: mode,
            balance,
            credit: 0.0,
            classification: Classification::Normal,
        }
    }

    fn fill(account_id: u64, side: Side, volume: f64, price: f64) -> Fill {
        Fill {
            order_id: 1,
            account_id,
            symbol: "EURUSD".into(),
            side,
            volume,
            price,
            source: FillSource::Internal,
            at: Utc::now(),
        }
    }

    #[test]
    fn bbook_fill_marks_to_market() {
        // Scenario: balance 10 000, BUY 1 lot at ask 1.10002, then the market
        // moves to 1.10100/1.10102.
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);

        let outcome = ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10002), &spec())
            .unwrap();
        assert!((outcome.position.unrealized_pnl).abs() < 1e-9);

        ledger.mark_to_market("EURUSD", 1.10100, 1.10102);
        let snap = ledger.snapshot(1).unwrap();
        let pos = &snap.open_positions[0];
        assert!((pos.unrealized_pnl - 98.0).abs() < 1e-6);
        assert!((snap.account.equity - 10_098.0).abs() < 1e-6);
    }

    #[test]
    fn balance_tracks_realized_pnl() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);
        let opened = ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();

        let trade = ledger
            .close_position(1, opened.position.id, None, 1.10100, CloseReason::Manual)
            .unwrap();
        assert!((trade.realized_pnl.to_f64().unwrap() - 100.0).abs() < 1e-6);

        let snap = ledger.snapshot(1).unwrap();
        assert!((snap.account.balance.to_f64().unwrap() - 10_100.0).abs() < 1e-6);
        assert!(snap.open_positions.is_empty());
        assert!(snap.account.margin_level.is_infinite());
    }

    #[test]
    fn partial_close_realizes_proportionally() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);
        let opened = ledger
            .apply_fill(&fill(1, Side::Buy, 2.0, 1.10000), &spec())
            .unwrap();

        ledger
            .close_position(1, opened.position.id, Some(0.5), 1.10100, CloseReason::Manual)
            .unwrap();

        let snap = ledger.snapshot(1).unwrap();
        assert!((snap.open_positions[0].volume - 1.5).abs() < 1e-9);
        assert!((snap.account.balance.to_f64().unwrap() - 10_050.0).abs() < 1e-6);
    }

    #[test]
    fn netting_reduces_and_flips() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Netting)], 50.0);
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();

        // SELL 1.5 against a 1.0 BUY: closes the BUY at 1.10100 and opens a
        // 0.5 SELL.
        let outcome = ledger
            .apply_fill(&fill(1, Side::Sell, 1.5, 1.10100), &spec())
            .unwrap();

        let trade = outcome.realized.expect("reduction realizes");
        assert!((trade.realized_pnl.to_f64().unwrap() - 100.0).abs() < 1e-6);
        assert_eq!(outcome.position.side, Side::Sell);
        assert!((outcome.position.volume - 0.5).abs() < 1e-9);

        let snap = ledger.snapshot(1).unwrap();
        assert_eq!(snap.open_positions.len(), 1);
    }

    #[test]
    fn netting_same_side_merges_weighted() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Netting)], 50.0);
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();
        let outcome = ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10200), &spec())
            .unwrap();

        assert!((outcome.position.volume - 2.0).abs() < 1e-9);
        assert!((outcome.position.open_price - 1.10100).abs() < 1e-9);
    }

    #[test]
    fn sl_trigger_closes_buy_at_bid() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);
        let opened = ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();
        ledger.mark_to_market("EURUSD", 1.10000, 1.10002);
        ledger
            .modify_position(1, opened.position.id, Some(1.09900), None)
            .unwrap();

        let outcome = ledger.mark_to_market("EURUSD", 1.09890, 1.09892);
        assert_eq!(outcome.triggered.len(), 1);
        assert_eq!(outcome.triggered[0].reason, CloseReason::StopLoss);
        assert!((outcome.triggered[0].close_price - 1.09890).abs() < 1e-9);
        assert!(ledger.snapshot(1).unwrap().open_positions.is_empty());
    }

    #[test]
    fn modify_rejects_wrong_side_levels() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);
        let opened = ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();

        // SL above the current price is invalid for a BUY.
        assert!(ledger
            .modify_position(1, opened.position.id, Some(1.20000), None)
            .is_err());
        // TP below the current price is invalid for a BUY.
        assert!(ledger
            .modify_position(1, opened.position.id, None, Some(1.00000))
            .is_err());
    }

    #[test]
    fn margin_level_at_threshold_is_not_liquidated() {
        // Engineer an account whose margin level lands exactly on the
        // threshold: equity 11, margin_used 11 -> level 100%.
        let ledger = Ledger::new(&[account(1, 11.0, MarginMode::Hedging)], 100.0);
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();

        // Margin used = 1 * 100k * 1.1 * 1% / 100 = 11. Unrealized 0 at the
        // open price, so level = 11 / 11 * 100 = 100 exactly.
        let outcome = ledger.mark_to_market("EURUSD", 1.10000, 1.10000);
        assert!(outcome.liquidations.is_empty());
        assert_eq!(ledger.snapshot(1).unwrap().open_positions.len(), 1);
    }

    #[test]
    fn stop_out_closes_worst_loser_first() {
        let ledger = Ledger::new(&[account(1, 30.0, MarginMode::Hedging)], 50.0);
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10500), &spec())
            .unwrap();

        // Price collapses; the 1.10500 open carries the worse loss.
        let outcome = ledger.mark_to_market("EURUSD", 1.09000, 1.09002);
        assert_eq!(outcome.liquidations.len(), 1);
        let event = &outcome.liquidations[0];
        assert!(!event.closed_position_ids.is_empty());
        assert!(event.margin_level_after >= 50.0 || ledger.open_positions(1).is_empty());

        // The worst loser (second position) went first.
        assert_eq!(event.closed_position_ids[0], 2);
    }

    #[test]
    fn equity_invariant_holds_across_fills_and_closes() {
        let ledger = Ledger::new(&[account(1, 10_000.0, MarginMode::Hedging)], 50.0);
        ledger
            .apply_fill(&fill(1, Side::Buy, 1.0, 1.10000), &spec())
            .unwrap();
        ledger
            .apply_fill(&fill(1, Side::Sell, 0.5, 1.10050), &spec())
            .unwrap();
        ledger.mark_to_market("EURUSD", 1.10100, 1.10102);

        let snap = ledger.snapshot(1).unwrap();
        let unrealized: f64 = snap.open_positions.iter().map(|p| p.unrealized_pnl).sum();
        let cash = snap.account.balance.to_f64().unwrap();
        assert!((snap.account.equity - (cash + unrealized)).abs() < 1e-6);
    }
}
