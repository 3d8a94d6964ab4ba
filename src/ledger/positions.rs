// =============================================================================
// Position Book — per-account open positions, fills, closes, and triggers
// =============================================================================
//
// Life-cycle:
//   Fill  ->  Open position (hedging) or net against existing (netting)
//   Open  ->  Closed (manual / SL / TP / stop-out), possibly in partial steps
//
// Every close writes a Trade record and realizes P&L into the account
// balance.  All methods run under the owning account's lock; the Ledger in
// `mod.rs` is the only caller.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::accounts::{position_margin, Account};
use crate::symbols::SymbolSpec;
use crate::types::Side;

/// Closed positions and trades retained per account for queries.
const MAX_CLOSED_RECORDS: usize = 1_000;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Where a fill came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSource {
    /// Internalized against the broker's book.
    Internal,
    /// Executed at the named liquidity provider.
    Lp(String),
}

impl std::fmt::Display for FillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Lp(name) => write!(f, "lp:{name}"),
        }
    }
}

/// An execution applied to the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub source: FillSource,
    pub at: DateTime<Utc>,
}

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single tracked position. Referenced by id only from outside the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    /// Remaining open volume in lots (reduced on partial close).
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub open_time: DateTime<Utc>,
    pub swap: f64,
    pub commission: f64,
    pub unrealized_pnl: f64,
    pub status: PositionStatus,
    pub close_price: Option<f64>,
    pub close_time: Option<DateTime<Utc>>,
    pub realized_pnl: f64,

    // Contract terms snapshotted at open so the mark path never consults the
    // symbol registry.
    #[serde(skip)]
    pub(crate) contract_size: f64,
    #[serde(skip)]
    pub(crate) margin_percent: f64,
}

impl Position {
    /// Margin this position consumes at the account's leverage.
    pub(crate) fn margin(&self, leverage: u32) -> f64 {
        position_margin(
            self.volume,
            self.contract_size,
            self.open_price,
            self.margin_percent,
            leverage,
        )
    }
}

/// Why a position (or part of one) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    StopOut,
    Netting,
    Forced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopOut => write!(f, "stop_out"),
            Self::Netting => write!(f, "netting"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

/// Record of one realization event (full or partial close).
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: u64,
    pub position_id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub realized_pnl: Decimal,
    pub swap: Decimal,
    pub reason: CloseReason,
    pub at: DateTime<Utc>,
}

/// Emitted when stop-out liquidation force-closes positions.
#[derive(Debug, Clone, Serialize)]
pub struct LiquidationEvent {
    pub account_id: u64,
    pub closed_position_ids: Vec<u64>,
    pub margin_level_before: f64,
    pub margin_level_after: f64,
    pub at: DateTime<Utc>,
}

/// Outcome of applying a fill.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The affected position as it stands after the fill.
    pub position: Position,
    /// A trade record when the fill reduced or flipped an existing position
    /// (netting mode).
    pub realized: Option<Trade>,
}

// ---------------------------------------------------------------------------
// Id generation
// ---------------------------------------------------------------------------

/// Process-local id source shared by all account books.
#[derive(Debug, Default)]
pub struct IdGen {
    position: AtomicU64,
    trade: AtomicU64,
}

impl IdGen {
    pub fn next_position(&self) -> u64 {
        self.position.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_trade(&self) -> u64 {
        self.trade.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ---------------------------------------------------------------------------
// Account book
// ---------------------------------------------------------------------------

/// All mutable per-account state, guarded by one lock in the Ledger.
pub struct AccountBook {
    pub account: Account,
    pub open: Vec<Position>,
    pub closed: Vec<Position>,
    pub trades: Vec<Trade>,
}

impl AccountBook {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            open: Vec::new(),
            closed: Vec::new(),
            trades: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply a fill: open a new position (hedging) or net against an existing
    /// same-symbol position (netting).
    pub fn apply_fill(
        &mut self,
        fill: &Fill,
        spec: &SymbolSpec,
        ids: &IdGen,
    ) -> anyhow::Result<ApplyOutcome> {
        if fill.volume <= 0.0 {
            anyhow::bail!("fill volume must be positive");
        }

        let commission = spec.commission_per_lot * fill.volume;
        if commission > 0.0 {
            self.account
                .charge_commission(Decimal::from_f64_retain(commission).unwrap_or_default());
        }

        let outcome = match self.account.margin_mode {
            crate::types::MarginMode::Hedging => {
                let position = self.open_new(fill, spec, commission, ids);
                ApplyOutcome {
                    position,
                    realized: None,
                }
            }
            crate::types::MarginMode::Netting => self.net_fill(fill, spec, commission, ids)?,
        };

        self.recompute();
        Ok(outcome)
    }

    fn open_new(
        &mut self,
        fill: &Fill,
        spec: &SymbolSpec,
        commission: f64,
        ids: &IdGen,
    ) -> Position {
        let position = Position {
            id: ids.next_position(),
            account_id: self.account.id,
            symbol: fill.symbol.clone(),
            side: fill.side,
            volume: fill.volume,
            open_price: fill.price,
            current_price: fill.price,
            sl: None,
            tp: None,
            open_time: fill.at,
            swap: 0.0,
            commission,
            unrealized_pnl: 0.0,
            status: PositionStatus::Open,
            close_price: None,
            close_time: None,
            realized_pnl: 0.0,
            contract_size: spec.contract_size,
            margin_percent: spec.margin_percent,
        };
        info!(
            account_id = self.account.id,
            position_id = position.id,
            symbol = %position.symbol,
            side = %position.side,
            volume = position.volume,
            open_price = position.open_price,
            "position opened"
        );
        self.open.push(position.clone());
        position
    }

    fn net_fill(
        &mut self,
        fill: &Fill,
        spec: &SymbolSpec,
        commission: f64,
        ids: &IdGen,
    ) -> anyhow::Result<ApplyOutcome> {
        let existing_idx = self
            .open
            .iter()
            .position(|p| p.symbol == fill.symbol && p.status == PositionStatus::Open);

        let Some(idx) = existing_idx else {
            let position = self.open_new(fill, spec, commission, ids);
            return Ok(ApplyOutcome {
                position,
                realized: None,
            });
        };

        if self.open[idx].side == fill.side {
            // Same direction: merge at the volume-weighted open price.
            let pos = &mut self.open[idx];
            let total = pos.volume + fill.volume;
            pos.open_price =
                (pos.open_price * pos.volume + fill.price * fill.volume) / total;
            pos.volume = total;
            pos.commission += commission;
            return Ok(ApplyOutcome {
                position: pos.clone(),
                realized: None,
            });
        }

        // Opposite direction: reduce, possibly flipping through zero.
        let reduce = fill.volume.min(self.open[idx].volume);
        let remainder = fill.volume - reduce;
        let trade = self.close_at(idx, reduce, fill.price, CloseReason::Netting, fill.at, ids);

        if remainder > 0.0 {
            let flipped = Fill {
                volume: remainder,
                ..fill.clone()
            };
            let position = self.open_new(&flipped, spec, 0.0, ids);
            Ok(ApplyOutcome {
                position,
                realized: Some(trade),
            })
        } else {
            // Position may be fully closed; report its final state.
            let position = self
                .open
                .iter()
                .find(|p| p.symbol == fill.symbol && p.status == PositionStatus::Open)
                .cloned()
                .unwrap_or_else(|| self.closed.last().cloned().expect("close recorded"));
            Ok(ApplyOutcome {
                position,
                realized: Some(trade),
            })
        }
    }

    // -------------------------------------------------------------------------
    // Closes
    // -------------------------------------------------------------------------

    /// Close `volume` lots (or everything when `None`) of a position at
    /// `price`. Writes a Trade, realizes P&L into the balance.
    pub fn close_position(
        &mut self,
        position_id: u64,
        volume: Option<f64>,
        price: f64,
        reason: CloseReason,
        ids: &IdGen,
    ) -> anyhow::Result<Trade> {
        let idx = self
            .open
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| anyhow::anyhow!("position {position_id} not found"))?;

        let close_volume = volume.unwrap_or(self.open[idx].volume);
        if close_volume <= 0.0 || close_volume > self.open[idx].volume + 1e-12 {
            anyhow::bail!(
                "close volume {close_volume} out of range for position {position_id}"
            );
        }

        let trade = self.close_at(idx, close_volume, price, reason, Utc::now(), ids);
        self.recompute();
        Ok(trade)
    }

    /// Internal close primitive shared by manual closes, netting reductions,
    /// SL/TP triggers, and stop-out.
    fn close_at(
        &mut self,
        idx: usize,
        volume: f64,
        price: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
        ids: &IdGen,
    ) -> Trade {
        let fraction = volume / self.open[idx].volume;
        let (realized, swap_part) = {
            let pos = &mut self.open[idx];
            let realized =
                (price - pos.open_price) * volume * pos.contract_size * pos.side.direction();
            let swap_part = pos.swap * fraction;
            pos.volume -= volume;
            pos.swap -= swap_part;
            pos.realized_pnl += realized;
            (realized, swap_part)
        };

        let realized_dec = Decimal::from_f64_retain(realized).unwrap_or_default();
        let swap_dec = Decimal::from_f64_retain(swap_part).unwrap_or_default();
        self.account.realize(realized_dec);
        if swap_part != 0.0 {
            self.account.apply_swap(swap_dec);
        }

        let pos = &mut self.open[idx];
        let trade = Trade {
            id: ids.next_trade(),
            position_id: pos.id,
            account_id: pos.account_id,
            symbol: pos.symbol.clone(),
            side: pos.side,
            volume,
            open_price: pos.open_price,
            close_price: price,
            realized_pnl: realized_dec,
            swap: swap_dec,
            reason,
            at,
        };

        info!(
            account_id = trade.account_id,
            position_id = trade.position_id,
            volume,
            close_price = price,
            realized = realized,
            reason = %reason,
            "position reduced"
        );

        if pos.volume <= 1e-12 {
            pos.volume = 0.0;
            pos.status = PositionStatus::Closed;
            pos.close_price = Some(price);
            pos.close_time = Some(at);
            pos.current_price = price;
            pos.unrealized_pnl = 0.0;
            let closed = self.open.remove(idx);
            self.closed.push(closed);
            while self.closed.len() > MAX_CLOSED_RECORDS {
                self.closed.remove(0);
            }
        } else {
            pos.unrealized_pnl = (pos.current_price - pos.open_price)
                * pos.volume
                * pos.contract_size
                * pos.side.direction();
        }

        self.trades.push(trade.clone());
        while self.trades.len() > MAX_CLOSED_RECORDS {
            self.trades.remove(0);
        }
        trade
    }

    // -------------------------------------------------------------------------
    // Modification
    // -------------------------------------------------------------------------

    /// Set SL/TP, validating they sit on the correct side of the current
    /// price.
    pub fn modify_position(
        &mut self,
        position_id: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> anyhow::Result<Position> {
        let pos = self
            .open
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| anyhow::anyhow!("position {position_id} not found"))?;

        let price = pos.current_price;
        match pos.side {
            Side::Buy => {
                if let Some(sl) = sl {
                    if sl >= price {
                        anyhow::bail!("BUY stop-loss {sl} must be below current price {price}");
                    }
                }
                if let Some(tp) = tp {
                    if tp <= price {
                        anyhow::bail!("BUY take-profit {tp} must be above current price {price}");
                    }
                }
            }
            Side::Sell => {
                if let Some(sl) = sl {
                    if sl <= price {
                        anyhow::bail!("SELL stop-loss {sl} must be above current price {price}");
                    }
                }
                if let Some(tp) = tp {
                    if tp >= price {
                        anyhow::bail!("SELL take-profit {tp} must be below current price {price}");
                    }
                }
            }
        }

        pos.sl = sl;
        pos.tp = tp;
        Ok(pos.clone())
    }

    // -------------------------------------------------------------------------
    // Marking
    // -------------------------------------------------------------------------

    /// Reprice every open position in `symbol` and recompute derived account
    /// state.
    pub fn mark(&mut self, symbol: &str, bid: f64, ask: f64) {
        for pos in self.open.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = match pos.side {
                Side::Buy => bid,
                Side::Sell => ask,
            };
            pos.unrealized_pnl = (pos.current_price - pos.open_price)
                * pos.volume
                * pos.contract_size
                * pos.side.direction();
        }
        self.recompute();
    }

    /// Evaluate SL/TP triggers for `symbol` at the given top of book,
    /// closing triggered positions at the triggering price.
    pub fn check_triggers(
        &mut self,
        symbol: &str,
        bid: f64,
        ask: f64,
        ids: &IdGen,
    ) -> Vec<Trade> {
        let mut trades = Vec::new();
        loop {
            let hit = self.open.iter().position(|p| {
                if p.symbol != symbol {
                    return false;
                }
                match p.side {
                    Side::Buy => {
                        p.sl.is_some_and(|sl| bid <= sl) || p.tp.is_some_and(|tp| bid >= tp)
                    }
                    Side::Sell => {
                        p.sl.is_some_and(|sl| ask >= sl) || p.tp.is_some_and(|tp| ask <= tp)
                    }
                }
            });
            let Some(idx) = hit else { break };

            let pos = &self.open[idx];
            let (price, reason) = match pos.side {
                Side::Buy => {
                    if pos.sl.is_some_and(|sl| bid <= sl) {
                        (bid, CloseReason::StopLoss)
                    } else {
                        (bid, CloseReason::TakeProfit)
                    }
                }
                Side::Sell => {
                    if pos.sl.is_some_and(|sl| ask >= sl) {
                        (ask, CloseReason::StopLoss)
                    } else {
                        (ask, CloseReason::TakeProfit)
                    }
                }
            };
            let volume = pos.volume;
            trades.push(self.close_at(idx, volume, price, reason, Utc::now(), ids));
        }
        if !trades.is_empty() {
            self.recompute();
        }
        trades
    }

    // -------------------------------------------------------------------------
    // Derived state
    // -------------------------------------------------------------------------

    /// Recompute equity, margin used, free margin, and margin level.
    ///
    /// A non-finite or negative margin result freezes the account.
    pub fn recompute(&mut self) {
        let unrealized: f64 = self.open.iter().map(|p| p.unrealized_pnl).sum();
        let margin_used: f64 = self
            .open
            .iter()
            .map(|p| p.margin(self.account.leverage))
            .sum();

        let equity = self.account.cash() + unrealized;
        if !equity.is_finite() || !margin_used.is_finite() || margin_used < 0.0 {
            warn!(
                account_id = self.account.id,
                equity, margin_used, "margin recomputation produced invalid state, freezing account"
            );
            self.account.frozen = true;
            return;
        }

        self.account.equity = equity;
        self.account.margin_used = margin_used;
        self.account.free_margin = equity - margin_used;
        self.account.margin_level = if margin_used == 0.0 {
            f64::INFINITY
        } else {
            equity / margin_used * 100.0
        };
    }

    /// Force-close positions in descending order of loss until the margin
    /// level recovers above `stop_out_level`. Strict less-than: a level at
    /// exactly the threshold is left alone.
    pub fn stop_out(&mut self, stop_out_level: f64, ids: &IdGen) -> Option<LiquidationEvent> {
        if self.open.is_empty() || self.account.margin_level >= stop_out_level {
            return None;
        }

        let before = self.account.margin_level;
        let mut closed_ids = Vec::new();

        while self.account.margin_level < stop_out_level && !self.open.is_empty() {
            // Worst unrealized loss first.
            let idx = self
                .open
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.unrealized_pnl
                        .partial_cmp(&b.unrealized_pnl)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .expect("open positions non-empty");

            let pos = &self.open[idx];
            let price = pos.current_price;
            let volume = pos.volume;
            let id = pos.id;
            self.close_at(idx, volume, price, CloseReason::StopOut, Utc::now(), ids);
            closed_ids.push(id);
            self.recompute();
        }

        let event = LiquidationEvent {
            account_id: self.account.id,
            closed_position_ids: closed_ids,
            margin_level_before: before,
            margin_level_after: self.account.margin_level,
            at: Utc::now(),
        };
        warn!(
            account_id = event.account_id,
            closed = event.closed_position_ids.len(),
            margin_level_before = before,
            margin_level_after = event.margin_level_after,
            "stop-out liquidation"
        );
        Some(event)
    }
}
