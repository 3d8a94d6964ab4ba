// =============================================================================
// Accounts — balance, credit, and per-mark derived margin state
// =============================================================================
//
// `balance` and `credit` are client-visible accounting figures and stay in
// decimal; they only move on realization (close, commission, swap).  The
// derived fields (`equity`, `margin_used`, `free_margin`, `margin_level`) are
// recomputed from open positions on every mark and live in f64, which is
// acceptable for the mark-to-market path.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::AccountConfig;
use crate::types::{Classification, MarginMode};

/// One trading account.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: u64,
    pub user_id: u64,
    pub group: String,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub classification: Classification,
    pub balance: Decimal,
    pub credit: Decimal,
    /// Set when margin recomputation produced a non-finite result; no further
    /// executions are accepted until manually cleared.
    pub frozen: bool,

    // --- Derived, updated on every mark -------------------------------------
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    /// Percent; `f64::INFINITY` when no margin is in use.
    pub margin_level: f64,
}

impl Account {
    pub fn from_config(cfg: &AccountConfig) -> Self {
        let balance = Decimal::from_f64_retain(cfg.balance).unwrap_or_default();
        let credit = Decimal::from_f64_retain(cfg.credit).unwrap_or_default();
        let equity = (balance + credit).to_f64().unwrap_or(0.0);
        Self {
            id: cfg.id,
            user_id: cfg.user_id,
            group: cfg.group.clone(),
            leverage: cfg.leverage.max(1),
            margin_mode: cfg.margin_mode,
            classification: cfg.classification,
            balance,
            credit,
            frozen: false,
            equity,
            margin_used: 0.0,
            free_margin: equity,
            margin_level: f64::INFINITY,
        }
    }

    /// Cash component of equity as f64 (balance + credit).
    pub fn cash(&self) -> f64 {
        (self.balance + self.credit).to_f64().unwrap_or(0.0)
    }

    /// Fold realized P&L into the balance.
    pub fn realize(&mut self, pnl: Decimal) {
        self.balance += pnl;
    }

    /// Deduct a commission charge from the balance.
    pub fn charge_commission(&mut self, commission: Decimal) {
        self.balance -= commission;
    }

    /// Apply an accrued swap adjustment to the balance.
    pub fn apply_swap(&mut self, swap: Decimal) {
        self.balance += swap;
    }
}

/// Margin consumed by one open position.
///
/// `margin_percent` is a percentage of notional (1.0 = 1 %), divided by the
/// account leverage.
pub fn position_margin(
    volume: f64,
    contract_size: f64,
    open_price: f64,
    margin_percent: f64,
    leverage: u32,
) -> f64 {
    volume * contract_size * open_price * (margin_percent / 100.0) / leverage.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AccountConfig {
        AccountConfig {
            id: 1,
            user_id: 10,
            group: "retail".into(),
            leverage: 100,
            margin_mode: MarginMode::Hedging,
            balance: 10_000.0,
            credit: 500.0,
            classification: Classification::Normal,
        }
    }

    #[test]
    fn from_config_seeds_derived_fields() {
        let account = Account::from_config(&config());
        assert_eq!(account.cash(), 10_500.0);
        assert_eq!(account.equity, 10_500.0);
        assert_eq!(account.margin_used, 0.0);
        assert!(account.margin_level.is_infinite());
    }

    #[test]
    fn realize_and_commission_move_the_balance() {
        let mut account = Account::from_config(&config());
        account.realize(Decimal::new(9800, 2)); // +98.00
        account.charge_commission(Decimal::new(700, 2)); // -7.00
        assert_eq!(account.balance, Decimal::new(10_091_00, 2));
    }

    #[test]
    fn margin_formula() {
        // 1 lot EURUSD at 1.10, contract 100k, 1% margin, 1:100 leverage.
        let margin = position_margin(1.0, 100_000.0, 1.10, 1.0, 100);
        assert!((margin - 11.0).abs() < 1e-9);
    }
}
