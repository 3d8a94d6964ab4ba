// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for BUY, -1.0 for SELL. Used in P&L and exposure math.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("unknown side: {other}"),
        }
    }
}

/// Order type. The core executes MARKET immediately; LIMIT and STOP are
/// validated and rejected if the trigger semantics cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Canceled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Filled => write!(f, "FILLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Margin accounting mode of an account.
///
/// Hedging keeps every fill as its own position; netting folds same-symbol
/// fills into one net position per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Hedging,
    Netting,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Hedging
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hedging => write!(f, "HEDGING"),
            Self::Netting => write!(f, "NETTING"),
        }
    }
}

/// Where a routed order ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookAction {
    #[serde(rename = "ABOOK")]
    ABook,
    #[serde(rename = "BBOOK")]
    BBook,
    #[serde(rename = "PARTIAL_HEDGE")]
    PartialHedge,
    #[serde(rename = "REJECT")]
    Reject,
}

impl std::fmt::Display for BookAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ABook => write!(f, "ABOOK"),
            Self::BBook => write!(f, "BBOOK"),
            Self::PartialHedge => write!(f, "PARTIAL_HEDGE"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Account classification derived from toxicity and admin tags. Routing rule
/// filters match against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Normal,
    Toxic,
    Vip,
}

impl Default for Classification {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Toxic => write!(f, "TOXIC"),
            Self::Vip => write!(f, "VIP"),
        }
    }
}

/// Role attached to an authenticated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_signs() {
        assert_eq!(Side::Buy.direction(), 1.0);
        assert_eq!(Side::Sell.direction(), -1.0);
    }

    #[test]
    fn side_parses_case_insensitive() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn book_action_wire_format() {
        let json = serde_json::to_string(&BookAction::PartialHedge).unwrap();
        assert_eq!(json, "\"PARTIAL_HEDGE\"");
    }
}
