// =============================================================================
// Exposure — per-symbol net position view derived on demand
// =============================================================================

use serde::Serialize;

/// Net broker exposure in one symbol, in lots.
#[derive(Debug, Clone, Serialize)]
pub struct ExposureSnapshot {
    pub symbol: String,
    pub net_exposure: f64,
    pub long_exposure: f64,
    pub short_exposure: f64,
    pub utilization_pct: f64,
    pub limit: f64,
}

impl ExposureSnapshot {
    pub fn new(symbol: &str, long: f64, short: f64, limit: f64) -> Self {
        let net = long - short;
        let utilization = if limit > 0.0 {
            net.abs() / limit * 100.0
        } else {
            0.0
        };
        Self {
            symbol: symbol.to_string(),
            net_exposure: net,
            long_exposure: long,
            short_exposure: short,
            utilization_pct: utilization,
            limit,
        }
    }

    /// Utilization if a signed order volume were added to the book.
    /// The routing engine feeds this in as `exposure_risk`.
    pub fn projected_utilization_pct(&self, signed_volume: f64) -> f64 {
        if self.limit <= 0.0 {
            return 0.0;
        }
        ((self.net_exposure + signed_volume).abs() / self.limit * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_and_utilization() {
        let exp = ExposureSnapshot::new("EURUSD", 30.0, 10.0, 100.0);
        assert_eq!(exp.net_exposure, 20.0);
        assert_eq!(exp.utilization_pct, 20.0);
    }

    #[test]
    fn projection_clamps_at_hundred() {
        let exp = ExposureSnapshot::new("EURUSD", 90.0, 0.0, 100.0);
        assert_eq!(exp.projected_utilization_pct(50.0), 100.0);
        assert!((exp.projected_utilization_pct(-30.0) - 60.0).abs() < 1e-9);
    }
}
