// =============================================================================
// Toxicity Scoring — pluggable input to the routing engine
// =============================================================================
//
// The score is a rolling measure of how adversely an account's fills move
// shortly after execution (higher = more likely to move against the broker).
// The update function is deliberately behind a trait: the engine only ever
// *reads* scores, and whatever collaborator watches post-fill marks feeds
// observations in.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// Read side consumed by the execution dispatcher.
pub trait ToxicityScorer: Send + Sync {
    /// Rolling toxicity in [0, 100] for an account. Unknown accounts score 0.
    fn score(&self, account_id: u64) -> f64;
}

/// Default scorer: fraction of recent fills that were favourable to the
/// client shortly after execution, over a bounded window.
pub struct RollingToxicityScorer {
    window: usize,
    observations: Mutex<HashMap<u64, VecDeque<bool>>>,
}

impl RollingToxicityScorer {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            observations: Mutex::new(HashMap::new()),
        }
    }

    /// Record whether a fill had moved in the client's favour at the
    /// observation horizon.
    pub fn observe(&self, account_id: u64, favourable: bool) {
        let mut observations = self.observations.lock();
        let ring = observations.entry(account_id).or_default();
        ring.push_back(favourable);
        while ring.len() > self.window {
            ring.pop_front();
        }
    }
}

impl Default for RollingToxicityScorer {
    fn default() -> Self {
        Self::new(50)
    }
}

impl ToxicityScorer for RollingToxicityScorer {
    fn score(&self, account_id: u64) -> f64 {
        let observations = self.observations.lock();
        match observations.get(&account_id) {
            Some(ring) if !ring.is_empty() => {
                let favourable = ring.iter().filter(|&&f| f).count();
                favourable as f64 / ring.len() as f64 * 100.0
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_account_scores_zero() {
        let scorer = RollingToxicityScorer::default();
        assert_eq!(scorer.score(42), 0.0);
    }

    #[test]
    fn score_is_favourable_fraction() {
        let scorer = RollingToxicityScorer::new(10);
        for favourable in [true, true, true, false] {
            scorer.observe(1, favourable);
        }
        assert!((scorer.score(1) - 75.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_bounded() {
        let scorer = RollingToxicityScorer::new(4);
        for _ in 0..4 {
            scorer.observe(1, false);
        }
        assert_eq!(scorer.score(1), 0.0);
        // Four favourable observations push the unfavourable ones out.
        for _ in 0..4 {
            scorer.observe(1, true);
        }
        assert_eq!(scorer.score(1), 100.0);
    }
}
