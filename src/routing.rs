// =============================================================================
// Routing Engine — priority-ordered A/B/C-book rule evaluation
// =============================================================================
//
// Rules live behind an `ArcSwap`: `route` reads a stable snapshot with no
// lock while admin mutations publish a new sorted vector atomically.
// Evaluation is deterministic and side-effect-free apart from appending the
// decision to a bounded in-memory history ring used by the analytics surface.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{BookAction, Classification, Side};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn default_max_toxicity() -> f64 {
    100.0
}

/// Filter clauses of a routing rule. An empty list or zero-valued bound is a
/// wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default)]
    pub account_ids: Vec<u64>,
    #[serde(default)]
    pub user_groups: Vec<String>,
    /// Symbol names; `*` matches everything.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Zero means unbounded.
    #[serde(default)]
    pub min_volume: f64,
    /// Zero means unbounded.
    #[serde(default)]
    pub max_volume: f64,
    #[serde(default)]
    pub min_toxicity: f64,
    #[serde(default = "default_max_toxicity")]
    pub max_toxicity: f64,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

impl Default for RuleFilter {
    fn default() -> Self {
        Self {
            account_ids: Vec::new(),
            user_groups: Vec::new(),
            symbols: Vec::new(),
            min_volume: 0.0,
            max_volume: 0.0,
            min_toxicity: 0.0,
            max_toxicity: default_max_toxicity(),
            classifications: Vec::new(),
        }
    }
}

impl RuleFilter {
    fn matches(&self, ctx: &RouteContext) -> bool {
        if !self.account_ids.is_empty() && !self.account_ids.contains(&ctx.account_id) {
            return false;
        }
        if !self.user_groups.is_empty() && !self.user_groups.contains(&ctx.group) {
            return false;
        }
        if !self.symbols.is_empty()
            && !self
                .symbols
                .iter()
                .any(|s| s == "*" || s == &ctx.symbol)
        {
            return false;
        }
        if self.min_volume > 0.0 && ctx.volume < self.min_volume {
            return false;
        }
        if self.max_volume > 0.0 && ctx.volume > self.max_volume {
            return false;
        }
        if ctx.toxicity_score < self.min_toxicity || ctx.toxicity_score > self.max_toxicity {
            return false;
        }
        if !self.classifications.is_empty()
            && !self.classifications.contains(&ctx.classification)
        {
            return false;
        }
        true
    }
}

/// One priority-ordered routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: u64,
    pub priority: i32,
    #[serde(default)]
    pub filter: RuleFilter,
    pub action: BookAction,
    #[serde(default)]
    pub target_lp: Option<String>,
    /// Percentage hedged externally for PARTIAL_HEDGE.
    #[serde(default)]
    pub hedge_percent: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tie-break for equal priorities; assigned on insert.
    #[serde(default)]
    pub insertion_seq: u64,
}

fn default_enabled() -> bool {
    true
}

/// A detected overlap between two rules with diverging outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct RuleConflict {
    pub rule_id: u64,
    pub other_rule_id: u64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Inputs to one routing evaluation.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub account_id: u64,
    pub group: String,
    pub classification: Classification,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub toxicity_score: f64,
    pub exposure_risk: f64,
}

/// Record of a rule-engine evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub order_ref: Option<u64>,
    pub symbol: String,
    pub action: BookAction,
    pub target_lp: Option<String>,
    pub a_book_percent: f64,
    pub b_book_percent: f64,
    pub reason: String,
    pub rule_id: Option<u64>,
    pub toxicity_score: f64,
    pub exposure_risk: f64,
    pub decision_ts: DateTime<Utc>,
}

/// Aggregate view over the decision history for the analytics surface.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingBreakdown {
    pub total: usize,
    pub a_book_pct: f64,
    pub b_book_pct: f64,
    pub partial_hedge_pct: f64,
    pub reject_pct: f64,
    pub per_symbol: std::collections::HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RoutingEngine {
    rules: ArcSwap<Vec<RoutingRule>>,
    history: RwLock<VecDeque<RoutingDecision>>,
    history_cap: usize,
    default_action: BookAction,
    insertion_counter: AtomicU64,
    rule_id_counter: AtomicU64,
}

impl RoutingEngine {
    pub fn new(default_action: BookAction, history_cap: usize) -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(128)),
            history_cap,
            default_action,
            insertion_counter: AtomicU64::new(0),
            rule_id_counter: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate the rule list against one order. `lp_healthy` gates A-book
    /// targets: a matched rule whose target LP is down turns into a REJECT
    /// with an "LP unavailable" reason rather than silently internalizing.
    pub fn route(
        &self,
        ctx: &RouteContext,
        order_ref: Option<u64>,
        lp_healthy: impl Fn(&str) -> bool,
    ) -> RoutingDecision {
        let rules = self.rules.load();
        let matched = rules
            .iter()
            .filter(|r| r.enabled)
            .find(|r| r.filter.matches(ctx));

        let decision = match matched {
            Some(rule) => self.decision_from_rule(rule, ctx, order_ref, &lp_healthy),
            None => self.default_decision(ctx, order_ref),
        };

        debug!(
            symbol = %decision.symbol,
            action = %decision.action,
            rule_id = ?decision.rule_id,
            reason = %decision.reason,
            "order routed"
        );
        self.push_history(decision.clone());
        decision
    }

    fn decision_from_rule(
        &self,
        rule: &RoutingRule,
        ctx: &RouteContext,
        order_ref: Option<u64>,
        lp_healthy: &impl Fn(&str) -> bool,
    ) -> RoutingDecision {
        let needs_lp = matches!(rule.action, BookAction::ABook | BookAction::PartialHedge);
        if needs_lp {
            let lp_down = rule
                .target_lp
                .as_deref()
                .map(|lp| !lp_healthy(lp))
                .unwrap_or(true);
            if lp_down {
                return RoutingDecision {
                    order_ref,
                    symbol: ctx.symbol.clone(),
                    action: BookAction::Reject,
                    target_lp: rule.target_lp.clone(),
                    a_book_percent: 0.0,
                    b_book_percent: 0.0,
                    reason: format!(
                        "LP unavailable for rule {} ({})",
                        rule.id,
                        rule.target_lp.as_deref().unwrap_or("unset")
                    ),
                    rule_id: Some(rule.id),
                    toxicity_score: ctx.toxicity_score,
                    exposure_risk: ctx.exposure_risk,
                    decision_ts: Utc::now(),
                };
            }
        }

        let (a_pct, b_pct) = match rule.action {
            BookAction::ABook => (100.0, 0.0),
            BookAction::BBook => (0.0, 100.0),
            BookAction::PartialHedge => {
                let hedge = rule.hedge_percent.unwrap_or(50.0).clamp(0.0, 100.0);
                (hedge, 100.0 - hedge)
            }
            BookAction::Reject => (0.0, 0.0),
        };

        RoutingDecision {
            order_ref,
            symbol: ctx.symbol.clone(),
            action: rule.action,
            target_lp: rule.target_lp.clone(),
            a_book_percent: a_pct,
            b_book_percent: b_pct,
            reason: format!("rule {} (priority {})", rule.id, rule.priority),
            rule_id: Some(rule.id),
            toxicity_score: ctx.toxicity_score,
            exposure_risk: ctx.exposure_risk,
            decision_ts: Utc::now(),
        }
    }

    fn default_decision(&self, ctx: &RouteContext, order_ref: Option<u64>) -> RoutingDecision {
        let (a_pct, b_pct) = match self.default_action {
            BookAction::ABook => (100.0, 0.0),
            _ => (0.0, 100.0),
        };
        RoutingDecision {
            order_ref,
            symbol: ctx.symbol.clone(),
            action: self.default_action,
            target_lp: None,
            a_book_percent: a_pct,
            b_book_percent: b_pct,
            reason: "no rule matched, default route".to_string(),
            rule_id: None,
            toxicity_score: ctx.toxicity_score,
            exposure_risk: ctx.exposure_risk,
            decision_ts: Utc::now(),
        }
    }

    fn push_history(&self, decision: RoutingDecision) {
        let mut history = self.history.write();
        history.push_back(decision);
        while history.len() > self.history_cap {
            history.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Admin surface
    // -------------------------------------------------------------------------

    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.load().as_ref().clone()
    }

    /// Insert or replace a rule and publish a new snapshot. Returns the
    /// conflict set so the admin surface can warn; the write always lands
    /// (the admin may be overriding deliberately).
    pub fn upsert_rule(&self, mut rule: RoutingRule) -> Vec<RuleConflict> {
        if rule.id == 0 {
            rule.id = self.rule_id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        rule.insertion_seq = self.insertion_counter.fetch_add(1, Ordering::Relaxed) + 1;

        let conflicts = self.detect_conflicts(&rule);

        let current = self.rules.load_full();
        let mut next: Vec<RoutingRule> =
            current.iter().filter(|r| r.id != rule.id).cloned().collect();
        next.push(rule.clone());
        // Descending priority; ties broken by insertion order.
        next.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.insertion_seq.cmp(&b.insertion_seq))
        });
        self.rules.store(Arc::new(next));

        info!(rule_id = rule.id, priority = rule.priority, action = %rule.action, "routing rule published");
        conflicts
    }

    pub fn delete_rule(&self, rule_id: u64) -> bool {
        let current = self.rules.load_full();
        if !current.iter().any(|r| r.id == rule_id) {
            return false;
        }
        let next: Vec<RoutingRule> = current
            .iter()
            .filter(|r| r.id != rule_id)
            .cloned()
            .collect();
        self.rules.store(Arc::new(next));
        true
    }

    /// Two rules conflict iff their filters overlap on every dimension and
    /// their outcomes differ.
    pub fn detect_conflicts(&self, candidate: &RoutingRule) -> Vec<RuleConflict> {
        let rules = self.rules.load();
        rules
            .iter()
            .filter(|other| other.id != candidate.id)
            .filter(|other| filters_overlap(&candidate.filter, &other.filter))
            .filter_map(|other| {
                let differs = other.action != candidate.action
                    || (candidate.action == BookAction::ABook
                        && other.target_lp != candidate.target_lp);
                differs.then(|| RuleConflict {
                    rule_id: candidate.id,
                    other_rule_id: other.id,
                    reason: format!(
                        "overlapping filters with diverging outcome ({} vs {})",
                        candidate.action, other.action
                    ),
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Analytics surface
    // -------------------------------------------------------------------------

    pub fn recent_decisions(&self, count: usize) -> Vec<RoutingDecision> {
        let history = self.history.read();
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn breakdown(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> RoutingBreakdown {
        let history = self.history.read();
        let in_window = |d: &&RoutingDecision| {
            start.map_or(true, |s| d.decision_ts >= s) && end.map_or(true, |e| d.decision_ts <= e)
        };

        let mut total = 0usize;
        let mut counts = [0usize; 4];
        let mut per_symbol = std::collections::HashMap::new();
        for decision in history.iter().filter(in_window) {
            total += 1;
            let slot = match decision.action {
                BookAction::ABook => 0,
                BookAction::BBook => 1,
                BookAction::PartialHedge => 2,
                BookAction::Reject => 3,
            };
            counts[slot] += 1;
            *per_symbol.entry(decision.symbol.clone()).or_insert(0) += 1;
        }

        let pct = |n: usize| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64 * 100.0
            }
        };
        RoutingBreakdown {
            total,
            a_book_pct: pct(counts[0]),
            b_book_pct: pct(counts[1]),
            partial_hedge_pct: pct(counts[2]),
            reject_pct: pct(counts[3]),
            per_symbol,
        }
    }
}

// ---------------------------------------------------------------------------
// Filter overlap (conflict detection)
// ---------------------------------------------------------------------------

fn lists_overlap<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.is_empty() || b.is_empty() || a.iter().any(|x| b.contains(x))
}

fn symbols_overlap(a: &[String], b: &[String]) -> bool {
    a.is_empty()
        || b.is_empty()
        || a.iter().any(|s| s == "*")
        || b.iter().any(|s| s == "*")
        || a.iter().any(|s| b.contains(s))
}

fn ranges_overlap(min_a: f64, max_a: f64, min_b: f64, max_b: f64) -> bool {
    // Zero max means unbounded above.
    let hi_a = if max_a > 0.0 { max_a } else { f64::INFINITY };
    let hi_b = if max_b > 0.0 { max_b } else { f64::INFINITY };
    min_a <= hi_b && min_b <= hi_a
}

fn filters_overlap(a: &RuleFilter, b: &RuleFilter) -> bool {
    lists_overlap(&a.account_ids, &b.account_ids)
        && lists_overlap(&a.user_groups, &b.user_groups)
        && symbols_overlap(&a.symbols, &b.symbols)
        && ranges_overlap(a.min_volume, a.max_volume, b.min_volume, b.max_volume)
        && ranges_overlap(a.min_toxicity, a.max_toxicity, b.min_toxicity, b.max_toxicity)
        && lists_overlap(&a.classifications, &b.classifications)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(volume: f64) -> RouteContext {
        RouteContext {
            account_id: 1,
            group: "retail".into(),
            classification: Classification::Normal,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume,
            toxicity_score: 10.0,
            exposure_risk: 5.0,
        }
    }

    fn abook_rule(id: u64, priority: i32, min_volume: f64) -> RoutingRule {
        RoutingRule {
            id,
            priority,
            filter: RuleFilter {
                symbols: vec!["EURUSD".into()],
                min_volume,
                ..Default::default()
            },
            action: BookAction::ABook,
            target_lp: Some("OANDA".into()),
            hedge_percent: None,
            enabled: true,
            insertion_seq: 0,
        }
    }

    #[test]
    fn large_order_routes_to_lp_small_falls_through() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        engine.upsert_rule(abook_rule(1, 100, 5.0));

        let big = engine.route(&ctx(10.0), None, |_| true);
        assert_eq!(big.action, BookAction::ABook);
        assert_eq!(big.target_lp.as_deref(), Some("OANDA"));
        assert_eq!(big.a_book_percent, 100.0);

        let small = engine.route(&ctx(3.0), None, |_| true);
        assert_eq!(small.action, BookAction::BBook);
        assert!(small.rule_id.is_none());
    }

    #[test]
    fn highest_priority_wins_then_insertion_order() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut low = abook_rule(1, 10, 0.0);
        low.action = BookAction::BBook;
        low.target_lp = None;
        engine.upsert_rule(low);
        engine.upsert_rule(abook_rule(2, 100, 0.0));

        let decision = engine.route(&ctx(1.0), None, |_| true);
        assert_eq!(decision.rule_id, Some(2));

        // Equal priority: first inserted wins.
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        engine.upsert_rule(abook_rule(7, 50, 0.0));
        let mut second = abook_rule(8, 50, 0.0);
        second.action = BookAction::BBook;
        second.target_lp = None;
        engine.upsert_rule(second);
        let decision = engine.route(&ctx(1.0), None, |_| true);
        assert_eq!(decision.rule_id, Some(7));
    }

    #[test]
    fn wildcard_symbol_matches_everything() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut rule = abook_rule(1, 10, 0.0);
        rule.filter.symbols = vec!["*".into()];
        engine.upsert_rule(rule);

        let mut other = ctx(1.0);
        other.symbol = "XAUUSD".into();
        let decision = engine.route(&other, None, |_| true);
        assert_eq!(decision.action, BookAction::ABook);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut rule = abook_rule(1, 100, 0.0);
        rule.enabled = false;
        engine.upsert_rule(rule);

        let decision = engine.route(&ctx(1.0), None, |_| true);
        assert_eq!(decision.action, BookAction::BBook);
    }

    #[test]
    fn partial_hedge_splits_percentages() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut rule = abook_rule(1, 100, 0.0);
        rule.action = BookAction::PartialHedge;
        rule.hedge_percent = Some(60.0);
        engine.upsert_rule(rule);

        let decision = engine.route(&ctx(1.0), None, |_| true);
        assert_eq!(decision.action, BookAction::PartialHedge);
        assert_eq!(decision.a_book_percent, 60.0);
        assert_eq!(decision.b_book_percent, 40.0);
    }

    #[test]
    fn unhealthy_target_lp_rejects() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        engine.upsert_rule(abook_rule(1, 100, 0.0));

        let decision = engine.route(&ctx(1.0), None, |_| false);
        assert_eq!(decision.action, BookAction::Reject);
        assert!(decision.reason.contains("LP unavailable"));
    }

    #[test]
    fn routing_is_deterministic() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        engine.upsert_rule(abook_rule(1, 100, 5.0));

        let first = engine.route(&ctx(10.0), None, |_| true);
        let second = engine.route(&ctx(10.0), None, |_| true);
        assert_eq!(first.action, second.action);
        assert_eq!(first.rule_id, second.rule_id);
        assert_eq!(first.target_lp, second.target_lp);
    }

    #[test]
    fn toxicity_bounds_filter() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut rule = abook_rule(1, 100, 0.0);
        rule.filter.min_toxicity = 60.0;
        engine.upsert_rule(rule);

        // Score 10 misses the [60, 100] band.
        let decision = engine.route(&ctx(1.0), None, |_| true);
        assert_eq!(decision.action, BookAction::BBook);

        let mut toxic = ctx(1.0);
        toxic.toxicity_score = 80.0;
        let decision = engine.route(&toxic, None, |_| true);
        assert_eq!(decision.action, BookAction::ABook);
    }

    #[test]
    fn conflicting_rules_are_reported_but_still_written() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        engine.upsert_rule(abook_rule(1, 100, 0.0));

        let mut conflicting = abook_rule(2, 90, 0.0);
        conflicting.action = BookAction::BBook;
        conflicting.target_lp = None;
        let conflicts = engine.upsert_rule(conflicting);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].other_rule_id, 1);
        assert_eq!(engine.rules().len(), 2);
    }

    #[test]
    fn disjoint_volume_bands_do_not_conflict() {
        let engine = RoutingEngine::new(BookAction::BBook, 100);
        let mut small = abook_rule(1, 100, 0.0);
        small.filter.max_volume = 5.0;
        small.action = BookAction::BBook;
        small.target_lp = None;
        engine.upsert_rule(small);

        let big = abook_rule(2, 90, 10.0);
        let conflicts = engine.upsert_rule(big);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn history_ring_is_bounded_and_breakdown_adds_up() {
        let engine = RoutingEngine::new(BookAction::BBook, 5);
        for _ in 0..8 {
            engine.route(&ctx(1.0), None, |_| true);
        }
        assert_eq!(engine.recent_decisions(100).len(), 5);

        let breakdown = engine.breakdown(None, None);
        assert_eq!(breakdown.total, 5);
        assert_eq!(breakdown.b_book_pct, 100.0);
        assert_eq!(breakdown.per_symbol.get("EURUSD"), Some(&5));
    }
}
