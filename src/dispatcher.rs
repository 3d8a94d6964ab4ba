// =============================================================================
// Execution Dispatcher — validate, route, and fill client orders
// =============================================================================
//
// The order path: validate against the symbol registry and the account's
// margin headroom, consult the routing engine, then branch:
//
//   ABOOK          place with the target LP (deadline-bounded), book the fill
//   BBOOK          synthesize an internal fill at top of book immediately
//   PARTIAL_HEDGE  split by hedge percent: LP leg + internal leg, one order
//   REJECT         order rejected with the rule's reason
//
// Client-provided order ids deduplicate retries inside a bounded window.
// Every terminal order is broadcast to the account's subscribers via the hub.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::hub::QuoteHub;
use crate::ledger::{Fill, FillSource, Ledger};
use crate::lp::{LpManager, LpOrderRequest, LpOrderStatus};
use crate::market_data::TickStore;
use crate::routing::{RouteContext, RoutingDecision, RoutingEngine};
use crate::symbols::SymbolRegistry;
use crate::toxicity::ToxicityScorer;
use crate::types::{OrderStatus, OrderType, Side};

/// Orders retained in memory for dedup replies and queries.
const MAX_RECENT_ORDERS: usize = 1_000;

// ---------------------------------------------------------------------------
// Requests, orders, errors
// ---------------------------------------------------------------------------

/// An incoming client order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: Option<String>,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
}

/// The order record produced by dispatch. A partial hedge carries both fills
/// under one record.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: u64,
    pub client_order_id: Option<String>,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub routing: RoutingDecision,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub fills: Vec<Fill>,
    pub position_ids: Vec<u64>,
    pub created_ts: DateTime<Utc>,
    pub executed_ts: Option<DateTime<Utc>>,
}

/// Client-fault failures, surfaced with a stable code and never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    UnknownAccount(u64),
    AccountFrozen(u64),
    UnknownSymbol(String),
    SymbolDisabled(String),
    InvalidVolume { volume: f64, min_lot: f64 },
    InvalidStops(String),
    InsufficientMargin { required: f64, free: f64 },
    NoMarketPrice(String),
    UnsupportedOrderType(OrderType),
}

impl OrderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAccount(_) => "unknown_account",
            Self::AccountFrozen(_) => "account_frozen",
            Self::UnknownSymbol(_) => "unknown_symbol",
            Self::SymbolDisabled(_) => "symbol_disabled",
            Self::InvalidVolume { .. } => "invalid_volume",
            Self::InvalidStops(_) => "invalid_stops",
            Self::InsufficientMargin { .. } => "insufficient_margin",
            Self::NoMarketPrice(_) => "no_market_price",
            Self::UnsupportedOrderType(_) => "unsupported_order_type",
        }
    }
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAccount(id) => write!(f, "account {id} not found"),
            Self::AccountFrozen(id) => write!(f, "account {id} is frozen"),
            Self::UnknownSymbol(s) => write!(f, "unknown symbol {s}"),
            Self::SymbolDisabled(s) => write!(f, "symbol {s} is disabled"),
            Self::InvalidVolume { volume, min_lot } => {
                write!(f, "volume {volume} below minimum lot {min_lot}")
            }
            Self::InvalidStops(reason) => write!(f, "invalid SL/TP: {reason}"),
            Self::InsufficientMargin { required, free } => {
                write!(f, "insufficient margin: required {required:.2}, free {free:.2}")
            }
            Self::NoMarketPrice(s) => write!(f, "no market price for {s}"),
            Self::UnsupportedOrderType(t) => write!(f, "unsupported order type {t}"),
        }
    }
}

impl std::error::Error for OrderError {}

struct DedupEntry {
    order_id: u64,
    at: Instant,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ExecutionDispatcher {
    ledger: Arc<Ledger>,
    router: Arc<RoutingEngine>,
    lps: Arc<LpManager>,
    ticks: Arc<TickStore>,
    hub: Arc<QuoteHub>,
    symbols: Arc<SymbolRegistry>,
    toxicity: Arc<dyn ToxicityScorer>,
    order_ids: AtomicU64,
    dedup: Mutex<HashMap<String, DedupEntry>>,
    recent_orders: RwLock<VecDeque<Order>>,
    lp_timeout: Duration,
    dedup_window: Duration,
}

impl ExecutionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        router: Arc<RoutingEngine>,
        lps: Arc<LpManager>,
        ticks: Arc<TickStore>,
        hub: Arc<QuoteHub>,
        symbols: Arc<SymbolRegistry>,
        toxicity: Arc<dyn ToxicityScorer>,
        lp_timeout: Duration,
        dedup_window: Duration,
    ) -> Self {
        Self {
            ledger,
            router,
            lps,
            ticks,
            hub,
            symbols,
            toxicity,
            order_ids: AtomicU64::new(0),
            dedup: Mutex::new(HashMap::new()),
            recent_orders: RwLock::new(VecDeque::with_capacity(128)),
            lp_timeout,
            dedup_window,
        }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Execute one client order end to end. Validation failures are errors;
    /// routing rejects and LP failures come back as REJECTED/CANCELED orders.
    pub async fn execute(&self, request: OrderRequest) -> Result<Order, OrderError> {
        // Retries inside the dedup window return the original outcome.
        if let Some(existing) = self.dedup_lookup(&request) {
            info!(
                order_id = existing.id,
                client_order_id = ?request.client_order_id,
                "duplicate order suppressed"
            );
            return Ok(existing);
        }

        let (spec, bid, ask) = self.validate(&request)?;

        let decision = self.route(&request, &spec);
        let order_id = self.order_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let mut order = Order {
            id: order_id,
            client_order_id: request.client_order_id.clone(),
            account_id: request.account_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            volume: request.volume,
            price: request.price,
            sl: request.sl,
            tp: request.tp,
            routing: decision.clone(),
            status: OrderStatus::Pending,
            reject_reason: None,
            fills: Vec::new(),
            position_ids: Vec::new(),
            created_ts: Utc::now(),
            executed_ts: None,
        };

        match decision.action {
            crate::types::BookAction::Reject => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(decision.reason.clone());
            }
            crate::types::BookAction::BBook => {
                self.fill_internal(&mut order, &spec, request.volume, bid, ask);
            }
            crate::types::BookAction::ABook => {
                self.fill_via_lp(&mut order, &spec, request.volume, &decision)
                    .await;
            }
            crate::types::BookAction::PartialHedge => {
                let hedge_volume = request.volume * decision.a_book_percent / 100.0;
                let internal_volume = request.volume - hedge_volume;

                self.fill_via_lp(&mut order, &spec, hedge_volume, &decision)
                    .await;
                // The internal leg only books if the LP leg succeeded.
                if order.status == OrderStatus::Pending && internal_volume > 0.0 {
                    self.fill_internal(&mut order, &spec, internal_volume, bid, ask);
                }
            }
        }

        if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Filled;
            order.executed_ts = Some(Utc::now());
        }

        // Apply SL/TP to the booked positions once filled.
        if order.status == OrderStatus::Filled
            && (request.sl.is_some() || request.tp.is_some())
        {
            for position_id in &order.position_ids {
                if let Err(e) = self.ledger.modify_position(
                    request.account_id,
                    *position_id,
                    request.sl,
                    request.tp,
                ) {
                    warn!(position_id, error = %e, "failed to apply SL/TP after fill");
                }
            }
        }

        self.remember(&order);
        self.publish(&order);
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    fn validate(
        &self,
        request: &OrderRequest,
    ) -> Result<(Arc<crate::symbols::SymbolSpec>, f64, f64), OrderError> {
        if request.order_type != OrderType::Market {
            return Err(OrderError::UnsupportedOrderType(request.order_type));
        }

        let snapshot = self
            .ledger
            .snapshot(request.account_id)
            .map_err(|_| OrderError::UnknownAccount(request.account_id))?;
        if snapshot.account.frozen {
            return Err(OrderError::AccountFrozen(request.account_id));
        }

        let spec = self
            .symbols
            .get(&request.symbol)
            .ok_or_else(|| OrderError::UnknownSymbol(request.symbol.clone()))?;
        if !spec.enabled {
            return Err(OrderError::SymbolDisabled(request.symbol.clone()));
        }

        if request.volume <= 0.0 || request.volume < spec.min_lot {
            return Err(OrderError::InvalidVolume {
                volume: request.volume,
                min_lot: spec.min_lot,
            });
        }

        let tick = self
            .ticks
            .latest(&request.symbol)
            .ok_or_else(|| OrderError::NoMarketPrice(request.symbol.clone()))?;
        let (bid, ask) = (tick.bid, tick.ask);

        // SL/TP must sit on the correct side of the expected entry price.
        let entry = match request.side {
            Side::Buy => ask,
            Side::Sell => bid,
        };
        match request.side {
            Side::Buy => {
                if let Some(sl) = request.sl {
                    if sl >= entry {
                        return Err(OrderError::InvalidStops(format!(
                            "BUY stop-loss {sl} not below entry {entry}"
                        )));
                    }
                }
                if let Some(tp) = request.tp {
                    if tp <= entry {
                        return Err(OrderError::InvalidStops(format!(
                            "BUY take-profit {tp} not above entry {entry}"
                        )));
                    }
                }
            }
            Side::Sell => {
                if let Some(sl) = request.sl {
                    if sl <= entry {
                        return Err(OrderError::InvalidStops(format!(
                            "SELL stop-loss {sl} not above entry {entry}"
                        )));
                    }
                }
                if let Some(tp) = request.tp {
                    if tp >= entry {
                        return Err(OrderError::InvalidStops(format!(
                            "SELL take-profit {tp} not below entry {entry}"
                        )));
                    }
                }
            }
        }

        // Conservative margin pre-flight at the expected entry price.
        let required = crate::ledger::accounts::position_margin(
            request.volume,
            spec.contract_size,
            entry,
            spec.margin_percent,
            snapshot.account.leverage,
        );
        if snapshot.account.free_margin < required {
            return Err(OrderError::InsufficientMargin {
                required,
                free: snapshot.account.free_margin,
            });
        }

        Ok((spec, bid, ask))
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    fn route(
        &self,
        request: &OrderRequest,
        spec: &crate::symbols::SymbolSpec,
    ) -> RoutingDecision {
        let snapshot = self
            .ledger
            .snapshot(request.account_id)
            .expect("validated account exists");
        let exposure = self
            .ledger
            .exposure(&request.symbol, spec.exposure_limit_lots);

        let ctx = RouteContext {
            account_id: request.account_id,
            group: snapshot.account.group.clone(),
            classification: snapshot.account.classification,
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            toxicity_score: self.toxicity.score(request.account_id),
            exposure_risk: exposure
                .projected_utilization_pct(request.side.direction() * request.volume),
        };
        self.router
            .route(&ctx, None, |lp| self.lps.is_healthy(lp))
    }

    /// Routing preview for the analytics surface: the decision without any
    /// dispatch or booking.
    pub fn preview(&self, request: &OrderRequest) -> Result<RoutingDecision, OrderError> {
        let (spec, _bid, _ask) = self.validate(request)?;
        Ok(self.route(request, &spec))
    }

    // -------------------------------------------------------------------------
    // Fill paths
    // -------------------------------------------------------------------------

    fn fill_internal(
        &self,
        order: &mut Order,
        spec: &crate::symbols::SymbolSpec,
        volume: f64,
        bid: f64,
        ask: f64,
    ) {
        // The broker takes the other side at the current top of book.
        let price = match order.side {
            Side::Buy => ask,
            Side::Sell => bid,
        };
        let fill = Fill {
            order_id: order.id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            volume,
            price,
            source: FillSource::Internal,
            at: Utc::now(),
        };

        match self.ledger.apply_fill(&fill, spec) {
            Ok(outcome) => {
                order.position_ids.push(outcome.position.id);
                order.fills.push(fill);
            }
            Err(e) => {
                warn!(order_id = order.id, error = %e, "internal fill failed");
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(format!("ledger apply failed: {e}"));
            }
        }
    }

    async fn fill_via_lp(
        &self,
        order: &mut Order,
        spec: &crate::symbols::SymbolSpec,
        volume: f64,
        decision: &RoutingDecision,
    ) {
        let Some(lp_name) = decision.target_lp.clone() else {
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some("routing decision carries no target LP".into());
            return;
        };

        let lp_request = LpOrderRequest {
            client_ref: Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            volume,
            price_hint: order.price,
        };

        let placed = tokio::time::timeout(
            self.lp_timeout,
            self.lps.place_order(&lp_name, &lp_request),
        )
        .await;

        match placed {
            Err(_elapsed) => {
                // Deadline expired: cancel best-effort and report CANCELED.
                warn!(
                    order_id = order.id,
                    lp = %lp_name,
                    timeout_ms = self.lp_timeout.as_millis() as u64,
                    "LP order deadline expired"
                );
                if let Some(adapter) = self.lps.get(&lp_name) {
                    let _ = adapter.cancel_order(&lp_request.client_ref).await;
                }
                order.status = OrderStatus::Canceled;
                order.reject_reason = Some(format!("LP {lp_name} timed out"));
            }
            Ok(Err(e)) => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(format!("LP {lp_name} error: {e}"));
            }
            Ok(Ok(result)) => match result.status {
                LpOrderStatus::Rejected(reason) => {
                    order.status = OrderStatus::Rejected;
                    order.reject_reason = Some(format!("LP {lp_name} rejected: {reason}"));
                }
                LpOrderStatus::Filled => {
                    let fill = Fill {
                        order_id: order.id,
                        account_id: order.account_id,
                        symbol: order.symbol.clone(),
                        side: order.side,
                        volume: result.volume,
                        price: result.price,
                        source: FillSource::Lp(lp_name.clone()),
                        at: Utc::now(),
                    };
                    match self.ledger.apply_fill(&fill, spec) {
                        Ok(outcome) => {
                            order.position_ids.push(outcome.position.id);
                            order.fills.push(fill);
                        }
                        Err(e) => {
                            // Booked at the LP but not in the ledger: reverse
                            // best-effort and reject.
                            warn!(order_id = order.id, error = %e, "ledger apply failed after LP fill");
                            if let Some(adapter) = self.lps.get(&lp_name) {
                                let _ = adapter.cancel_order(&lp_request.client_ref).await;
                            }
                            order.status = OrderStatus::Rejected;
                            order.reject_reason = Some(format!("ledger apply failed: {e}"));
                        }
                    }
                }
            },
        }
    }

    // -------------------------------------------------------------------------
    // Dedup and records
    // -------------------------------------------------------------------------

    fn dedup_lookup(&self, request: &OrderRequest) -> Option<Order> {
        let client_order_id = request.client_order_id.as_deref()?;
        let mut dedup = self.dedup.lock();
        dedup.retain(|_, entry| entry.at.elapsed() < self.dedup_window);

        let order_id = dedup.get(client_order_id)?.order_id;
        let orders = self.recent_orders.read();
        orders.iter().find(|o| o.id == order_id).cloned()
    }

    fn remember(&self, order: &Order) {
        if let Some(client_order_id) = &order.client_order_id {
            self.dedup.lock().insert(
                client_order_id.clone(),
                DedupEntry {
                    order_id: order.id,
                    at: Instant::now(),
                },
            );
        }
        let mut orders = self.recent_orders.write();
        orders.push_back(order.clone());
        while orders.len() > MAX_RECENT_ORDERS {
            orders.pop_front();
        }
    }

    fn publish(&self, order: &Order) {
        let event = serde_json::json!({
            "type": "execution",
            "order": order,
        });
        self.hub.publish_execution(order.account_id, &event);
        info!(
            order_id = order.id,
            account_id = order.account_id,
            symbol = %order.symbol,
            action = %order.routing.action,
            status = %order.status,
            "order dispatched"
        );
    }

    pub fn recent_orders(&self, account_id: u64, count: usize) -> Vec<Order> {
        let orders = self.recent_orders.read();
        orders
            .iter()
            .rev()
            .filter(|o| o.account_id == account_id)
            .take(count)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, RuntimeConfig};
    use crate::ledger::Ledger;
    use crate::lp::{LpAdapter, LpEvent, LpOrderResult};
    use crate::market_data::Tick;
    use crate::routing::{RoutingRule, RuleFilter};
    use crate::toxicity::RollingToxicityScorer;
    use crate::types::{BookAction, Classification, MarginMode};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct MockLp {
        name: String,
        fill_price: f64,
        hang: bool,
    }

    #[async_trait]
    impl LpAdapter for MockLp {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run_session(&self, _events: mpsc::Sender<LpEvent>) -> AnyResult<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn subscribe(&self, _symbols: &[String]) -> AnyResult<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _symbols: &[String]) -> AnyResult<()> {
            Ok(())
        }

        fn symbols(&self) -> Vec<String> {
            vec!["EURUSD".to_string()]
        }

        async fn place_order(&self, request: &LpOrderRequest) -> AnyResult<LpOrderResult> {
            if self.hang {
                // Simulate an LP that never answers.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(LpOrderResult {
                lp_order_id: "LP-1".to_string(),
                client_ref: request.client_ref.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                price: self.fill_price,
                status: LpOrderStatus::Filled,
            })
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    struct Fixture {
        dispatcher: ExecutionDispatcher,
        ticks: Arc<TickStore>,
        ledger: Arc<Ledger>,
        router: Arc<RoutingEngine>,
        lps: Arc<LpManager>,
    }

    fn fixture() -> Fixture {
        let config = RuntimeConfig::default();
        let symbols = Arc::new(SymbolRegistry::new(&config.symbols));
        let ticks = Arc::new(TickStore::new(1000, 1e-5));
        let ledger = Arc::new(Ledger::new(
            &[AccountConfig {
                id: 1,
                user_id: 1,
                group: "retail".into(),
                leverage: 100,
                margin_mode: MarginMode::Hedging,
                balance: 10_000.0,
                credit: 0.0,
                classification: Classification::Normal,
            }],
            50.0,
        ));
        let router = Arc::new(RoutingEngine::new(BookAction::BBook, 1000));
        let lps = Arc::new(LpManager::new());
        let hub = Arc::new(QuoteHub::new(50, 256, 10));

        let dispatcher = ExecutionDispatcher::new(
            ledger.clone(),
            router.clone(),
            lps.clone(),
            ticks.clone(),
            hub,
            symbols,
            Arc::new(RollingToxicityScorer::default()),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        Fixture {
            dispatcher,
            ticks,
            ledger,
            router,
            lps,
        }
    }

    fn seed_tick(ticks: &TickStore, bid: f64, ask: f64) {
        ticks.store(Tick {
            symbol: "EURUSD".into(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ns: 1,
            sequence: 1,
        });
    }

    fn market_buy(volume: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: None,
            account_id: 1,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            volume,
            price: None,
            sl: None,
            tp: None,
        }
    }

    #[tokio::test]
    async fn zero_volume_is_a_validation_error() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);
        let err = f.dispatcher.execute(market_buy(0.0)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_volume");
    }

    #[tokio::test]
    async fn missing_market_price_is_rejected_up_front() {
        let f = fixture();
        let err = f.dispatcher.execute(market_buy(1.0)).await.unwrap_err();
        assert_eq!(err.code(), "no_market_price");
    }

    #[tokio::test]
    async fn bbook_internalizes_at_ask() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);

        let order = f.dispatcher.execute(market_buy(1.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.routing.action, BookAction::BBook);
        assert_eq!(order.fills.len(), 1);
        assert_eq!(order.fills[0].price, 1.10002);
        assert!(matches!(order.fills[0].source, FillSource::Internal));

        let positions = f.ledger.open_positions(1);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].open_price, 1.10002);
    }

    #[tokio::test]
    async fn abook_routes_to_target_lp() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);
        f.lps.register(Arc::new(MockLp {
            name: "OANDA".into(),
            fill_price: 1.10003,
            hang: false,
        }));
        f.lps.health().mark_connected("OANDA", 1);

        f.router.upsert_rule(RoutingRule {
            id: 0,
            priority: 100,
            filter: RuleFilter {
                symbols: vec!["EURUSD".into()],
                min_volume: 5.0,
                ..Default::default()
            },
            action: BookAction::ABook,
            target_lp: Some("OANDA".into()),
            hedge_percent: None,
            enabled: true,
            insertion_seq: 0,
        });

        // Ten lots match the rule and go to OANDA.
        let order = f.dispatcher.execute(market_buy(10.0)).await.unwrap();
        assert_eq!(order.routing.action, BookAction::ABook);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(matches!(order.fills[0].source, FillSource::Lp(ref lp) if lp == "OANDA"));
        assert_eq!(order.fills[0].price, 1.10003);

        // Three lots fall through to the default B-book.
        let order = f.dispatcher.execute(market_buy(3.0)).await.unwrap();
        assert_eq!(order.routing.action, BookAction::BBook);
    }

    #[tokio::test]
    async fn partial_hedge_books_two_fills_under_one_order() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);
        f.lps.register(Arc::new(MockLp {
            name: "OANDA".into(),
            fill_price: 1.10002,
            hang: false,
        }));
        f.lps.health().mark_connected("OANDA", 1);

        f.router.upsert_rule(RoutingRule {
            id: 0,
            priority: 100,
            filter: RuleFilter::default(),
            action: BookAction::PartialHedge,
            target_lp: Some("OANDA".into()),
            hedge_percent: Some(60.0),
            enabled: true,
            insertion_seq: 0,
        });

        let order = f.dispatcher.execute(market_buy(1.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fills.len(), 2);

        let lp_fill = &order.fills[0];
        let internal_fill = &order.fills[1];
        assert!((lp_fill.volume - 0.6).abs() < 1e-9);
        assert!(matches!(lp_fill.source, FillSource::Lp(_)));
        assert!((internal_fill.volume - 0.4).abs() < 1e-9);
        assert!(matches!(internal_fill.source, FillSource::Internal));

        assert_eq!(f.ledger.open_positions(1).len(), 2);
    }

    #[tokio::test]
    async fn lp_timeout_cancels_the_order() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);
        f.lps.register(Arc::new(MockLp {
            name: "OANDA".into(),
            fill_price: 1.10002,
            hang: true,
        }));
        f.lps.health().mark_connected("OANDA", 1);

        f.router.upsert_rule(RoutingRule {
            id: 0,
            priority: 100,
            filter: RuleFilter::default(),
            action: BookAction::ABook,
            target_lp: Some("OANDA".into()),
            hedge_percent: None,
            enabled: true,
            insertion_seq: 0,
        });

        let order = f.dispatcher.execute(market_buy(1.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert!(order.reject_reason.unwrap().contains("timed out"));
        assert!(f.ledger.open_positions(1).is_empty());
    }

    #[tokio::test]
    async fn duplicate_client_order_id_executes_once() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);

        let mut request = market_buy(1.0);
        request.client_order_id = Some("client-42".into());

        let first = f.dispatcher.execute(request.clone()).await.unwrap();
        let second = f.dispatcher.execute(request).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.ledger.open_positions(1).len(), 1);
    }

    #[tokio::test]
    async fn sl_on_wrong_side_is_rejected() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);

        let mut request = market_buy(1.0);
        request.sl = Some(1.20000);
        let err = f.dispatcher.execute(request).await.unwrap_err();
        assert_eq!(err.code(), "invalid_stops");
    }

    #[tokio::test]
    async fn preview_routes_without_booking() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);

        let decision = f.dispatcher.preview(&market_buy(1.0)).unwrap();
        assert_eq!(decision.action, BookAction::BBook);
        assert!(f.ledger.open_positions(1).is_empty());
    }

    #[tokio::test]
    async fn insufficient_margin_is_rejected() {
        let f = fixture();
        seed_tick(&f.ticks, 1.10000, 1.10002);
        // 10 000 balance, 1:100 leverage, 1% margin: 1 lot needs ~11 of
        // margin; 10 000 lots would need ~110 000.
        let err = f.dispatcher.execute(market_buy(10_000.0)).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_margin");
    }
}
