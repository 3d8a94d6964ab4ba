// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public endpoints (health) require no authentication.  Trading endpoints
// require a valid bearer token; clients may only touch their own account,
// admins may touch any.  Admin CRUD is role-gated and audit-logged.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::{AuthClaims, AuthUser, RequireAdmin};
use crate::app_state::EngineState;
use crate::config::{AccountConfig, LpConfig, SymbolConfig};
use crate::dispatcher::{OrderError, OrderRequest};
use crate::ledger::CloseReason;
use crate::persistence::query::query_ticks;
use crate::routing::RoutingRule;
use crate::symbols::SymbolSpec;
use crate::types::{OrderType, Role, Side};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router (REST + WebSocket mounts) with CORS and shared
/// state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/health", get(health))
        // ── Trading ─────────────────────────────────────────────────
        .route("/api/orders/market", post(place_market_order))
        .route("/api/orders", get(recent_orders))
        .route("/api/positions", get(positions))
        .route("/api/positions/close", post(close_position))
        .route("/api/positions/modify", post(modify_position))
        .route("/api/history/ticks", get(tick_history))
        .route("/api/history/bars", get(bar_history))
        .route("/api/quotes/recent", get(recent_quotes))
        .route("/api/trades", get(recent_trades))
        .route("/api/routing/preview", get(routing_preview))
        // ── Operations / analytics ──────────────────────────────────
        .route("/api/state", get(engine_state))
        .route("/api/lps/health", get(lp_health))
        .route("/api/exposure", get(exposure))
        .route("/api/analytics/routing/breakdown", get(routing_breakdown))
        .route("/api/analytics/routing/decisions", get(routing_decisions))
        // ── Admin CRUD ──────────────────────────────────────────────
        .route("/api/admin/symbols", get(list_symbols).post(upsert_symbol))
        .route("/api/admin/symbols/:name", delete(delete_symbol))
        .route("/api/admin/rules", get(list_rules).post(upsert_rule))
        .route("/api/admin/rules/:id", delete(delete_rule))
        .route("/api/admin/lps", get(list_lps).post(create_lp))
        .route("/api/admin/lps/:name", delete(delete_lp))
        .route(
            "/api/admin/accounts",
            get(list_accounts).post(upsert_account),
        )
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws/prices", get(crate::api::ws::ws_handler))
        .route("/ws/analytics", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Helpers
// =============================================================================

fn error_response(status: StatusCode, code: &str, message: &str) -> axum::response::Response {
    let body = serde_json::json!({
        "success": false,
        "code": code,
        "error": message,
    });
    (status, Json(body)).into_response()
}

fn order_error_response(err: &OrderError) -> axum::response::Response {
    error_response(StatusCode::BAD_REQUEST, err.code(), &err.to_string())
}

/// Clients may only act on their own account; admins on any.
fn resolve_account(
    claims: &AuthClaims,
    requested: Option<u64>,
) -> Result<u64, axum::response::Response> {
    match (claims.role, requested) {
        (Role::Admin, Some(id)) => Ok(id),
        (Role::Admin, None) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_account",
            "accountId is required for admin requests",
        )),
        (Role::Client, Some(id)) if id != claims.account_id => Err(error_response(
            StatusCode::FORBIDDEN,
            "forbidden_account",
            "token is not authorized for this account",
        )),
        (Role::Client, _) => Ok(claims.account_id),
    }
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketOrderBody {
    account_id: Option<u64>,
    symbol: String,
    side: String,
    volume: f64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
    #[serde(default)]
    client_order_id: Option<String>,
}

async fn place_market_order(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Json(body): Json<MarketOrderBody>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, body.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let side: Side = match body.side.parse() {
        Ok(side) => side,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_side",
                "side must be BUY or SELL",
            )
        }
    };

    let request = OrderRequest {
        client_order_id: body.client_order_id,
        account_id,
        symbol: body.symbol.to_uppercase(),
        side,
        order_type: OrderType::Market,
        volume: body.volume,
        price: None,
        sl: body.sl,
        tp: body.tp,
    };

    match state.dispatcher.execute(request).await {
        Ok(order) => Json(serde_json::json!({ "success": true, "order": order })).into_response(),
        Err(e) => order_error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountQuery {
    account_id: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn recent_orders(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<AccountQuery>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, query.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let orders = state
        .dispatcher
        .recent_orders(account_id, query.limit.unwrap_or(100));
    Json(orders).into_response()
}

// =============================================================================
// Positions
// =============================================================================

async fn positions(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<AccountQuery>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, query.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    Json(state.ledger.open_positions(account_id)).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosePositionBody {
    account_id: Option<u64>,
    position_id: u64,
    #[serde(default)]
    volume: Option<f64>,
}

async fn close_position(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Json(body): Json<ClosePositionBody>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, body.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(position) = state
        .ledger
        .open_positions(account_id)
        .into_iter()
        .find(|p| p.id == body.position_id)
    else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_position",
            "position not found",
        );
    };

    let Some(tick) = state.ticks.latest(&position.symbol) else {
        return error_response(
            StatusCode::CONFLICT,
            "no_market_price",
            "no current price to close against",
        );
    };
    // A BUY closes against the bid, a SELL against the ask.
    let price = match position.side {
        Side::Buy => tick.bid,
        Side::Sell => tick.ask,
    };

    match state.ledger.close_position(
        account_id,
        body.position_id,
        body.volume,
        price,
        CloseReason::Manual,
    ) {
        Ok(trade) => {
            state.hub.publish_execution(
                account_id,
                &serde_json::json!({ "type": "position_closed", "trade": trade }),
            );
            Json(serde_json::json!({ "success": true, "trade": trade })).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, "close_failed", &e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyPositionBody {
    account_id: Option<u64>,
    position_id: u64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
}

async fn modify_position(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Json(body): Json<ModifyPositionBody>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, body.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .ledger
        .modify_position(account_id, body.position_id, body.sl, body.tp)
    {
        Ok(position) => {
            Json(serde_json::json!({ "success": true, "position": position })).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, "invalid_stops", &e.to_string()),
    }
}

// =============================================================================
// Tick history
// =============================================================================

#[derive(Deserialize)]
struct TickHistoryQuery {
    symbol: String,
    date: String,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
}

async fn tick_history(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<TickHistoryQuery>,
) -> axum::response::Response {
    let Ok(date) = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_date",
            "date must be YYYY-MM-DD",
        );
    };
    let limit = query.limit.unwrap_or(1000).min(10_000);
    let offset = query.offset.unwrap_or(0);

    let data_dir = std::path::PathBuf::from(&state.config.data_dir);
    let symbol = query.symbol.to_uppercase();

    // The page query opens a SQLite file; keep it off the async workers.
    let page = tokio::task::spawn_blocking(move || {
        query_ticks(&data_dir, &symbol, date, limit, offset)
    })
    .await;

    match page {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(e)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            &e.to_string(),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            &e.to_string(),
        ),
    }
}

#[derive(Deserialize)]
struct RecentQuotesQuery {
    symbol: String,
    #[serde(default)]
    n: Option<usize>,
}

async fn recent_quotes(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<RecentQuotesQuery>,
) -> impl IntoResponse {
    let symbol = query.symbol.to_uppercase();
    let ticks = state
        .ticks
        .get_recent(&symbol, query.n.unwrap_or(100).min(5_000));
    Json(serde_json::json!({ "symbol": symbol, "ticks": ticks }))
}

#[derive(Deserialize)]
struct BarHistoryQuery {
    symbol: String,
    timeframe: String,
    #[serde(default)]
    count: Option<usize>,
}

async fn bar_history(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<BarHistoryQuery>,
) -> axum::response::Response {
    let Ok(timeframe) = query.timeframe.parse::<crate::market_data::Timeframe>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_timeframe",
            "timeframe must be one of 1m, 5m, 15m, 1h, 4h, 1d",
        );
    };
    let symbol = query.symbol.to_uppercase();
    let bars = state
        .ohlc
        .recent_bars(&symbol, timeframe, query.count.unwrap_or(100).min(5_000));
    let current = state.ohlc.current_bar(&symbol, timeframe);
    Json(serde_json::json!({
        "symbol": symbol,
        "timeframe": timeframe,
        "bars": bars,
        "current": current,
    }))
    .into_response()
}

async fn recent_trades(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<AccountQuery>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, query.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    Json(state.ledger.recent_trades(account_id, query.limit.unwrap_or(100))).into_response()
}

// =============================================================================
// Routing preview & analytics
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewQuery {
    symbol: String,
    volume: f64,
    account_id: Option<u64>,
    side: String,
}

async fn routing_preview(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<PreviewQuery>,
) -> axum::response::Response {
    let account_id = match resolve_account(&claims, query.account_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let side: Side = match query.side.parse() {
        Ok(side) => side,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_side",
                "side must be BUY or SELL",
            )
        }
    };

    let request = OrderRequest {
        client_order_id: None,
        account_id,
        symbol: query.symbol.to_uppercase(),
        side,
        order_type: OrderType::Market,
        volume: query.volume,
        price: None,
        sl: None,
        tp: None,
    };

    match state.dispatcher.preview(&request) {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => order_error_response(&e),
    }
}

#[derive(Deserialize)]
struct BreakdownQuery {
    #[serde(default)]
    start_time: Option<i64>,
    #[serde(default)]
    end_time: Option<i64>,
}

async fn routing_breakdown(
    RequireAdmin(_claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<BreakdownQuery>,
) -> impl IntoResponse {
    let to_dt = chrono::DateTime::from_timestamp_millis;
    let start = query.start_time.and_then(to_dt);
    let end = query.end_time.and_then(to_dt);
    Json(state.router.breakdown(start, end))
}

async fn routing_decisions(
    RequireAdmin(_claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<AccountQuery>,
) -> impl IntoResponse {
    Json(state.router.recent_decisions(query.limit.unwrap_or(100)))
}

// =============================================================================
// Operations
// =============================================================================

async fn engine_state(
    RequireAdmin(_claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(state.status())
}

async fn lp_health(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(state.lps.health_snapshot())
}

#[derive(Deserialize)]
struct ExposureQuery {
    symbol: String,
}

async fn exposure(
    RequireAdmin(_claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<ExposureQuery>,
) -> axum::response::Response {
    let symbol = query.symbol.to_uppercase();
    let Some(spec) = state.symbols.get(&symbol) else {
        return error_response(StatusCode::NOT_FOUND, "unknown_symbol", "unknown symbol");
    };
    Json(state.ledger.exposure(&symbol, spec.exposure_limit_lots)).into_response()
}

// =============================================================================
// Admin CRUD — symbols
// =============================================================================

async fn list_symbols(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(state.symbols.all())
}

async fn upsert_symbol(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Json(body): Json<SymbolConfig>,
) -> impl IntoResponse {
    let spec = SymbolSpec::from(&body);
    let name = spec.name.clone();
    state.symbols.upsert(spec);
    state.audit.record(
        claims.user_id,
        "symbol_upsert",
        serde_json::json!({ "symbol": name }),
    );
    info!(symbol = %name, "symbol upserted");
    Json(serde_json::json!({ "success": true }))
}

async fn delete_symbol(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    let name = name.to_uppercase();
    if !state.symbols.remove(&name) {
        return error_response(StatusCode::NOT_FOUND, "unknown_symbol", "unknown symbol");
    }
    state.audit.record(
        claims.user_id,
        "symbol_delete",
        serde_json::json!({ "symbol": name }),
    );
    Json(serde_json::json!({ "success": true })).into_response()
}

// =============================================================================
// Admin CRUD — routing rules
// =============================================================================

async fn list_rules(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(state.router.rules())
}

async fn upsert_rule(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Json(rule): Json<RoutingRule>,
) -> impl IntoResponse {
    let action = rule.action;
    let conflicts = state.router.upsert_rule(rule);
    state.audit.record(
        claims.user_id,
        "rule_upsert",
        serde_json::json!({ "action": action, "conflicts": conflicts.len() }),
    );
    Json(serde_json::json!({ "success": true, "conflicts": conflicts }))
}

async fn delete_rule(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Path(id): Path<u64>,
) -> axum::response::Response {
    if !state.router.delete_rule(id) {
        return error_response(StatusCode::NOT_FOUND, "unknown_rule", "unknown rule");
    }
    state.audit.record(
        claims.user_id,
        "rule_delete",
        serde_json::json!({ "rule_id": id }),
    );
    Json(serde_json::json!({ "success": true })).into_response()
}

// =============================================================================
// Admin CRUD — LPs
// =============================================================================

async fn list_lps(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "lps": state.lps.names(),
        "health": state.lps.health_snapshot(),
    }))
}

async fn create_lp(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Json(cfg): Json<LpConfig>,
) -> impl IntoResponse {
    state.spawn_lp(&cfg);
    state.audit.record(
        claims.user_id,
        "lp_create",
        serde_json::json!({ "lp": cfg.name, "kind": cfg.kind }),
    );
    Json(serde_json::json!({ "success": true }))
}

async fn delete_lp(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    if !state.stop_lp(&name) {
        return error_response(StatusCode::NOT_FOUND, "unknown_lp", "unknown LP");
    }
    state
        .audit
        .record(claims.user_id, "lp_delete", serde_json::json!({ "lp": name }));
    Json(serde_json::json!({ "success": true })).into_response()
}

// =============================================================================
// Admin CRUD — accounts
// =============================================================================

async fn list_accounts(
    RequireAdmin(_claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    let snapshots: Vec<_> = state
        .ledger
        .account_ids()
        .into_iter()
        .filter_map(|id| state.ledger.snapshot(id).ok())
        .collect();
    Json(snapshots)
}

async fn upsert_account(
    RequireAdmin(claims): RequireAdmin,
    State(state): State<Arc<EngineState>>,
    Json(cfg): Json<AccountConfig>,
) -> impl IntoResponse {
    state.ledger.upsert_account(&cfg);
    state.audit.record(
        claims.user_id,
        "account_upsert",
        serde_json::json!({ "account_id": cfg.id }),
    );
    Json(serde_json::json!({ "success": true }))
}
