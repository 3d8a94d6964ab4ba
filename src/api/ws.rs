// =============================================================================
// Subscription Gateway — WebSocket endpoint for prices and account events
// =============================================================================
//
// Clients connect to `/ws/prices` (or `/ws/analytics`) with a bearer token in
// the `Authorization` header or `?token=` query parameter.  Each connection
// gets two tasks:
//
//   read task   — inbound subscribe/unsubscribe/order messages, token-bucket
//                 rate limited; enforces the read deadline (pong-wait).
//   pump task   — drains the hub's per-connection queue to the socket with a
//                 write deadline, and pings on the configured period.
//
// Inbound:  {"type":"subscribe","symbols":[...]}
//           {"type":"unsubscribe","symbols":[...]}
//           {"type":"order","symbol":...,"side":...,"volume":...}
// Outbound: snapshot / batch (deltas) / execution / error payloads.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::api::auth::AuthClaims;
use crate::app_state::EngineState;
use crate::dispatcher::OrderRequest;
use crate::hub::Subscriber;
use crate::types::{OrderType, Side};

// =============================================================================
// Rate limiting
// =============================================================================

/// Per-connection token bucket. Overflow drops the message, never the
/// connection.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        let capacity = rate_per_sec.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Upgrade handler
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade. Validates the bearer token before
/// upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<EngineState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.token)
        .unwrap_or_default();

    let Some(claims) = state.auth.validate(&token) else {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            "Invalid or missing token",
        )
            .into_response();
    };

    info!(user_id = claims.user_id, account_id = claims.account_id, "WebSocket accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, state, claims))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<EngineState>, claims: AuthClaims) {
    let subscriber = state.hub.register(claims.account_id);
    let conn_id = subscriber.conn_id;

    let (sender, mut receiver) = socket.split();

    // Control frames (pongs) cross from the read task to the pump.
    let (control_tx, control_rx) = mpsc::channel::<Message>(8);

    let pump = tokio::spawn(outbound_pump(
        sender,
        subscriber.clone(),
        state.clone(),
        control_rx,
        Duration::from_secs(state.config.ping_period_secs),
        Duration::from_secs(state.config.ws_write_deadline_secs),
    ));

    let read_deadline = Duration::from_secs(state.config.ws_read_deadline_secs);
    let mut bucket = TokenBucket::new(state.config.rate_limit_msgs_per_sec);
    let mut rate_dropped: u64 = 0;

    loop {
        let frame = timeout(read_deadline, receiver.next()).await;
        match frame {
            Err(_elapsed) => {
                info!(conn_id, "WebSocket read deadline exceeded, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if !bucket.allow() {
                    rate_dropped += 1;
                    if rate_dropped % 1000 == 1 {
                        warn!(conn_id, rate_dropped, "rate limit exceeded, dropping frames");
                    }
                    continue;
                }
                handle_client_message(&state, &subscriber, &claims, &text).await;
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = control_tx.send(Message::Pong(data)).await;
            }
            Ok(Some(Ok(Message::Pong(_)))) => {
                // Keepalive satisfied; the read deadline restarts on the next
                // loop iteration.
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                info!(conn_id, "WebSocket close frame received");
                break;
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                debug!(conn_id, "binary frame ignored");
            }
        }
    }

    state.hub.unregister(conn_id);
    let _ = pump.await;
    info!(conn_id, "WebSocket connection closed");
}

// =============================================================================
// Outbound pump
// =============================================================================

async fn outbound_pump<S>(
    mut sender: S,
    subscriber: Arc<Subscriber>,
    state: Arc<EngineState>,
    mut control_rx: mpsc::Receiver<Message>,
    ping_period: Duration,
    write_deadline: Duration,
) where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = interval(ping_period);
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = subscriber.next_message() => {
                match maybe {
                    Some(message) => {
                        match timeout(write_deadline, sender.send(Message::Text(message))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(conn_id = subscriber.conn_id, error = %e, "WebSocket send failed");
                                break;
                            }
                            Err(_elapsed) => {
                                warn!(conn_id = subscriber.conn_id, "write deadline exceeded, closing");
                                break;
                            }
                        }
                    }
                    None => {
                        // The hub closed us; a still-registered connection
                        // means the slow-consumer policy fired.
                        let reason = if state.hub.connection(subscriber.conn_id).is_some() {
                            "slow consumer"
                        } else {
                            "closing"
                        };
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(frame) => {
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if timeout(write_deadline, sender.send(Message::Ping(Vec::new())))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Inbound messages
// =============================================================================

#[derive(Deserialize)]
struct SymbolsPayload {
    symbols: Vec<String>,
}

#[derive(Deserialize)]
struct OrderPayload {
    symbol: String,
    side: String,
    volume: f64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
    #[serde(default, rename = "clientOrderId")]
    client_order_id: Option<String>,
}

fn error_payload(code: &str, message: &str) -> String {
    serde_json::json!({ "type": "error", "code": code, "message": message }).to_string()
}

async fn handle_client_message(
    state: &Arc<EngineState>,
    subscriber: &Arc<Subscriber>,
    claims: &AuthClaims,
    text: &str,
) {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            subscriber.enqueue_direct(error_payload("bad_json", "unparseable message"));
            return;
        }
    };

    match parsed["type"].as_str() {
        Some("subscribe") => {
            match serde_json::from_value::<SymbolsPayload>(parsed.clone()) {
                Ok(payload) => {
                    state
                        .hub
                        .subscribe(subscriber.conn_id, &payload.symbols, &state.ticks);
                }
                Err(_) => {
                    subscriber.enqueue_direct(error_payload("bad_subscribe", "missing symbols"));
                }
            }
        }
        Some("unsubscribe") => {
            if let Ok(payload) = serde_json::from_value::<SymbolsPayload>(parsed.clone()) {
                state.hub.unsubscribe(subscriber.conn_id, &payload.symbols);
            }
        }
        Some("order") => {
            let payload = match serde_json::from_value::<OrderPayload>(parsed.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    subscriber.enqueue_direct(error_payload("bad_order", &e.to_string()));
                    return;
                }
            };
            let side: Side = match payload.side.parse() {
                Ok(side) => side,
                Err(_) => {
                    subscriber.enqueue_direct(error_payload("bad_order", "side must be BUY or SELL"));
                    return;
                }
            };

            let request = OrderRequest {
                client_order_id: payload.client_order_id,
                account_id: claims.account_id,
                symbol: payload.symbol.to_uppercase(),
                side,
                order_type: OrderType::Market,
                volume: payload.volume,
                price: None,
                sl: payload.sl,
                tp: payload.tp,
            };

            // The execution event itself is broadcast by the dispatcher via
            // the hub; only failures need a direct reply here.
            if let Err(e) = state.dispatcher.execute(request).await {
                subscriber.enqueue_direct(error_payload(e.code(), &e.to_string()));
            }
        }
        other => {
            debug!(kind = ?other, "unknown client message type");
            subscriber.enqueue_direct(error_payload("unknown_type", "unsupported message type"));
        }
    }
}
