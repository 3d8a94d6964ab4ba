// =============================================================================
// Bearer Token Authentication — Axum extractors over a pluggable provider
// =============================================================================
//
// Token *issuance* is out of scope: validation is delegated to an
// `AuthProvider` that maps a bearer token to `(user_id, account_id, role)`.
// The default provider checks statically configured tokens plus the
// `MERIDIAN_ADMIN_TOKEN` environment variable, comparing in constant time to
// prevent timing side-channels.
//
// Usage as Axum extractors:
//
//   async fn handler(AuthUser(claims): AuthUser, ...) { ... }     // any role
//   async fn handler(RequireAdmin(claims): RequireAdmin, ...) { } // admin only
//
// If the token is missing or invalid the extractor short-circuits the request
// with a 401/403 before the handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::EngineState;
use crate::config::TokenConfig;
use crate::types::Role;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison examines every
/// byte even after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Provider
// =============================================================================

/// Claims attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    pub user_id: u64,
    pub account_id: u64,
    pub role: Role,
}

/// External collaborator that turns a bearer token into claims.
pub trait AuthProvider: Send + Sync {
    fn validate(&self, token: &str) -> Option<AuthClaims>;
}

/// Default provider: statically configured tokens plus an env admin token.
pub struct StaticTokenProvider {
    tokens: Vec<TokenConfig>,
}

impl StaticTokenProvider {
    pub fn new(tokens: Vec<TokenConfig>) -> Self {
        Self { tokens }
    }
}

impl AuthProvider for StaticTokenProvider {
    fn validate(&self, token: &str) -> Option<AuthClaims> {
        if token.is_empty() {
            return None;
        }

        // Environment admin token, read per request so rotation does not
        // require a restart.
        if let Ok(admin) = std::env::var("MERIDIAN_ADMIN_TOKEN") {
            if !admin.is_empty() && constant_time_eq(token.as_bytes(), admin.as_bytes()) {
                return Some(AuthClaims {
                    user_id: 0,
                    account_id: 0,
                    role: Role::Admin,
                });
            }
        }

        self.tokens
            .iter()
            .find(|t| constant_time_eq(token.as_bytes(), t.token.as_bytes()))
            .map(|t| AuthClaims {
                user_id: t.user_id,
                account_id: t.account_id,
                role: if t.admin { Role::Admin } else { Role::Client },
            })
    }
}

// =============================================================================
// Extractors
// =============================================================================

pub struct AuthUser(pub AuthClaims);

pub struct RequireAdmin(pub AuthClaims);

/// Rejection type returned when authentication or authorization fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[async_trait]
impl FromRequestParts<Arc<EngineState>> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            warn!("missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Missing or invalid authorization token",
            });
        };

        match state.auth.validate(token) {
            Some(claims) => Ok(AuthUser(claims)),
            None => {
                warn!("invalid bearer token presented");
                Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "Invalid authorization token",
                })
            }
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<EngineState>> for RequireAdmin {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        if claims.role != Role::Admin {
            warn!(user_id = claims.user_id, "role lacks admin permission");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Admin role required",
            });
        }
        Ok(RequireAdmin(claims))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn static_provider_maps_tokens_to_claims() {
        let provider = StaticTokenProvider::new(vec![
            TokenConfig {
                token: "client-token".into(),
                user_id: 7,
                account_id: 70,
                admin: false,
            },
            TokenConfig {
                token: "admin-token".into(),
                user_id: 1,
                account_id: 0,
                admin: true,
            },
        ]);

        let claims = provider.validate("client-token").unwrap();
        assert_eq!(claims.account_id, 70);
        assert_eq!(claims.role, Role::Client);

        let claims = provider.validate("admin-token").unwrap();
        assert_eq!(claims.role, Role::Admin);

        assert!(provider.validate("wrong").is_none());
        assert!(provider.validate("").is_none());
    }
}
