//! Bearer-token guard for mutating operator routes.

use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// End-user ingress; never requires the operator token.
const EXEMPT_PREFIXES: &[&str] = &["/api/v1/messages/inbound"];

#[derive(Debug, Clone, Default)]
pub struct OperatorAuthPolicy {
    /// When unset every request is allowed.
    pub api_token: Option<String>,
}

impl OperatorAuthPolicy {
    pub fn new(api_token: Option<&str>) -> Self {
        Self {
            api_token: api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        }
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn unauthorized(code: &str, message: &str) -> Response {
    tracing::warn!(error_code = code, error = message, "operator auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "error": message, "error_code": code })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_operator_auth(req: Request<Body>, next: Next) -> Response {
    if !is_mutating(req.method()) || is_exempt(req.uri().path()) {
        return next.run(req).await;
    }
    let expected = req
        .extensions()
        .get::<OperatorAuthPolicy>()
        .and_then(|p| p.api_token.clone());
    let Some(expected) = expected else {
        return next.run(req).await;
    };
    let rejection = match parse_bearer_token(req.headers()) {
        None => Some(("missing_bearer_token", "missing bearer token")),
        Some(provided) if provided != expected => {
            Some(("invalid_bearer_token", "invalid bearer token"))
        }
        Some(_) => None,
    };
    match rejection {
        Some((code, message)) => unauthorized(code, message),
        None => next.run(req).await,
    }
}
