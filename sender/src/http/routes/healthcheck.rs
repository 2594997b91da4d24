use axum::extract::State;
use axum::http::StatusCode;

use crate::http::server::AppState;

/// `GET /healthcheck` — reports ok unconditionally; a dependency check
/// would require a DB round trip on every hit, which this endpoint is
/// meant to avoid (liveness, not readiness).
pub async fn healthcheck(State(_state): State<AppState>) -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
