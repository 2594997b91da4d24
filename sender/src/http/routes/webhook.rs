use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use tracing::error;

use crate::events::{self, InboundEvent};
use crate::http::server::AppState;

/// `POST /events` (§4.10, §6): ingests one normalised delivery-status
/// event. Malformed payloads are rejected at the JSON-extraction layer;
/// anything that parses but fails to apply is logged and swallowed —
/// §9's "bad webhook payloads are ignored after logging, never mutate
/// state" applies to the *semantic* failures, not the transport-level
/// ones, which is why this still returns 500 on a database error.
pub async fn handle_event(State(state): State<AppState>, Json(event): Json<InboundEvent>) -> StatusCode {
    match events::ingest(&state.db, &state.bounce_policy, event).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            error!(%err, "failed to ingest webhook event");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Rejects webhook calls that don't carry the configured shared secret,
/// mirroring the teacher's `check_aws_sns_arn_middleware` — a header
/// comparison gate in front of the actual route handler. When no secret
/// is configured the check is skipped entirely.
pub async fn check_webhook_secret_middleware<B>(
    State(state): State<AppState>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.webhook_shared_secret else {
        return Ok(next.run(req).await);
    };

    let provided = req.headers().get("x-nuntius-webhook-secret").and_then(|v| v.to_str().ok());

    if provided != Some(expected.as_str()) {
        error!("webhook call with missing or invalid shared secret");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(req).await)
}
