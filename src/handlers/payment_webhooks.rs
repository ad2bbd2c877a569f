use crate::{config::TabbyConfig, services::payments::ReconcileOutcome, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Provider notification routes under `/api/webhooks`
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/tabby", post(tabby_webhook))
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

// POST /api/webhooks/tabby
#[utoipa::path(
    post,
    path = "/api/webhooks/tabby",
    request_body = String,
    responses(
        (status = 200, description = "Notification handled or ignored"),
        (status = 400, description = "Missing payment id"),
        (status = 403, description = "Invalid signature"),
        (status = 500, description = "Verification failed; the provider should retry")
    ),
    tag = "Payments"
)]
pub async fn tabby_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !signature_matches(&state.config.tabby, &headers) {
        warn!("Tabby webhook signature verification failed");
        return message(StatusCode::FORBIDDEN, "Invalid signature");
    }

    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let Some(payment_id) = payment_reference(&payload) else {
        warn!("Tabby webhook without a payment id");
        return message(StatusCode::BAD_REQUEST, "Missing payment id");
    };

    match state
        .services
        .gateways
        .tabby()
        .handle_webhook(&payment_id)
        .await
    {
        Ok(ReconcileOutcome::NotFound) => {
            info!(%payment_id, "Tabby webhook for unknown payment");
            message(StatusCode::OK, "Payment not found")
        }
        Ok(ReconcileOutcome::AlreadyFinal(_) | ReconcileOutcome::InFlight(_)) => {
            message(StatusCode::OK, "Already processed")
        }
        Ok(ReconcileOutcome::Applied(payment)) => (
            StatusCode::OK,
            Json(json!({
                "message": "Payment processed successfully",
                "status": payment.status,
            })),
        )
            .into_response(),
        Err(err) => {
            error!(%payment_id, error = %err, "Tabby webhook verification failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Payment verification failed")
        }
    }
}

/// Reads `id`, falling back to `payment_id`.
fn payment_reference(payload: &Value) -> Option<String> {
    ["id", "payment_id"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

/// Checks the shared-secret header; passes when no secret is configured.
fn signature_matches(config: &TabbyConfig, headers: &HeaderMap) -> bool {
    let Some(expected) = config
        .webhook_signature_value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    else {
        return true;
    };
    headers
        .get(config.webhook_signature_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(|actual| constant_time_eq(expected, actual))
        .unwrap_or(false)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
