use crate::{
    errors::{ErrorResponse, ServiceError},
    handlers::common::{created_response, success_response, validate_input, CustomerContext},
    services::{
        checkout::{CheckoutRequest, CheckoutResponse, CheckoutSummary},
        payments::{EligibilityRequest, EligibilityResponse, Locale},
    },
    AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(checkout_summary).post(start_checkout))
        .route("/tabby-eligibility", post(tabby_eligibility))
}

/// Cart totals and the payment methods offered for them
#[utoipa::path(
    get,
    path = "/api/v1/checkout",
    responses(
        (status = 200, description = "Totals and available payment methods", body = CheckoutSummary),
        (status = 401, description = "No shopper", body = ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn checkout_summary(
    State(state): State<AppState>,
    customer: CustomerContext,
    locale: Locale,
) -> Result<impl IntoResponse, ServiceError> {
    let summary = state.services.checkout.summary(customer.id(), locale).await?;
    Ok(success_response(summary))
}

/// Places the order and opens a payment session
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created; send the shopper to redirect_url", body = CheckoutResponse),
        (status = 400, description = "Empty cart or unknown payment method", body = ErrorResponse),
        (status = 402, description = "Provider declined the session", body = ErrorResponse),
        (status = 502, description = "Provider unavailable", body = ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn start_checkout(
    State(state): State<AppState>,
    customer: CustomerContext,
    locale: Locale,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let response = state
        .services
        .checkout
        .checkout(customer.into_inner(), locale, payload)
        .await?;
    Ok(created_response(response))
}

/// Asks the installment lender whether it would accept this buyer and amount
#[utoipa::path(
    post,
    path = "/api/v1/checkout/tabby-eligibility",
    request_body = EligibilityRequest,
    responses(
        (status = 200, description = "Eligibility verdict", body = EligibilityResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn tabby_eligibility(
    State(state): State<AppState>,
    locale: Locale,
    Json(payload): Json<EligibilityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let verdict = state
        .services
        .gateways
        .tabby()
        .check_eligibility(&payload, locale)
        .await?;
    Ok(success_response(verdict))
}
