use crate::{
    config::AppConfig,
    entities::payment::PaymentStatus,
    errors::{ErrorResponse, ServiceError},
    handlers::common::success_response,
    services::payments::{CallbackParams, HyperPayCheckoutDetails, PaymentGateway},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect},
    routing::get,
    Router,
};
use metrics::counter;
use tracing::{info, warn};
use url::form_urlencoded;
use uuid::Uuid;

/// API routes under `/api/v1/payments`
pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/hyperpay/:payment_id", get(hyperpay_checkout))
}

/// Browser-facing routes under `/payments`
pub fn callback_routes() -> Router<AppState> {
    Router::new().route("/callback", get(payment_callback))
}

/// Data for the card widget page of a pending payment
#[utoipa::path(
    get,
    path = "/api/v1/payments/hyperpay/{payment_id}",
    params(("payment_id" = Uuid, Path, description = "Local payment id")),
    responses(
        (status = 200, description = "Widget checkout data", body = HyperPayCheckoutDetails),
        (status = 400, description = "Payment is no longer pending", body = ErrorResponse),
        (status = 404, description = "Unknown payment", body = ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn hyperpay_checkout(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state
        .services
        .gateways
        .hyperpay()
        .checkout_details(payment_id)
        .await?;
    Ok(success_response(details))
}

/// Where the shopper lands after the provider's page.
///
/// Always answers with a redirect; errors become an error-page flash message.
#[utoipa::path(
    get,
    path = "/payments/callback",
    params(CallbackParams),
    responses((status = 303, description = "Redirect to the checkout success or error page")),
    tag = "Payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let gateway: Option<&dyn PaymentGateway> = if params.resource_path.is_some() {
        Some(state.services.gateways.hyperpay() as &dyn PaymentGateway)
    } else if params.payment_id.is_some() {
        Some(state.services.gateways.tabby() as &dyn PaymentGateway)
    } else {
        None
    };

    let outcome = match gateway {
        Some(gateway) => match gateway.callback(&params).await {
            Ok(payment) => {
                info!(payment_id = %payment.id, status = %payment.status, "Shopper returned from provider");
                Some(payment.status)
            }
            Err(err) => {
                warn!(error = %err, "Payment callback could not be verified");
                None
            }
        },
        None => {
            warn!("Payment callback without a payment reference");
            None
        }
    };

    let flash = CallbackFlash::for_status(outcome);
    counter!("storefront_payments.callbacks", 1, "status" => flash.status);
    Redirect::to(&flash.redirect_url(&state.config))
}

/// Flash message shown after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallbackFlash {
    success: bool,
    status: &'static str,
    message: &'static str,
}

impl CallbackFlash {
    /// `None` means the payment could not be verified.
    fn for_status(status: Option<PaymentStatus>) -> Self {
        let (success, status, message) = match status {
            Some(PaymentStatus::Paid) => (true, "paid", "Payment completed successfully"),
            Some(PaymentStatus::Failed) => (false, "failed", "Payment failed"),
            Some(PaymentStatus::Cancelled) => (false, "cancelled", "Payment was cancelled"),
            Some(PaymentStatus::Pending | PaymentStatus::Processing) => {
                (true, "pending", "Payment is being processed")
            }
            None => (false, "error", "Payment could not be verified"),
        };
        Self {
            success,
            status,
            message,
        }
    }

    fn redirect_url(&self, config: &AppConfig) -> String {
        let base = if self.success {
            &config.checkout_success_url
        } else {
            &config.checkout_error_url
        };
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("status", self.status)
            .append_pair("message", self.message)
            .finish();
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}{}", base, separator, query)
    }
}
