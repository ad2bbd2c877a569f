//! Request correlation for storefront traffic.
//!
//! Every HTTP span carries the request id and, on shopper routes, the customer
//! from `x-customer-id`. Provider callbacks and webhooks are tagged with a
//! `flow` field so reconciliation logs can be filtered apart from cart traffic.

use crate::handlers::common::CUSTOMER_ID_HEADER;
use crate::middleware_helpers::request_id::REQUEST_ID_HEADER;
use axum::http::Request;
use std::{cell::RefCell, fmt, future::Future};
use tower_http::{
    classify::{SharedClassifier, StatusInRangeAsFailures},
    trace::{DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, MakeSpan, TraceLayer},
};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

impl Default for RequestId {
    fn default() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }
}

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        RequestId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

tokio::task_local! {
    static CURRENT_REQUEST_ID: RefCell<Option<RequestId>>;
}

/// Runs `future` with `request_id` visible to [`current_request_id`].
pub async fn scope_request_id<Fut, R>(request_id: RequestId, future: Fut) -> R
where
    Fut: Future<Output = R>,
{
    CURRENT_REQUEST_ID
        .scope(RefCell::new(Some(request_id)), future)
        .await
}

/// The id of the request being served, if any. Echoed in response metadata
/// and error bodies.
pub fn current_request_id() -> Option<RequestId> {
    CURRENT_REQUEST_ID
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Coarse classification of a request path for log filtering.
fn flow_for_path(path: &str) -> &'static str {
    if path.starts_with("/api/webhooks/") {
        "webhook"
    } else if path.starts_with("/payments/callback") {
        "callback"
    } else if path.starts_with("/api/v1/checkout") || path.starts_with("/api/v1/payments") {
        "checkout"
    } else if path.starts_with("/api/v1/cart") {
        "cart"
    } else {
        "other"
    }
}

#[derive(Clone, Default)]
pub struct StorefrontSpanMaker;

impl<B> MakeSpan<B> for StorefrontSpanMaker {
    fn make_span(&mut self, request: &Request<B>) -> tracing::Span {
        let headers = request.headers();
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .cloned()
            .or_else(|| {
                headers
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(RequestId::new)
            })
            .unwrap_or_default();
        let customer = headers
            .get(CUSTOMER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        tracing::info_span!(
            "http.request",
            request_id = %request_id,
            method = %request.method(),
            path = %request.uri().path(),
            flow = flow_for_path(request.uri().path()),
            customer = %customer,
        )
    }
}

/// HTTP tracing layer; provider declines surface as 4xx and are not failures.
pub fn configure_http_tracing() -> TraceLayer<
    SharedClassifier<StatusInRangeAsFailures>,
    StorefrontSpanMaker,
    DefaultOnRequest,
    DefaultOnResponse,
> {
    TraceLayer::new(SharedClassifier::new(StatusInRangeAsFailures::new(500..=599)))
        .make_span_with(StorefrontSpanMaker)
        .on_request(DefaultOnRequest::default())
        .on_response(DefaultOnResponse::default())
        .on_failure(DefaultOnFailure::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_id_is_visible_inside_scope_only() {
        assert!(current_request_id().is_none());
        let seen = scope_request_id(RequestId::new("abc"), async { current_request_id() }).await;
        assert_eq!(seen, Some(RequestId::new("abc")));
        assert!(current_request_id().is_none());
    }

    #[test]
    fn paths_are_tagged_by_flow() {
        assert_eq!(flow_for_path("/api/webhooks/tabby"), "webhook");
        assert_eq!(flow_for_path("/payments/callback"), "callback");
        assert_eq!(flow_for_path("/api/v1/checkout/tabby-eligibility"), "checkout");
        assert_eq!(flow_for_path("/api/v1/payments/hyperpay/abc"), "checkout");
        assert_eq!(flow_for_path("/api/v1/cart/items"), "cart");
        assert_eq!(flow_for_path("/health"), "other");
    }
}
