use crate::{
    entities::commerce::CustomerModel, errors::ServiceError, services::payments::Locale,
    ApiResponse, AppState,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::ACCEPT_LANGUAGE, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::convert::Infallible;
use uuid::Uuid;
use validator::Validate;

/// Header set by the upstream auth layer for the signed-in shopper
pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input
        .validate()
        .map_err(|e| ServiceError::ValidationError(format!("Validation failed: {}", e)))
}

/// The signed-in shopper, resolved from [`CUSTOMER_ID_HEADER`].
#[derive(Debug, Clone)]
pub struct CustomerContext(pub CustomerModel);

impl CustomerContext {
    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn into_inner(self) -> CustomerModel {
        self.0
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CustomerContext {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CUSTOMER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Sign in to continue".to_string()))?;
        let customer_id = Uuid::parse_str(raw).map_err(|_| {
            ServiceError::BadRequest(format!("{} must be a UUID", CUSTOMER_ID_HEADER))
        })?;

        state
            .services
            .customers
            .find(customer_id)
            .await?
            .map(CustomerContext)
            .ok_or_else(|| ServiceError::Unauthorized("Unknown customer".to_string()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Locale
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok())
            .map(Locale::from_accept_language)
            .unwrap_or_default())
    }
}
