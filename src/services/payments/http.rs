use crate::errors::ServiceError;
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::error;

/// HTTP client shared by provider integrations; every call carries `timeout`.
pub fn provider_client(timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("storefront-payments/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))
}

/// Reads a JSON body, turning non-2xx responses into `ExternalApiError`.
pub async fn read_json(provider: &str, operation: &str, response: Response) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        error!(provider, operation, status = status.as_u16(), body = %body, "Provider returned an error status");
        return Err(ServiceError::ExternalApiError(format!(
            "{} {} returned {}",
            provider, operation, status
        )));
    }

    serde_json::from_str(&body).map_err(|e| {
        error!(provider, operation, error = %e, "Provider returned malformed JSON");
        ServiceError::ExternalApiError(format!("{} {} returned malformed JSON", provider, operation))
    })
}

/// Reads an amount that providers send either as a string or a number.
pub fn decimal_value(value: &Value) -> Option<rust_decimal::Decimal> {
    use std::str::FromStr;
    match value {
        Value::String(s) => rust_decimal::Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => rust_decimal::Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
