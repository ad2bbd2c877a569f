use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Payments API",
        version = "0.1.0",
        description = r#"
# Storefront Payments API

Cart, checkout and payment reconciliation for a storefront selling through
Tabby (pay later in installments) and HyperPay (MADA, Visa, Mastercard).

## Shopper identity

Shopper endpoints read the signed-in customer from the `x-customer-id` header set
by the upstream auth layer. `Accept-Language: ar` switches payment method labels and
provider pages to Arabic.

## Error Handling

Failing JSON endpoints answer with:

```json
{
  "error": "Bad Request",
  "message": "Cart is empty",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```

Provider declines carry a `reason` code and status 402.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Cart", description = "The shopper's cart"),
        (name = "Checkout", description = "Order placement and payment method selection"),
        (name = "Payments", description = "Provider callbacks, webhooks and widget data"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Cart
        crate::handlers::commerce::carts::get_cart,
        crate::handlers::commerce::carts::add_item,
        crate::handlers::commerce::carts::set_item_quantity,
        crate::handlers::commerce::carts::decrement_item,
        crate::handlers::commerce::carts::remove_item,

        // Checkout
        crate::handlers::commerce::checkout::checkout_summary,
        crate::handlers::commerce::checkout::start_checkout,
        crate::handlers::commerce::checkout::tabby_eligibility,

        // Payments
        crate::handlers::payments::hyperpay_checkout,
        crate::handlers::payments::payment_callback,

        // Webhooks
        crate::handlers::payment_webhooks::tabby_webhook,

        // Health
        crate::handlers::health::liveness_check,
        crate::handlers::health::readiness_check,
    ),
    components(
        schemas(
            crate::money::Money,
            crate::money::Currency,
            crate::services::commerce::CartView,
            crate::services::commerce::CartLineView,
            crate::services::commerce::CartTotal,
            crate::services::commerce::AddressInput,
            crate::handlers::commerce::carts::AddItemRequest,
            crate::handlers::commerce::carts::UpdateQuantityRequest,
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CheckoutResponse,
            crate::services::checkout::CheckoutSummary,
            crate::services::payments::PaymentMethodDescriptor,
            crate::services::payments::Locale,
            crate::services::payments::EligibilityRequest,
            crate::services::payments::tabby::EligibilityBuyer,
            crate::services::payments::EligibilityResponse,
            crate::services::payments::HyperPayCheckoutDetails,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_checkout_and_webhook_paths() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront Payments API"));
        assert!(json.contains("/api/v1/checkout"));
        assert!(json.contains("/api/webhooks/tabby"));
        assert!(json.contains("/api/v1/cart/items/{product_id}"));
    }
}
