//! Checkout over HTTP: order materialization and payment session start.

mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, tabby_session, TestApp, HYPERPAY_ENTITY, TABBY_SECRET};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use std::str::FromStr;
use storefront_payments::entities::{
    order::OrderStatus,
    order_item,
    payment::{GatewayKind, PaymentStatus},
    commerce::product,
};
use wiremock::{
    matchers::{body_partial_json, body_string_contains, header, method, path},
    Mock, ResponseTemplate,
};

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("decimal string")).expect("valid decimal")
}

#[tokio::test]
async fn checkout_summary_offers_both_gateways() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("summary@example.com", dec!(499.00), 1).await;

    let response = app
        .request(
            Method::GET,
            "/api/v1/checkout",
            None,
            Some(customer.id),
            &[("accept-language", "ar")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    let totals = &body["data"]["cart"]["totals"];
    assert_eq!(decimal(&totals["subtotal"]["amount"]), dec!(499.00));
    assert_eq!(decimal(&totals["tax"]["amount"]), dec!(74.85));
    assert_eq!(decimal(&totals["total"]["amount"]), dec!(573.85));

    let methods = body["data"]["payment_methods"].as_array().expect("methods");
    let ids: Vec<&str> = methods.iter().filter_map(|m| m["id"].as_str()).collect();
    assert_eq!(ids, vec!["tabby", "hyperpay"]);
    assert_eq!(methods[0]["name"], "ادفع لاحقاً مع تابي");
    assert_eq!(decimal(&methods[0]["total"]["amount"]), dec!(573.85));
}

#[tokio::test]
async fn unconfigured_gateway_is_not_offered() {
    let app = TestApp::with_config(|cfg| cfg.tabby.secret_key.clear()).await;
    let (customer, _) = app.shopper_with_cart("notabby@example.com", dec!(100), 1).await;

    let body = response_json(
        app.request_as(customer.id, Method::GET, "/api/v1/checkout", None)
            .await,
    )
    .await;
    let methods = body["data"]["payment_methods"].as_array().expect("methods");
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0]["id"], "hyperpay");

    let ready = app
        .request(Method::GET, "/health/ready", None, None, &[])
        .await;
    assert_eq!(ready.status(), StatusCode::OK);
    let body = response_json(ready).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["gateways"]["tabby"], false);
    assert_eq!(body["gateways"]["hyperpay"], true);
}

#[tokio::test]
async fn checkout_requires_a_shopper() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "tabby" })),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn empty_cart_is_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("empty@example.com").await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "tabby" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["message"], "Cart is empty");

    assert!(app.orders().await.is_empty());
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn unknown_payment_method_creates_no_order() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("unknown@example.com", dec!(50), 2).await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "cash_on_delivery" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.orders().await.is_empty());
}

#[tokio::test]
async fn tabby_checkout_creates_order_and_one_pending_payment() {
    let app = TestApp::new().await;
    let (customer, product) = app.shopper_with_cart("tabby@example.com", dec!(499.00), 1).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .and(header("authorization", format!("Bearer {}", TABBY_SECRET).as_str()))
        .and(body_partial_json(json!({
            "payment": { "amount": "573.85", "currency": "SAR" },
            "merchant_code": "NWSA",
            "lang": "en"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(tabby_session("tabby-pay-1")))
        .expect(1)
        .mount(&app.tabby)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({
                "payment_method": "tabby",
                "shipping_address": {
                    "name": "Sara Al-Harbi",
                    "address": "King Fahd Rd 12",
                    "city": "Riyadh",
                    "zip": "12271",
                    "country": "SA"
                }
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(
        body["data"]["redirect_url"],
        "https://checkout.tabby.ai/tabby-pay-1"
    );
    let order_number = body["data"]["order_number"].as_str().expect("order number");
    assert!(order_number.starts_with("ORD-"));

    let orders = app.orders().await;
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.total, dec!(573.85));
    assert_eq!(order.shipping_city.as_deref(), Some("Riyadh"));

    let payments = app.payments().await;
    assert_eq!(payments.len(), 1);
    let payment = &payments[0];
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.gateway, GatewayKind::Tabby);
    assert_eq!(payment.external_reference, "tabby-pay-1");
    assert_eq!(payment.payable_id, order.id);
    assert_eq!(payment.amount, dec!(573.85));

    // Cart is kept until the payment succeeds.
    assert_eq!(app.cart_item_count(customer.id).await, 1);

    // Later price changes do not touch the frozen order lines.
    let mut repriced: product::ActiveModel = product.into();
    repriced.price = Set(dec!(999.00));
    repriced.update(app.db()).await.expect("reprice product");
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(app.db())
        .await
        .expect("order items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].unit_price, dec!(499.00));
    assert_eq!(items[0].quantity, 1);
    assert_eq!(items[0].subtotal, dec!(499.00));
    assert_eq!(items[0].total, dec!(499.00));
    let stored_order = storefront_payments::entities::order::Entity::find_by_id(order.id)
        .one(app.db())
        .await
        .expect("order query")
        .expect("order");
    assert_eq!(stored_order.total, dec!(573.85));
}

#[tokio::test]
async fn tabby_rejection_surfaces_reason_and_stores_no_payment() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("rejected@example.com", dec!(9000), 1).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "rejected",
            "configuration": {
                "products": { "installments": { "rejection_reason": "order_amount_too_high" } }
            }
        })))
        .mount(&app.tabby)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "tabby" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = response_json(response).await;
    assert_eq!(body["reason"], "order_amount_too_high");
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn session_without_checkout_url_is_a_hard_failure() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("nourl@example.com", dec!(200), 1).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "created",
            "payment": { "id": "tabby-pay-2" },
            "configuration": { "available_products": { "installments": [] } }
        })))
        .mount(&app.tabby)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "tabby" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn provider_outage_creates_no_payment() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("outage@example.com", dec!(200), 1).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.tabby)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "tabby" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = response_json(response).await;
    assert_eq!(body["message"], "Payment error, please try again");
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn hyperpay_checkout_redirects_to_widget_page() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("card@example.com", dec!(100), 2).await;

    Mock::given(method("POST"))
        .and(path("/v1/checkouts"))
        .and(body_string_contains(format!("entityId={}", HYPERPAY_ENTITY)))
        .and(body_string_contains("amount=230.00"))
        .and(body_string_contains("paymentType=DB"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "hp-checkout-1",
            "integrity": "sha384-abc",
            "result": { "code": "000.200.100", "description": "successfully created checkout" }
        })))
        .expect(1)
        .mount(&app.hyperpay)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "hyperpay" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    let payment_id = body["data"]["payment_id"].as_str().expect("payment id");
    assert_eq!(
        body["data"]["redirect_url"],
        format!("http://localhost:8080/payments/hyperpay/{}", payment_id)
    );

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/hyperpay/{}", payment_id),
            None,
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let details = response_json(response).await;
    assert_eq!(details["data"]["checkout_id"], "hp-checkout-1");
    assert_eq!(details["data"]["integrity"], "sha384-abc");
    assert_eq!(
        details["data"]["widget_script_url"],
        format!("{}/v1/paymentWidgets.js?checkoutId=hp-checkout-1", app.hyperpay.uri())
    );
    assert_eq!(
        details["data"]["shopper_result_url"],
        "http://localhost:8080/payments/callback"
    );
}

#[tokio::test]
async fn hyperpay_unexpected_result_code_fails_checkout() {
    let app = TestApp::new().await;
    let (customer, _) = app.shopper_with_cart("badcode@example.com", dec!(100), 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/checkouts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "hp-checkout-2",
            "result": { "code": "200.300.404", "description": "invalid or missing parameter" }
        })))
        .mount(&app.hyperpay)
        .await;

    let response = app
        .request_as(
            customer.id,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "hyperpay" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn tabby_eligibility_reports_verdict_without_persisting() {
    let app = TestApp::new().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .and(body_partial_json(json!({
            "payment": { "amount": "414.00", "currency": "SAR" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(tabby_session("precheck")))
        .mount(&app.tabby)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/tabby-eligibility",
            Some(json!({
                "amount": "414",
                "currency": "SAR",
                "buyer": { "email": "buyer@example.com", "phone": "0501234567" }
            })),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["eligible"], true);
    assert_eq!(body["data"]["status"], "created");
    assert!(app.payments().await.is_empty());
}

#[tokio::test]
async fn tabby_eligibility_degrades_on_provider_error() {
    let app = TestApp::new().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/checkout"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.tabby)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/tabby-eligibility",
            Some(json!({
                "amount": "414",
                "currency": "SAR",
                "buyer": { "email": "buyer@example.com" }
            })),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["eligible"], false);
    assert_eq!(body["data"]["reason"], "api_error");
}

#[tokio::test]
async fn tabby_eligibility_validates_request() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/tabby-eligibility",
            Some(json!({
                "amount": "0",
                "currency": "SAR",
                "buyer": { "email": "not-an-email" }
            })),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
