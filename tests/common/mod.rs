#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_payments::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        commerce::{cart_item, product, CartItem, CustomerModel, ProductModel},
        order, payment,
    },
    events::{self, EventSender},
    services::commerce::RegisterCustomerInput,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

pub const TABBY_SECRET: &str = "sk_test_storefront";
pub const HYPERPAY_TOKEN: &str = "hp_test_token";
pub const HYPERPAY_ENTITY: &str = "8ac7a4c9";

/// Application state over an in-memory SQLite database, with both payment
/// providers replaced by local mock servers.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub tabby: MockServer,
    pub hyperpay: MockServer,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let tabby = MockServer::start().await;
        let hyperpay = MockServer::start().await;

        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.tabby.base_url = tabby.uri();
        cfg.tabby.secret_key = TABBY_SECRET.to_string();
        cfg.tabby.public_key = "pk_test_storefront".to_string();
        cfg.hyperpay.base_url = hyperpay.uri();
        cfg.hyperpay.access_token = HYPERPAY_TOKEN.to_string();
        cfg.hyperpay.entity_id = HYPERPAY_ENTITY.to_string();
        cfg.provider_timeout_secs = 5;
        adjust(&mut cfg);

        // One connection, so every query sees the same in-memory database.
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), Arc::new(cfg), event_sender)
            .expect("failed to build app state");
        let router = storefront_payments::app_router(state.clone());

        Self {
            router,
            state,
            tabby,
            hyperpay,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Send a request as `customer` (when given) with extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        customer: Option<Uuid>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(customer_id) = customer {
            builder = builder.header("x-customer-id", customer_id.to_string());
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn request_as(
        &self,
        customer: Uuid,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.request(method, uri, body, Some(customer), &[]).await
    }

    pub async fn seed_customer(&self, email: &str) -> CustomerModel {
        self.state
            .services
            .customers
            .register_customer(RegisterCustomerInput {
                name: "Sara Al-Harbi".to_string(),
                email: email.to_string(),
                phone: Some("0501234567".to_string()),
                date_of_birth: None,
            })
            .await
            .expect("seed customer for tests")
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal) -> ProductModel {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Product {}", sku)),
            sku: Set(sku.to_string()),
            category: Set(Some("Electronics".to_string())),
            price: Set(price),
            sale_price: Set(None),
            currency: Set("SAR".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product for tests")
    }

    /// Seeds a customer with `quantity` of a product priced `price` in their cart.
    pub async fn shopper_with_cart(
        &self,
        email: &str,
        price: Decimal,
        quantity: i32,
    ) -> (CustomerModel, ProductModel) {
        let customer = self.seed_customer(email).await;
        let product = self.seed_product(&format!("SKU-{}", email), price).await;
        let carts = &self.state.services.carts;
        let cart = carts
            .get_or_create_for_customer(customer.id)
            .await
            .expect("customer cart");
        carts
            .add_item(cart.id, product.id, quantity)
            .await
            .expect("add item to cart");
        (customer, product)
    }

    pub async fn cart_item_count(&self, customer_id: Uuid) -> usize {
        let cart = self
            .state
            .services
            .carts
            .get_or_create_for_customer(customer_id)
            .await
            .expect("customer cart");
        CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(self.db())
            .await
            .expect("cart items")
            .len()
    }

    pub async fn payments(&self) -> Vec<payment::Model> {
        payment::Entity::find()
            .all(self.db())
            .await
            .expect("payments")
    }

    pub async fn payment(&self, id: Uuid) -> payment::Model {
        payment::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("payment query")
            .expect("payment exists")
    }

    pub async fn orders(&self) -> Vec<order::Model> {
        order::Entity::find().all(self.db()).await.expect("orders")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// A successful installment session response.
pub fn tabby_session(payment_id: &str) -> Value {
    json!({
        "id": format!("session-{}", payment_id),
        "status": "created",
        "payment": { "id": payment_id },
        "configuration": {
            "available_products": {
                "installments": [
                    { "web_url": format!("https://checkout.tabby.ai/{}", payment_id) }
                ]
            }
        }
    })
}

/// A lender payment lookup response.
pub fn tabby_payment(payment_id: &str, status: &str, amount: &str) -> Value {
    json!({
        "id": payment_id,
        "status": status,
        "amount": amount,
        "currency": "SAR",
    })
}
