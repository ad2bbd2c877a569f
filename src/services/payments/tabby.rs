//! Tabby installment payments: checkout sessions, eligibility pre-checks,
//! payment lookups and captures.

use crate::{
    config::{AppConfig, TabbyConfig},
    entities::{
        commerce::CustomerModel,
        payment::{self, GatewayKind},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::{Currency, Money},
    services::{
        commerce::{AddressInput, OrderService, OrderWithItems},
        payments::{
            gateway::{
                CallbackParams, Locale, PaymentContext, PaymentGateway, PaymentMethodDescriptor,
                PaymentProvider, ProviderLookup, ProviderPaymentState, StartedPayment,
            },
            http::{decimal_value, provider_client, read_json},
            payable::Payable,
            phone::to_e164,
            reconciliation::{PaymentReconciler, ReconcileOutcome, ReconcileSource},
            status::map_tabby_status,
            store::{self, NewPayment},
        },
    },
};
use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const METHOD_ID: &str = "tabby";
const PROVIDER: &str = "tabby";
const LOGO_URL: &str = "https://www.pfgrowth.com/wp-content/uploads/2023/03/tabby-logo-1.png";
const DEFAULT_REJECTION_REASON: &str = "not_available";

/// Thin client over the Tabby REST API.
#[derive(Clone)]
pub struct TabbyClient {
    http: reqwest::Client,
    config: TabbyConfig,
}

impl TabbyClient {
    pub fn new(config: TabbyConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// `POST /api/v2/checkout`
    pub async fn create_checkout(&self, payload: &Value) -> Result<Value, ServiceError> {
        let response = self
            .http
            .post(self.url("/api/v2/checkout"))
            .bearer_auth(&self.config.secret_key)
            .json(payload)
            .send()
            .await?;
        read_json(PROVIDER, "checkout", response).await
    }

    /// `GET /api/v2/payments/{id}`
    pub async fn get_payment(&self, payment_id: &str) -> Result<Value, ServiceError> {
        let response = self
            .http
            .get(self.url(&format!("/api/v2/payments/{}", payment_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        read_json(PROVIDER, "payment lookup", response).await
    }

    /// `POST /api/v2/payments/{id}/captures`
    pub async fn capture_payment(
        &self,
        payment_id: &str,
        amount: &str,
        reference_id: &str,
    ) -> Result<Value, ServiceError> {
        let response = self
            .http
            .post(self.url(&format!("/api/v2/payments/{}/captures", payment_id)))
            .bearer_auth(&self.config.secret_key)
            .json(&json!({ "amount": amount, "reference_id": reference_id }))
            .send()
            .await?;
        read_json(PROVIDER, "capture", response).await
    }
}

#[async_trait]
impl PaymentProvider for TabbyClient {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Tabby
    }

    async fn fetch_status(
        &self,
        lookup: &ProviderLookup,
    ) -> Result<ProviderPaymentState, ServiceError> {
        let raw = self.get_payment(&lookup.external_reference).await?;
        let provider_status = raw
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ExternalApiError("tabby payment lookup has no status".to_string())
            })?
            .to_string();
        let mapped = map_tabby_status(&provider_status);

        Ok(ProviderPaymentState {
            status: mapped.status,
            settlement: mapped.settlement,
            amount: raw.get("amount").and_then(decimal_value),
            currency: raw
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            provider_status,
            raw,
        })
    }

    async fn capture(
        &self,
        payment: &payment::Model,
        amount: &Money,
    ) -> Result<Value, ServiceError> {
        self.capture_payment(
            &payment.external_reference,
            &amount.to_minor_string(),
            &payment.payable_id.to_string(),
        )
        .await
    }
}

/// A successfully created checkout session.
#[derive(Debug, Clone, PartialEq)]
pub struct TabbySession {
    pub payment_id: String,
    pub web_url: String,
    pub raw: Value,
}

/// Extracts the payment id and hosted checkout URL from a session response.
pub fn parse_session(raw: Value) -> Result<TabbySession, ServiceError> {
    let status = raw.get("status").and_then(Value::as_str).unwrap_or_default();
    if status != "created" {
        let reason = rejection_reason(&raw);
        info!(status, %reason, "Tabby declined the session");
        return Err(ServiceError::PaymentRejected { reason });
    }

    let payment_id = raw
        .pointer("/payment/id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ServiceError::ExternalApiError("tabby session has no payment id".to_string())
        })?
        .to_string();
    let web_url = raw
        .pointer("/configuration/available_products/installments/0/web_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            ServiceError::ExternalApiError("tabby session has no checkout URL".to_string())
        })?
        .to_string();

    Ok(TabbySession {
        payment_id,
        web_url,
        raw,
    })
}

fn rejection_reason(raw: &Value) -> String {
    raw.pointer("/configuration/products/installments/rejection_reason")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_REJECTION_REASON)
        .to_string()
}

/// Buyer facts sent alongside a session for risk scoring.
#[derive(Debug, Clone)]
pub struct BuyerProfile<'a> {
    pub customer: &'a CustomerModel,
    pub history: &'a [OrderWithItems],
    pub completed_orders: u64,
}

/// Builds the `POST /api/v2/checkout` body for a payable.
pub fn checkout_payload(
    payable: &dyn Payable,
    buyer: &BuyerProfile<'_>,
    locale: Locale,
    config: &AppConfig,
) -> Value {
    let total = payable.total_price();
    let currency = total.currency().code().to_string();
    let shipping = payable.shipping_address();
    let phone = buyer
        .customer
        .phone
        .as_deref()
        .or_else(|| shipping.as_ref().and_then(|a| a.phone.as_deref()))
        .map(|p| to_e164(p, &config.default_phone_region));

    let items: Vec<Value> = payable
        .items()
        .into_iter()
        .map(|item| {
            json!({
                "title": item.title,
                "quantity": item.quantity,
                "unit_price": item.unit_price.to_minor_string(),
                "category": item.category.unwrap_or_else(|| config.tabby.item_category.clone()),
                "reference_id": item.reference_id,
            })
        })
        .collect();

    let mut payment = json!({
        "amount": total.to_minor_string(),
        "currency": currency,
        "description": format!("Order {}", payable.reference()),
        "buyer": buyer_json(buyer.customer, phone.as_deref()),
        "order": {
            "reference_id": payable.reference(),
            "tax_amount": payable.tax_amount().to_minor_string(),
            "shipping_amount": payable.shipping_amount().to_minor_string(),
            "discount_amount": payable.discount_amount().to_minor_string(),
            "items": items,
        },
        "buyer_history": {
            "registered_since": buyer.customer.created_at.to_rfc3339(),
            "loyalty_level": buyer.completed_orders,
        },
        "order_history": buyer
            .history
            .iter()
            .map(|order| history_entry(order, buyer.customer, phone.as_deref(), config))
            .collect::<Vec<_>>(),
    });
    if let Some(address) = shipping.as_ref().and_then(shipping_json) {
        payment["shipping_address"] = address;
    }

    let callback = config.public_url("/payments/callback");
    json!({
        "payment": payment,
        "lang": locale.as_str(),
        "merchant_code": config.tabby.merchant_code,
        "merchant_urls": {
            "success": callback,
            "cancel": callback,
            "failure": callback,
        },
    })
}

fn buyer_json(customer: &CustomerModel, phone: Option<&str>) -> Value {
    let mut buyer = json!({
        "name": customer.name,
        "email": customer.email,
        "phone": phone,
    });
    if let Some(dob) = customer.date_of_birth {
        buyer["dob"] = json!(dob.format("%Y-%m-%d").to_string());
    }
    buyer
}

fn shipping_json(address: &AddressInput) -> Option<Value> {
    let line = address.address.as_deref()?;
    Some(json!({
        "city": address.city.clone().unwrap_or_default(),
        "address": line,
        "zip": address.zip.clone().unwrap_or_default(),
    }))
}

fn history_entry(
    history: &OrderWithItems,
    customer: &CustomerModel,
    phone: Option<&str>,
    config: &AppConfig,
) -> Value {
    let order = &history.order;
    let currency = Currency::new(&order.currency).ok();
    let amount = |value: Decimal| match &currency {
        Some(currency) => Money::of(value, currency.clone()).to_minor_string(),
        None => value.round_dp(2).to_string(),
    };

    let mut entry = json!({
        "purchased_at": order.created_at.to_rfc3339(),
        "amount": amount(order.total),
        "status": order.status.to_string(),
        "buyer": buyer_json(customer, phone),
        "items": history
            .items
            .iter()
            .map(|item| json!({
                "title": item.product_name,
                "quantity": item.quantity,
                "unit_price": amount(item.unit_price),
                "category": item.category.clone().unwrap_or_else(|| config.tabby.item_category.clone()),
                "reference_id": item.product_id.unwrap_or(item.id).to_string(),
            }))
            .collect::<Vec<_>>(),
    });
    if let Some(address) = order.shipping_address.as_deref() {
        entry["shipping_address"] = json!({
            "city": order.shipping_city.clone().unwrap_or_default(),
            "address": address,
            "zip": order.shipping_zip.clone().unwrap_or_default(),
        });
    }
    entry
}

fn validate_positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        let mut err = ValidationError::new("amount");
        err.message = Some("amount must be positive".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct EligibilityBuyer {
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(max = 255))]
    pub name: Option<String>,
}

/// Pre-check request; nothing is persisted.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct EligibilityRequest {
    #[validate(custom = "validate_positive_amount")]
    #[schema(value_type = f64, example = 414.0)]
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate]
    pub buyer: EligibilityBuyer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct EligibilityResponse {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EligibilityResponse {
    fn ineligible(reason: &str) -> Self {
        Self {
            eligible: false,
            status: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Tabby as a checkout gateway.
#[derive(Clone)]
pub struct TabbyGateway {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    client: TabbyClient,
    orders: OrderService,
    reconciler: PaymentReconciler,
    event_sender: EventSender,
}

impl TabbyGateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        orders: OrderService,
        reconciler: PaymentReconciler,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let http = provider_client(config.provider_timeout())?;
        let client = TabbyClient::new(config.tabby.clone(), http);
        Ok(Self {
            db,
            config,
            client,
            orders,
            reconciler,
            event_sender,
        })
    }

    pub fn client(&self) -> &TabbyClient {
        &self.client
    }

    fn is_available_for(&self, currency: &Currency) -> bool {
        self.config.tabby.is_configured() && self.config.tabby.supports_currency(currency.code())
    }

    /// Asks Tabby whether the buyer could pay `amount` in installments.
    /// Provider failures produce an ineligible answer rather than an error.
    #[instrument(skip(self, request), fields(currency = %request.currency))]
    pub async fn check_eligibility(
        &self,
        request: &EligibilityRequest,
        locale: Locale,
    ) -> Result<EligibilityResponse, ServiceError> {
        request.validate()?;
        let currency = Currency::new(&request.currency)?;
        if !self.is_available_for(&currency) {
            return Ok(EligibilityResponse::ineligible(DEFAULT_REJECTION_REASON));
        }

        let amount = Money::of(request.amount, currency.clone());
        let phone = request
            .buyer
            .phone
            .as_deref()
            .map(|p| to_e164(p, &self.config.default_phone_region));
        let payload = json!({
            "payment": {
                "amount": amount.to_minor_string(),
                "currency": currency.code(),
                "buyer": {
                    "phone": phone,
                    "email": request.buyer.email,
                    "name": request.buyer.name.clone().unwrap_or_else(|| "Customer".to_string()),
                },
                "order": {
                    "reference_id": format!("precheck-{}", Uuid::new_v4()),
                    "items": [],
                },
            },
            "lang": locale.as_str(),
            "merchant_code": self.config.tabby.merchant_code,
        });

        let raw = match self.client.create_checkout(&payload).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "Tabby eligibility check failed");
                return Ok(EligibilityResponse::ineligible("api_error"));
            }
        };

        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let eligible = status == "created";
        counter!("storefront_payments.eligibility_checks", 1, "eligible" => eligible.to_string());
        Ok(EligibilityResponse {
            eligible,
            reason: (!eligible).then(|| rejection_reason(&raw)),
            status: Some(status),
        })
    }

    /// Reconciles a webhook delivery for `payment_id`.
    pub async fn handle_webhook(&self, payment_id: &str) -> Result<ReconcileOutcome, ServiceError> {
        self.reconciler
            .reconcile(
                &self.client,
                &ProviderLookup::by_reference(payment_id),
                ReconcileSource::Webhook,
            )
            .await
    }
}

#[async_trait]
impl PaymentGateway for TabbyGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Tabby
    }

    fn payment_methods(&self, price: &Money, locale: Locale) -> Vec<PaymentMethodDescriptor> {
        if !self.is_available_for(price.currency()) {
            return Vec::new();
        }
        let name = match locale {
            Locale::Ar => "ادفع لاحقاً مع تابي",
            Locale::En => "Pay later with Tabby",
        };
        vec![PaymentMethodDescriptor {
            id: METHOD_ID.to_string(),
            gateway: GatewayKind::Tabby.to_string(),
            name: name.to_string(),
            service_charge: Money::zero(price.currency().clone()),
            total: price.round_half_up(),
            logo: LOGO_URL.to_string(),
        }]
    }

    #[instrument(skip(self, payable, ctx), fields(payable_id = %payable.id(), customer_id = %ctx.customer.id))]
    async fn start(
        &self,
        payable: &dyn Payable,
        method_id: &str,
        ctx: &PaymentContext,
    ) -> Result<StartedPayment, ServiceError> {
        if method_id != METHOD_ID {
            return Err(ServiceError::ValidationError(format!(
                "unknown Tabby payment method: {}",
                method_id
            )));
        }
        let total = payable.total_price();
        if !self.is_available_for(total.currency()) {
            return Err(ServiceError::InvalidOperation(format!(
                "Tabby is not available for {}",
                total.currency()
            )));
        }

        let owner = payable.owner_customer();
        let history = self
            .orders
            .recent_orders(owner, Some(payable.id()), self.config.order_history_limit)
            .await?;
        let completed_orders = self
            .orders
            .completed_order_count(owner, Some(payable.id()))
            .await?;
        let payload = checkout_payload(
            payable,
            &BuyerProfile {
                customer: &ctx.customer,
                history: &history,
                completed_orders,
            },
            ctx.locale,
            &self.config,
        );

        let session = match self.client.create_checkout(&payload).await.and_then(parse_session) {
            Ok(session) => session,
            Err(err) => {
                if matches!(err, ServiceError::PaymentRejected { .. }) {
                    warn!(error = %err, "Tabby session rejected");
                } else {
                    error!(error = %err, reference = payable.reference(), "Tabby session creation failed");
                }
                counter!("storefront_payments.session_failures", 1, "gateway" => PROVIDER);
                return Err(err);
            }
        };

        let payment = store::create_pending(
            &*self.db,
            NewPayment {
                payable_type: payable.kind(),
                payable_id: payable.id(),
                customer_id: Some(owner),
                gateway: GatewayKind::Tabby,
                external_reference: session.payment_id.clone(),
                amount: total.amount(),
                currency: total.currency().code().to_string(),
                details: session.raw,
            },
        )
        .await?;

        info!(payment_id = %payment.id, external_reference = %payment.external_reference, "Tabby session created");
        counter!("storefront_payments.sessions_started", 1, "gateway" => PROVIDER);
        self.event_sender.send_or_log(Event::PaymentStarted {
            payment_id: payment.id,
            gateway: GatewayKind::Tabby,
        });

        Ok(StartedPayment {
            payment,
            redirect_url: session.web_url,
        })
    }

    #[instrument(skip(self, params))]
    async fn callback(&self, params: &CallbackParams) -> Result<payment::Model, ServiceError> {
        let payment_id = params
            .payment_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::BadRequest("Payment ID not provided in callback".to_string())
            })?;

        self.reconciler
            .reconcile(
                &self.client,
                &ProviderLookup::by_reference(payment_id),
                ReconcileSource::Callback,
            )
            .await?
            .into_payment()
            .ok_or_else(|| {
                error!(payment_id, "Tabby callback for unknown payment");
                ServiceError::NotFound("Payment record not found".to_string())
            })
    }
}
