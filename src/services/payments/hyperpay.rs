//! HyperPay card payments (MADA, Visa, Mastercard) via the hosted COPYandPAY widget.

use crate::{
    config::{AppConfig, HyperPayConfig},
    entities::payment::{self, GatewayKind, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    money::{Currency, Money},
    services::payments::{
        gateway::{
            CallbackParams, Locale, PaymentContext, PaymentGateway, PaymentMethodDescriptor,
            PaymentProvider, ProviderLookup, ProviderPaymentState, StartedPayment,
        },
        http::{decimal_value, provider_client, read_json},
        payable::Payable,
        reconciliation::{PaymentReconciler, ReconcileSource},
        status::{classify_result_code, is_checkout_created},
        store::{self, NewPayment},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

pub const METHOD_ID: &str = "hyperpay";
const PROVIDER: &str = "hyperpay";
const LOGO_URL: &str =
    "https://www.hyperpay.com/wp-content/themes/hyperpaycustomtheme/assets/logo.svg";
const DEFAULT_BILLING_COUNTRY: &str = "SA";

static CHECKOUT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/checkouts/([^/]+)/payment").expect("valid checkout id pattern"));

/// Pulls the checkout id out of `/v1/checkouts/{id}/payment`.
pub fn checkout_id_from_resource_path(resource_path: &str) -> Option<String> {
    CHECKOUT_ID_RE
        .captures(resource_path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Splits a full name once on the first space.
pub fn split_name(full_name: &str) -> (String, String) {
    let full_name = full_name.trim();
    let mut parts = full_name.splitn(2, ' ');
    let given = parts
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Customer")
        .to_string();
    let surname = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("User")
        .to_string();
    (given, surname)
}

#[derive(Clone)]
pub struct HyperPayClient {
    http: reqwest::Client,
    config: HyperPayConfig,
}

impl HyperPayClient {
    pub fn new(config: HyperPayConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// `POST /v1/checkouts` (form encoded)
    pub async fn prepare_checkout(&self, form: &[(String, String)]) -> Result<Value, ServiceError> {
        let response = self
            .http
            .post(format!("{}/v1/checkouts", self.base_url()))
            .bearer_auth(&self.config.access_token)
            .form(form)
            .send()
            .await?;
        read_json(PROVIDER, "checkout preparation", response).await
    }

    /// `GET {resource_path}?entityId=...`
    pub async fn payment_status(&self, resource_path: &str) -> Result<Value, ServiceError> {
        let path = if resource_path.starts_with('/') {
            resource_path.to_string()
        } else {
            format!("/{}", resource_path)
        };
        let mut url = Url::parse(&format!("{}{}", self.base_url(), path)).map_err(|e| {
            ServiceError::BadRequest(format!("invalid HyperPay resource path: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("entityId", &self.config.entity_id);

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        read_json(PROVIDER, "payment status", response).await
    }

    pub fn widget_script_url(&self, checkout_id: &str) -> String {
        format!(
            "{}/v1/paymentWidgets.js?checkoutId={}",
            self.base_url(),
            checkout_id
        )
    }
}

#[async_trait]
impl PaymentProvider for HyperPayClient {
    fn kind(&self) -> GatewayKind {
        GatewayKind::HyperPay
    }

    fn status_detail_key(&self) -> &'static str {
        "result_code"
    }

    async fn fetch_status(
        &self,
        lookup: &ProviderLookup,
    ) -> Result<ProviderPaymentState, ServiceError> {
        let path = lookup
            .resource_path
            .clone()
            .unwrap_or_else(|| format!("/v1/checkouts/{}/payment", lookup.external_reference));
        let raw = self.payment_status(&path).await?;
        let code = raw
            .pointer("/result/code")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ExternalApiError("hyperpay status has no result code".to_string())
            })?
            .to_string();
        let mapped = classify_result_code(&code);

        Ok(ProviderPaymentState {
            status: mapped.status,
            settlement: mapped.settlement,
            amount: raw.get("amount").and_then(decimal_value),
            currency: raw
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            provider_status: code,
            raw,
        })
    }

    /// Debits settle when they succeed; there is nothing to capture.
    async fn capture(
        &self,
        payment: &payment::Model,
        _amount: &Money,
    ) -> Result<Value, ServiceError> {
        Err(ServiceError::InvalidOperation(format!(
            "HyperPay payment {} was a debit and needs no capture",
            payment.id
        )))
    }
}

/// What the hosted widget page needs to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct HyperPayCheckoutDetails {
    pub checkout_id: String,
    pub integrity: Option<String>,
    pub widget_script_url: String,
    pub shopper_result_url: String,
}

#[derive(Clone)]
pub struct HyperPayGateway {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    client: HyperPayClient,
    reconciler: PaymentReconciler,
    event_sender: EventSender,
}

impl HyperPayGateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        reconciler: PaymentReconciler,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let http = provider_client(config.provider_timeout())?;
        let client = HyperPayClient::new(config.hyperpay.clone(), http);
        Ok(Self {
            db,
            config,
            client,
            reconciler,
            event_sender,
        })
    }

    fn is_available_for(&self, currency: &Currency) -> bool {
        self.config.hyperpay.is_configured()
            && self.config.hyperpay.supports_currency(currency.code())
    }

    /// Form fields for checkout preparation.
    pub fn checkout_form(
        &self,
        payable: &dyn Payable,
        ctx: &PaymentContext,
        merchant_transaction_id: &str,
    ) -> Vec<(String, String)> {
        let total = payable.total_price();
        let (given_name, surname) = split_name(&ctx.customer.name);
        let billing = payable
            .billing_address()
            .or_else(|| payable.shipping_address())
            .unwrap_or_default();

        let mut form: Vec<(String, String)> = vec![
            ("entityId".into(), self.config.hyperpay.entity_id.clone()),
            ("amount".into(), two_decimals(total.amount())),
            ("currency".into(), total.currency().code().to_string()),
            ("paymentType".into(), "DB".into()),
            ("merchantTransactionId".into(), merchant_transaction_id.to_string()),
            ("customer.email".into(), ctx.customer.email.clone()),
            ("customer.givenName".into(), given_name),
            ("customer.surname".into(), surname),
            ("billing.street1".into(), billing.address.unwrap_or_default()),
            ("billing.city".into(), billing.city.unwrap_or_default()),
            ("billing.state".into(), billing.state.unwrap_or_default()),
            (
                "billing.country".into(),
                billing
                    .country
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_BILLING_COUNTRY.to_string()),
            ),
            ("billing.postcode".into(), billing.zip.unwrap_or_default()),
            ("integrity".into(), "true".into()),
        ];
        if self.config.hyperpay.test_mode {
            form.push(("customParameters[3DS2_enrolled]".into(), "true".into()));
            form.push(("customParameters[3DS2_flow]".into(), "challenge".into()));
        }
        form
    }

    /// Widget data for a pending HyperPay payment.
    pub async fn checkout_details(
        &self,
        payment_id: Uuid,
    ) -> Result<HyperPayCheckoutDetails, ServiceError> {
        let payment = store::find(&*self.db, payment_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if payment.gateway != GatewayKind::HyperPay {
            return Err(ServiceError::NotFound(format!(
                "Payment {} not found",
                payment_id
            )));
        }
        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Payment {} is {}",
                payment_id, payment.status
            )));
        }

        let checkout_id = payment
            .details
            .get("checkout_id")
            .and_then(Value::as_str)
            .unwrap_or(&payment.external_reference)
            .to_string();
        let integrity = payment
            .details
            .get("integrity")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(HyperPayCheckoutDetails {
            widget_script_url: self.client.widget_script_url(&checkout_id),
            checkout_id,
            integrity,
            shopper_result_url: self.config.public_url("/payments/callback"),
        })
    }
}

/// Two decimal places, as the checkout API expects.
fn two_decimals(amount: rust_decimal::Decimal) -> String {
    let mut value = amount.round_dp(2);
    value.rescale(2);
    value.to_string()
}

#[async_trait]
impl PaymentGateway for HyperPayGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::HyperPay
    }

    fn payment_methods(&self, price: &Money, locale: Locale) -> Vec<PaymentMethodDescriptor> {
        if !self.is_available_for(price.currency()) {
            return Vec::new();
        }
        let name = match locale {
            Locale::Ar => "ادفع باستخدام مدى، فيزا، ماستركارد",
            Locale::En => "Pay with MADA, Visa, Mastercard",
        };
        vec![PaymentMethodDescriptor {
            id: METHOD_ID.to_string(),
            gateway: GatewayKind::HyperPay.to_string(),
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
                "unknown HyperPay payment method: {}",
                method_id
            )));
        }
        let total = payable.total_price();
        if !self.is_available_for(total.currency()) {
            return Err(ServiceError::InvalidOperation(format!(
                "HyperPay is not available for {}",
                total.currency()
            )));
        }

        let merchant_transaction_id = format!("{}_{}", payable.id(), Utc::now().timestamp());
        let form = self.checkout_form(payable, ctx, &merchant_transaction_id);

        let prepared = self
            .client
            .prepare_checkout(&form)
            .await
            .and_then(|raw| {
                let code = raw
                    .pointer("/result/code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
                if id.is_empty() || !is_checkout_created(code) {
                    let description = raw
                        .pointer("/result/description")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error");
                    return Err(ServiceError::ExternalApiError(format!(
                        "invalid HyperPay checkout response: {}",
                        description
                    )));
                }
                Ok((id.to_string(), raw))
            });
        let (checkout_id, raw) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(error = %err, reference = payable.reference(), "HyperPay checkout preparation failed");
                counter!("storefront_payments.session_failures", 1, "gateway" => PROVIDER);
                return Err(err);
            }
        };

        let payment = store::create_pending(
            &*self.db,
            NewPayment {
                payable_type: payable.kind(),
                payable_id: payable.id(),
                customer_id: Some(payable.owner_customer()),
                gateway: GatewayKind::HyperPay,
                external_reference: checkout_id.clone(),
                amount: total.amount(),
                currency: total.currency().code().to_string(),
                details: json!({
                    "checkout_id": checkout_id,
                    "integrity": raw.get("integrity").cloned().unwrap_or(Value::Null),
                    "merchant_transaction_id": merchant_transaction_id,
                    "prepare_response": raw,
                }),
            },
        )
        .await?;

        info!(payment_id = %payment.id, %checkout_id, "HyperPay checkout prepared");
        counter!("storefront_payments.sessions_started", 1, "gateway" => PROVIDER);
        self.event_sender.send_or_log(Event::PaymentStarted {
            payment_id: payment.id,
            gateway: GatewayKind::HyperPay,
        });

        let redirect_url = self
            .config
            .public_url(&format!("/payments/hyperpay/{}", payment.id));
        Ok(StartedPayment {
            payment,
            redirect_url,
        })
    }

    #[instrument(skip(self, params))]
    async fn callback(&self, params: &CallbackParams) -> Result<payment::Model, ServiceError> {
        let resource_path = params
            .resource_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::BadRequest("Missing resourcePath in HyperPay callback".to_string())
            })?;
        let checkout_id = checkout_id_from_resource_path(resource_path).ok_or_else(|| {
            error!(resource_path, "Could not extract checkout id");
            ServiceError::BadRequest("Invalid resourcePath format".to_string())
        })?;

        let lookup = ProviderLookup {
            external_reference: checkout_id,
            resource_path: Some(resource_path.to_string()),
        };
        self.reconciler
            .reconcile(&self.client, &lookup, ReconcileSource::Callback)
            .await?
            .into_payment()
            .ok_or_else(|| {
                error!(resource_path, "HyperPay callback for unknown payment");
                ServiceError::NotFound("Payment record not found".to_string())
            })
    }
}
