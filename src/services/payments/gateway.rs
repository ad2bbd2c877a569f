use crate::{
    entities::{
        commerce::CustomerModel,
        payment::{self, GatewayKind, PaymentStatus},
    },
    errors::ServiceError,
    money::Money,
    services::payments::{payable::Payable, status::Settlement},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

/// Shopper language used for provider pages and method labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Ar,
}

impl Locale {
    /// Picks the first supported language from an `Accept-Language` header.
    pub fn from_accept_language(header: &str) -> Self {
        header
            .split(',')
            .filter_map(|part| part.split(';').next())
            .map(|tag| tag.trim().to_ascii_lowercase())
            .find_map(|tag| match tag.split('-').next() {
                Some("ar") => Some(Self::Ar),
                Some("en") => Some(Self::En),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ar => "ar",
        }
    }
}

/// Selectable payment option shown at checkout
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PaymentMethodDescriptor {
    pub id: String,
    pub gateway: String,
    pub name: String,
    pub service_charge: Money,
    pub total: Money,
    pub logo: String,
}

/// Who is paying and in which language.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub customer: CustomerModel,
    pub locale: Locale,
}

#[derive(Debug, Clone)]
pub struct StartedPayment {
    pub payment: payment::Model,
    pub redirect_url: String,
}

/// Query string of the shopper's return from a provider.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct CallbackParams {
    /// Card processor status resource
    #[serde(rename = "resourcePath")]
    pub resource_path: Option<String>,
    /// Installment lender payment id
    pub payment_id: Option<String>,
    /// Card processor checkout id
    pub id: Option<String>,
}

/// A provider integration able to open sessions and reconcile returns.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Methods offered for `price`; empty when this gateway does not apply.
    fn payment_methods(&self, price: &Money, locale: Locale) -> Vec<PaymentMethodDescriptor>;

    /// Opens a provider session and records exactly one pending payment.
    async fn start(
        &self,
        payable: &dyn Payable,
        method_id: &str,
        ctx: &PaymentContext,
    ) -> Result<StartedPayment, ServiceError>;

    /// Reconciles the shopper's return from the provider.
    async fn callback(&self, params: &CallbackParams) -> Result<payment::Model, ServiceError>;
}

/// How to find a payment on the provider side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLookup {
    pub external_reference: String,
    pub resource_path: Option<String>,
}

impl ProviderLookup {
    pub fn by_reference(external_reference: impl Into<String>) -> Self {
        Self {
            external_reference: external_reference.into(),
            resource_path: None,
        }
    }
}

/// What the provider reports about a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPaymentState {
    pub status: PaymentStatus,
    pub settlement: Settlement,
    /// Amount the provider holds; preferred over the local amount for capture
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    /// Status or result code exactly as the provider sent it
    pub provider_status: String,
    pub raw: Value,
}

/// Provider API calls used by reconciliation.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Details key under which the provider's raw status is kept
    fn status_detail_key(&self) -> &'static str {
        "provider_status"
    }

    async fn fetch_status(
        &self,
        lookup: &ProviderLookup,
    ) -> Result<ProviderPaymentState, ServiceError>;

    /// Captures `amount` against an authorized payment, returning the raw response.
    async fn capture(
        &self,
        payment: &payment::Model,
        amount: &Money,
    ) -> Result<Value, ServiceError>;
}
