//! Payment gateways and reconciliation.

pub mod gateway;
pub mod http;
pub mod hyperpay;
pub mod invoicing;
pub mod payable;
pub mod phone;
pub mod reconciliation;
pub mod status;
pub mod store;
pub mod tabby;

use crate::{entities::payment::GatewayKind, errors::ServiceError, money::Money};
use std::sync::Arc;

pub use gateway::{
    CallbackParams, Locale, PaymentContext, PaymentGateway, PaymentMethodDescriptor,
    PaymentProvider, ProviderLookup, ProviderPaymentState, StartedPayment,
};
pub use hyperpay::{HyperPayCheckoutDetails, HyperPayGateway};
pub use invoicing::{EventInvoiceDispatcher, InvoiceDispatcher};
pub use payable::{OrderPayable, Payable, PayableItem, PayableRecord};
pub use reconciliation::{PaymentReconciler, ReconcileOutcome, ReconcileSource, ReconcilerSettings};
pub use tabby::{EligibilityRequest, EligibilityResponse, TabbyGateway};

/// The configured gateways, looked up by kind or by payment method id.
#[derive(Clone)]
pub struct GatewayRegistry {
    tabby: Arc<TabbyGateway>,
    hyperpay: Arc<HyperPayGateway>,
}

impl GatewayRegistry {
    pub fn new(tabby: Arc<TabbyGateway>, hyperpay: Arc<HyperPayGateway>) -> Self {
        Self { tabby, hyperpay }
    }

    pub fn tabby(&self) -> &TabbyGateway {
        &self.tabby
    }

    pub fn hyperpay(&self) -> &HyperPayGateway {
        &self.hyperpay
    }

    fn all(&self) -> [&dyn PaymentGateway; 2] {
        [self.tabby.as_ref(), self.hyperpay.as_ref()]
    }

    pub fn get(&self, kind: GatewayKind) -> Option<&dyn PaymentGateway> {
        self.all().into_iter().find(|gateway| gateway.kind() == kind)
    }

    /// Every method offered for `price`, in gateway order.
    pub fn payment_methods(&self, price: &Money, locale: Locale) -> Vec<PaymentMethodDescriptor> {
        self.all()
            .into_iter()
            .flat_map(|gateway| gateway.payment_methods(price, locale))
            .collect()
    }

    /// Resolves the gateway offering `method_id` for `price`.
    pub fn for_method(
        &self,
        method_id: &str,
        price: &Money,
        locale: Locale,
    ) -> Result<&dyn PaymentGateway, ServiceError> {
        self.all()
            .into_iter()
            .find(|gateway| {
                gateway
                    .payment_methods(price, locale)
                    .iter()
                    .any(|method| method.id == method_id)
            })
            .ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "payment method '{}' is not available",
                    method_id
                ))
            })
    }
}
