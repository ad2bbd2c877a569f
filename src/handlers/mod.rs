pub mod commerce;
pub mod common;
pub mod health;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    services::{
        checkout::CheckoutService,
        commerce::{CartService, CartTotalCalculator, CustomerService, OrderService},
        payments::{
            EventInvoiceDispatcher, GatewayRegistry, HyperPayGateway, InvoiceDispatcher,
            PaymentReconciler, ReconcilerSettings, TabbyGateway,
        },
    },
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub carts: CartService,
    pub orders: OrderService,
    pub customers: CustomerService,
    pub checkout: CheckoutService,
    pub gateways: GatewayRegistry,
    pub reconciler: PaymentReconciler,
}

impl AppServices {
    /// Wires the service graph with the default invoicing collaborator.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let invoices: Arc<dyn InvoiceDispatcher> =
            Arc::new(EventInvoiceDispatcher::new(event_sender.clone()));
        Self::with_invoicing(db, config, event_sender, invoices)
    }

    pub fn with_invoicing(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
        invoices: Arc<dyn InvoiceDispatcher>,
    ) -> Result<Self, ServiceError> {
        let calculator = CartTotalCalculator::from_config(&config)?;
        let carts = CartService::new(db.clone(), event_sender.clone(), calculator.clone());
        let orders = OrderService::new(db.clone(), event_sender.clone(), calculator);
        let customers = CustomerService::new(db.clone());

        let reconciler = PaymentReconciler::new(
            db.clone(),
            carts.clone(),
            invoices,
            event_sender.clone(),
            ReconcilerSettings {
                capture_max_attempts: config.capture_max_attempts,
                claim_ttl: config.claim_ttl(),
            },
        );

        let tabby = TabbyGateway::new(
            db.clone(),
            config.clone(),
            orders.clone(),
            reconciler.clone(),
            event_sender.clone(),
        )?;
        let hyperpay =
            HyperPayGateway::new(db, config, reconciler.clone(), event_sender)?;
        let gateways = GatewayRegistry::new(Arc::new(tabby), Arc::new(hyperpay));

        let checkout = CheckoutService::new(carts.clone(), orders.clone(), gateways.clone());

        Ok(Self {
            carts,
            orders,
            customers,
            checkout,
            gateways,
            reconciler,
        })
    }
}
