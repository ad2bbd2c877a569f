//! Reconciles local payments with provider-reported state.
//!
//! Both the shopper's redirect and provider webhooks land here. A payment is
//! claimed (`pending` -> `processing`) before the provider is consulted, so two
//! concurrent events for the same payment cannot both capture it.

use crate::{
    entities::payment::{self, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    money::{Currency, Money},
    services::{
        commerce::CartService,
        payments::{
            gateway::{PaymentProvider, ProviderLookup, ProviderPaymentState},
            invoicing::InvoiceDispatcher,
            status::Settlement,
            store::{self, merge_details, Resolution},
        },
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};

/// Which path delivered the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReconcileSource {
    Callback,
    Webhook,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Provider state was applied (the status may still be `pending`).
    Applied(payment::Model),
    /// The payment was already final; nothing changed.
    AlreadyFinal(payment::Model),
    /// Another reconciler holds the claim.
    InFlight(payment::Model),
    NotFound,
}

impl ReconcileOutcome {
    pub fn payment(&self) -> Option<&payment::Model> {
        match self {
            Self::Applied(p) | Self::AlreadyFinal(p) | Self::InFlight(p) => Some(p),
            Self::NotFound => None,
        }
    }

    pub fn into_payment(self) -> Option<payment::Model> {
        match self {
            Self::Applied(p) | Self::AlreadyFinal(p) | Self::InFlight(p) => Some(p),
            Self::NotFound => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::AlreadyFinal(_) => "already_final",
            Self::InFlight(_) => "in_flight",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub capture_max_attempts: i32,
    /// Lifetime of both the `processing` claim and the capture lease
    pub claim_ttl: Duration,
}

/// Result of a capture request that did not error.
enum Capture {
    Done(payment::Model),
    /// Another reconciler holds the capture lease or took this attempt.
    Busy(payment::Model),
}

#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    invoices: Arc<dyn InvoiceDispatcher>,
    event_sender: EventSender,
    settings: ReconcilerSettings,
}

impl PaymentReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        invoices: Arc<dyn InvoiceDispatcher>,
        event_sender: EventSender,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            db,
            carts,
            invoices,
            event_sender,
            settings,
        }
    }

    /// Applies the provider's view of the payment identified by `lookup`.
    ///
    /// Final payments are returned untouched, except that a webhook retries
    /// a capture that has not succeeded yet.
    #[instrument(skip(self, provider), fields(gateway = %provider.kind(), reference = %lookup.external_reference))]
    pub async fn reconcile(
        &self,
        provider: &dyn PaymentProvider,
        lookup: &ProviderLookup,
        source: ReconcileSource,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let result = self.reconcile_inner(provider, lookup, source).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        counter!(
            "storefront_payments.reconciliations",
            1,
            "gateway" => provider.kind().to_string(),
            "source" => source.to_string(),
            "outcome" => outcome
        );
        result
    }

    async fn reconcile_inner(
        &self,
        provider: &dyn PaymentProvider,
        lookup: &ProviderLookup,
        source: ReconcileSource,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let Some(payment) =
            store::find_by_reference(&*self.db, provider.kind(), &lookup.external_reference)
                .await?
        else {
            warn!(%source, "No payment for provider reference");
            return Ok(ReconcileOutcome::NotFound);
        };

        if payment.status.is_final() {
            if source == ReconcileSource::Webhook
                && payment.status == PaymentStatus::Paid
                && !payment.is_captured()
            {
                return self.retry_capture(provider, lookup, payment).await;
            }
            info!(payment_id = %payment.id, status = %payment.status, "Payment already final");
            return Ok(ReconcileOutcome::AlreadyFinal(payment));
        }

        if !store::claim(&*self.db, payment.id, self.settings.claim_ttl).await? {
            let current = store::find(&*self.db, payment.id).await?.unwrap_or(payment);
            info!(payment_id = %current.id, status = %current.status, "Payment claimed elsewhere");
            return Ok(if current.status.is_final() {
                ReconcileOutcome::AlreadyFinal(current)
            } else {
                ReconcileOutcome::InFlight(current)
            });
        }

        let state = match provider.fetch_status(lookup).await {
            Ok(state) => state,
            Err(err) => {
                error!(payment_id = %payment.id, error = %err, "Provider status lookup failed");
                let mut patch = Map::new();
                patch.insert("last_verification_error".into(), json!(err.to_string()));
                store::release(&*self.db, payment.id, merge_details(&payment.details, patch))
                    .await?;
                return Err(err);
            }
        };

        let details = merge_details(
            &payment.details,
            status_patch(provider.status_detail_key(), &state, lookup),
        );

        match state.status {
            PaymentStatus::Pending | PaymentStatus::Processing => {
                info!(payment_id = %payment.id, provider_status = %state.provider_status, "Payment still pending at provider");
                store::release(&*self.db, payment.id, details).await?;
                let current = store::find(&*self.db, payment.id).await?.unwrap_or(payment);
                Ok(ReconcileOutcome::Applied(current))
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                let updated = store::resolve(
                    &*self.db,
                    payment.id,
                    Resolution {
                        status: state.status,
                        details,
                        amount: None,
                        captured_at: None,
                    },
                )
                .await?;
                info!(payment_id = %updated.id, status = %updated.status, provider_status = %state.provider_status, "Payment not completed");
                self.event_sender.send_or_log(match updated.status {
                    PaymentStatus::Cancelled => Event::PaymentCancelled(updated.id),
                    _ => Event::PaymentFailed(updated.id),
                });
                Ok(ReconcileOutcome::Applied(updated))
            }
            PaymentStatus::Paid => {
                let settled = state.settlement == Settlement::Settled;
                let updated = store::resolve(
                    &*self.db,
                    payment.id,
                    Resolution {
                        status: PaymentStatus::Paid,
                        details,
                        amount: if settled { state.amount } else { None },
                        captured_at: settled.then(Utc::now),
                    },
                )
                .await?;
                info!(payment_id = %updated.id, settled, "Payment paid");

                self.on_paid(&updated).await;

                if settled {
                    return Ok(ReconcileOutcome::Applied(updated));
                }
                match self.capture(provider, updated, &state).await {
                    Ok(Capture::Done(payment) | Capture::Busy(payment)) => {
                        Ok(ReconcileOutcome::Applied(payment))
                    }
                    Err((payment, err)) if source == ReconcileSource::Callback => {
                        warn!(payment_id = %payment.id, error = %err, "Capture failed during callback; a webhook will retry");
                        Ok(ReconcileOutcome::Applied(payment))
                    }
                    Err((_, err)) => Err(err),
                }
            }
        }
    }

    /// Webhook path for a paid payment whose capture has not gone through.
    async fn retry_capture(
        &self,
        provider: &dyn PaymentProvider,
        lookup: &ProviderLookup,
        payment: payment::Model,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if payment.capture_attempts >= self.settings.capture_max_attempts {
            warn!(
                payment_id = %payment.id,
                attempts = payment.capture_attempts,
                "Capture attempts exhausted; manual follow-up required"
            );
            return Ok(ReconcileOutcome::AlreadyFinal(payment));
        }
        if self.capture_in_flight(&payment) {
            info!(payment_id = %payment.id, "Capture in flight elsewhere; not retrying");
            return Ok(ReconcileOutcome::InFlight(payment));
        }

        let state = provider.fetch_status(lookup).await?;
        if state.status != PaymentStatus::Paid {
            warn!(
                payment_id = %payment.id,
                provider_status = %state.provider_status,
                "Provider no longer reports the payment as paid; not capturing"
            );
            return Ok(ReconcileOutcome::AlreadyFinal(payment));
        }

        if state.settlement == Settlement::Settled {
            let mut patch = Map::new();
            patch.insert("status_response".into(), state.raw.clone());
            let amount = state.amount.unwrap_or(payment.amount);
            let captured = store::mark_captured(
                &*self.db,
                payment.id,
                amount,
                merge_details(&payment.details, patch),
            )
            .await?;
            info!(payment_id = %captured.id, "Provider settled the payment without a capture call");
            return Ok(ReconcileOutcome::Applied(captured));
        }

        match self.capture(provider, payment, &state).await {
            Ok(Capture::Done(payment)) => Ok(ReconcileOutcome::Applied(payment)),
            Ok(Capture::Busy(payment)) => Ok(ReconcileOutcome::InFlight(payment)),
            Err((_, err)) => Err(err),
        }
    }

    fn capture_in_flight(&self, payment: &payment::Model) -> bool {
        let Some(started) = payment.capture_started_at else {
            return false;
        };
        let ttl = chrono::Duration::from_std(self.settings.claim_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        started > Utc::now() - ttl
    }

    /// Captures the provider-reported amount under the capture lease. On
    /// failure the lease is dropped and the payment is returned with
    /// `captured_at` still unset, alongside the error.
    async fn capture(
        &self,
        provider: &dyn PaymentProvider,
        payment: payment::Model,
        state: &ProviderPaymentState,
    ) -> Result<Capture, (payment::Model, ServiceError)> {
        let claimed = match store::claim_capture(
            &*self.db,
            payment.id,
            payment.capture_attempts,
            self.settings.capture_max_attempts,
            self.settings.claim_ttl,
        )
        .await
        {
            Ok(claimed) => claimed,
            Err(err) => return Err((payment, err)),
        };
        if !claimed {
            info!(payment_id = %payment.id, "Capture already attempted elsewhere");
            return Ok(Capture::Busy(payment));
        }
        let attempts = payment.capture_attempts + 1;

        let amount = match capture_amount(&payment, state) {
            Ok(amount) => amount,
            Err(err) => {
                if let Err(store_err) =
                    store::release_capture(&*self.db, payment.id, payment.details.clone()).await
                {
                    warn!(payment_id = %payment.id, error = %store_err, "Could not release capture lease");
                }
                return Err((payment, err));
            }
        };

        counter!("storefront_payments.captures", 1, "gateway" => provider.kind().to_string());
        match provider.capture(&payment, &amount).await {
            Ok(response) => {
                let mut patch = Map::new();
                patch.insert("capture_response".into(), response);
                let captured = match store::mark_captured(
                    &*self.db,
                    payment.id,
                    amount.amount(),
                    merge_details(&payment.details, patch),
                )
                .await
                {
                    Ok(captured) => captured,
                    Err(err) => return Err((payment, err)),
                };
                info!(payment_id = %captured.id, amount = %amount, "Payment captured");
                self.event_sender.send_or_log(Event::PaymentCaptured {
                    payment_id: captured.id,
                    amount: amount.amount(),
                });
                Ok(Capture::Done(captured))
            }
            Err(err) => {
                error!(payment_id = %payment.id, attempts, error = %err, "Capture failed");
                counter!("storefront_payments.capture_failures", 1, "gateway" => provider.kind().to_string());
                let mut patch = Map::new();
                patch.insert("last_capture_error".into(), json!(err.to_string()));
                let details = merge_details(&payment.details, patch);
                if let Err(store_err) =
                    store::release_capture(&*self.db, payment.id, details.clone()).await
                {
                    warn!(payment_id = %payment.id, error = %store_err, "Could not record capture error");
                }
                self.event_sender.send_or_log(Event::PaymentCaptureFailed {
                    payment_id: payment.id,
                    attempts,
                });
                let payment = payment::Model {
                    capture_attempts: attempts,
                    capture_started_at: None,
                    details,
                    ..payment
                };
                Err((payment, err))
            }
        }
    }

    /// Runs once per payment, on the transition into `paid`. Failures are logged only.
    async fn on_paid(&self, payment: &payment::Model) {
        if let Some(customer_id) = payment.customer_id {
            if let Err(err) = self.carts.clear_customer_cart(customer_id).await {
                warn!(payment_id = %payment.id, %customer_id, error = %err, "Could not clear cart after payment");
            }
        }
        if let Err(err) = self.invoices.dispatch(payment).await {
            warn!(payment_id = %payment.id, error = %err, "Invoice dispatch failed");
        }
        self.event_sender.send_or_log(Event::PaymentPaid {
            payment_id: payment.id,
            payable_id: payment.payable_id,
        });
    }
}

fn status_patch(
    status_key: &str,
    state: &ProviderPaymentState,
    lookup: &ProviderLookup,
) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("status_response".into(), state.raw.clone());
    patch.insert(status_key.into(), json!(state.provider_status));
    patch.insert("reconciled_at".into(), json!(Utc::now().to_rfc3339()));
    if let Some(path) = &lookup.resource_path {
        patch.insert("callback_resource_path".into(), json!(path));
    }
    patch
}

/// The provider's amount wins over the local one, which may be stale.
fn capture_amount(
    payment: &payment::Model,
    state: &ProviderPaymentState,
) -> Result<Money, ServiceError> {
    let currency = Currency::new(state.currency.as_deref().unwrap_or(&payment.currency))?;
    let amount = state.amount.unwrap_or(payment.amount);
    if state.amount.is_some_and(|reported| reported != payment.amount) {
        warn!(
            payment_id = %payment.id,
            local = %payment.amount,
            reported = %amount,
            "Provider amount differs from local amount; capturing provider amount"
        );
    }
    Ok(Money::of(amount, currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::{
        db::{establish_connection_with_config, run_migrations, DbConfig},
        entities::payment::{GatewayKind, PayableKind},
        services::{
            commerce::CartTotalCalculator,
            payments::store::{create_pending, NewPayment},
        },
    };
    use async_trait::async_trait;
    use mockall::mock;
    use rust_decimal_macros::dec;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    mock! {
        pub Provider {}

        #[async_trait]
        impl PaymentProvider for Provider {
            fn kind(&self) -> GatewayKind;
            fn status_detail_key(&self) -> &'static str;
            async fn fetch_status(&self, lookup: &ProviderLookup) -> Result<ProviderPaymentState, ServiceError>;
            async fn capture(&self, payment: &payment::Model, amount: &Money) -> Result<Value, ServiceError>;
        }
    }

    mock! {
        pub Invoices {}

        #[async_trait]
        impl InvoiceDispatcher for Invoices {
            async fn dispatch(&self, payment: &payment::Model) -> Result<(), ServiceError>;
        }
    }

    struct Fixture {
        db: Arc<DatabaseConnection>,
        reconciler: PaymentReconciler,
        payment: payment::Model,
    }

    async fn fixture(invoices: MockInvoices, local_amount: rust_decimal::Decimal) -> Fixture {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);

        let (tx, _rx) = mpsc::channel(64);
        let events = EventSender::new(tx);
        let carts = CartService::new(
            db.clone(),
            events.clone(),
            CartTotalCalculator::new(dec!(0.15), Currency::new("SAR").unwrap()),
        );
        let reconciler = PaymentReconciler::new(
            db.clone(),
            carts,
            Arc::new(invoices),
            events,
            ReconcilerSettings {
                capture_max_attempts: 3,
                claim_ttl: Duration::from_secs(120),
            },
        );

        let payment = create_pending(
            &*db,
            NewPayment {
                payable_type: PayableKind::Order,
                payable_id: Uuid::new_v4(),
                customer_id: None,
                gateway: GatewayKind::Tabby,
                external_reference: "tabby-pay-1".into(),
                amount: local_amount,
                currency: "SAR".into(),
                details: json!({"session": {"id": "tabby-pay-1"}}),
            },
        )
        .await
        .unwrap();

        Fixture {
            db,
            reconciler,
            payment,
        }
    }

    fn provider_state(status: &str, amount: rust_decimal::Decimal) -> ProviderPaymentState {
        let mapped = crate::services::payments::status::map_tabby_status(status);
        ProviderPaymentState {
            status: mapped.status,
            settlement: mapped.settlement,
            amount: Some(amount),
            currency: Some("SAR".into()),
            provider_status: status.into(),
            raw: json!({"id": "tabby-pay-1", "status": status, "amount": amount.to_string()}),
        }
    }

    fn tabby_provider() -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_kind().return_const(GatewayKind::Tabby);
        provider.expect_status_detail_key().return_const("provider_status");
        provider
    }

    fn lookup() -> ProviderLookup {
        ProviderLookup::by_reference("tabby-pay-1")
    }

    #[tokio::test]
    async fn authorized_payment_is_captured_with_provider_amount() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().times(1).returning(|_| Ok(()));
        let fx = fixture(invoices, dec!(573.85)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .times(1)
            .returning(|_| Ok(provider_state("AUTHORIZED", dec!(499.00))));
        provider
            .expect_capture()
            .withf(|_, amount| amount.to_minor_string() == "499.00")
            .times(1)
            .returning(|_, _| Ok(json!({"status": "CLOSED"})));

        let outcome = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Callback)
            .await
            .unwrap();

        let payment = outcome.into_payment().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert!(payment.captured_at.is_some());
        assert_eq!(payment.amount, dec!(499.00));
        assert_eq!(payment.capture_attempts, 1);
        assert_eq!(payment.details["session"]["id"], "tabby-pay-1");
        assert_eq!(payment.details["capture_response"]["status"], "CLOSED");
    }

    #[tokio::test]
    async fn second_event_is_a_no_op() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().times(1).returning(|_| Ok(()));
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .times(1)
            .returning(|_| Ok(provider_state("AUTHORIZED", dec!(100))));
        provider
            .expect_capture()
            .times(1)
            .returning(|_, _| Ok(json!({})));

        let first = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await
            .unwrap();
        let second = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await
            .unwrap();

        assert_matches!(first, ReconcileOutcome::Applied(_));
        match second {
            ReconcileOutcome::AlreadyFinal(p) => assert_eq!(p.status, PaymentStatus::Paid),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_payment_is_settled_without_capture() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().times(1).returning(|_| Ok(()));
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .returning(|_| Ok(provider_state("CLOSED", dec!(100))));
        provider.expect_capture().never();

        let payment = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Callback)
            .await
            .unwrap()
            .into_payment()
            .unwrap();
        assert!(payment.is_captured());
        assert_eq!(payment.capture_attempts, 0);
    }

    #[tokio::test]
    async fn rejected_and_expired_map_to_final_states() {
        for (raw, expected) in [
            ("REJECTED", PaymentStatus::Failed),
            ("EXPIRED", PaymentStatus::Cancelled),
        ] {
            let mut invoices = MockInvoices::new();
            invoices.expect_dispatch().never();
            let fx = fixture(invoices, dec!(100)).await;

            let mut provider = tabby_provider();
            provider
                .expect_fetch_status()
                .returning(move |_| Ok(provider_state(raw, dec!(100))));
            provider.expect_capture().never();

            let payment = fx
                .reconciler
                .reconcile(&provider, &lookup(), ReconcileSource::Callback)
                .await
                .unwrap()
                .into_payment()
                .unwrap();
            assert_eq!(payment.status, expected);
            assert!(payment.captured_at.is_none());
        }
    }

    #[tokio::test]
    async fn still_pending_releases_the_claim() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().never();
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .returning(|_| Ok(provider_state("CREATED", dec!(100))));

        let payment = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Callback)
            .await
            .unwrap()
            .into_payment()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.details["provider_status"], "CREATED");
    }

    #[tokio::test]
    async fn verification_failure_releases_the_claim_and_errors() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().never();
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .returning(|_| Err(ServiceError::ExternalServiceError("timeout".into())));

        let result = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await;
        assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));

        let stored = store::find(&*fx.db, fx.payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(stored.details["last_verification_error"].is_string());
    }

    #[tokio::test]
    async fn failed_capture_is_retried_by_webhook() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().times(1).returning(|_| Ok(()));
        let fx = fixture(invoices, dec!(250)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .times(2)
            .returning(|_| Ok(provider_state("AUTHORIZED", dec!(250))));
        let mut seq = mockall::Sequence::new();
        provider
            .expect_capture()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ServiceError::ExternalServiceError("503".into())));
        provider
            .expect_capture()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"status": "CLOSED"})));

        let first = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await;
        assert!(first.is_err());
        let stored = store::find(&*fx.db, fx.payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert!(stored.captured_at.is_none());
        assert_eq!(stored.capture_attempts, 1);
        assert!(stored.capture_started_at.is_none());
        assert!(stored.details["last_capture_error"].is_string());

        let retried = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await
            .unwrap()
            .into_payment()
            .unwrap();
        assert!(retried.is_captured());
        assert_eq!(retried.capture_attempts, 2);
    }

    /// Authorizes every lookup and answers captures only after `delay`.
    struct SlowCaptureProvider {
        captures: std::sync::atomic::AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl PaymentProvider for SlowCaptureProvider {
        fn kind(&self) -> GatewayKind {
            GatewayKind::Tabby
        }

        async fn fetch_status(
            &self,
            _lookup: &ProviderLookup,
        ) -> Result<ProviderPaymentState, ServiceError> {
            Ok(provider_state("AUTHORIZED", dec!(100)))
        }

        async fn capture(
            &self,
            _payment: &payment::Model,
            _amount: &Money,
        ) -> Result<Value, ServiceError> {
            self.captures
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(json!({"status": "CLOSED"}))
        }
    }

    #[tokio::test]
    async fn webhook_during_slow_capture_does_not_capture_again() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().times(1).returning(|_| Ok(()));
        let fx = fixture(invoices, dec!(100)).await;
        let provider = SlowCaptureProvider {
            captures: Default::default(),
            delay: Duration::from_millis(400),
        };

        let first_lookup = lookup();
        let first = fx
            .reconciler
            .reconcile(&provider, &first_lookup, ReconcileSource::Webhook);
        let second = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            fx.reconciler
                .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_matches!(first, Ok(ReconcileOutcome::Applied(_)));
        assert_matches!(second, Ok(ReconcileOutcome::InFlight(_)));
        assert_eq!(
            provider.captures.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let stored = store::find(&*fx.db, fx.payment.id).await.unwrap().unwrap();
        assert!(stored.is_captured());
        assert_eq!(stored.capture_attempts, 1);
        assert!(stored.capture_started_at.is_none());
    }

    #[tokio::test]
    async fn abandoned_capture_lease_expires() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().never();
        let fx = fixture(invoices, dec!(100)).await;

        payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: sea_orm::Set(PaymentStatus::Paid),
                capture_attempts: sea_orm::Set(1),
                capture_started_at: sea_orm::Set(Some(Utc::now() - chrono::Duration::minutes(10))),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(fx.payment.id))
            .exec(&*fx.db)
            .await
            .unwrap();

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .times(1)
            .returning(|_| Ok(provider_state("AUTHORIZED", dec!(100))));
        provider
            .expect_capture()
            .times(1)
            .returning(|_, _| Ok(json!({"status": "CLOSED"})));

        let payment = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Webhook)
            .await
            .unwrap()
            .into_payment()
            .unwrap();
        assert!(payment.is_captured());
        assert_eq!(payment.capture_attempts, 2);
    }

    #[tokio::test]
    async fn invoice_failure_does_not_fail_reconciliation() {
        let mut invoices = MockInvoices::new();
        invoices
            .expect_dispatch()
            .times(1)
            .returning(|_| Err(ServiceError::InternalError("mailer down".into())));
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider
            .expect_fetch_status()
            .returning(|_| Ok(provider_state("CLOSED", dec!(100))));

        let outcome = fx
            .reconciler
            .reconcile(&provider, &lookup(), ReconcileSource::Callback)
            .await
            .unwrap();
        assert_eq!(outcome.payment().unwrap().status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let mut invoices = MockInvoices::new();
        invoices.expect_dispatch().never();
        let fx = fixture(invoices, dec!(100)).await;

        let mut provider = tabby_provider();
        provider.expect_fetch_status().never();

        let outcome = fx
            .reconciler
            .reconcile(
                &provider,
                &ProviderLookup::by_reference("missing"),
                ReconcileSource::Webhook,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }
}
