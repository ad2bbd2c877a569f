use crate::{
    entities::payment,
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use tracing::info;

/// Hand-off point to invoice rendering and delivery for a paid payment.
#[async_trait]
pub trait InvoiceDispatcher: Send + Sync {
    async fn dispatch(&self, payment: &payment::Model) -> Result<(), ServiceError>;
}

/// Publishes `InvoiceRequested` on the in-process event channel.
#[derive(Clone)]
pub struct EventInvoiceDispatcher {
    event_sender: EventSender,
}

impl EventInvoiceDispatcher {
    pub fn new(event_sender: EventSender) -> Self {
        Self { event_sender }
    }
}

#[async_trait]
impl InvoiceDispatcher for EventInvoiceDispatcher {
    async fn dispatch(&self, payment: &payment::Model) -> Result<(), ServiceError> {
        info!(payment_id = %payment.id, "Requesting invoice");
        self.event_sender
            .send(Event::InvoiceRequested {
                payment_id: payment.id,
                payable_id: payment.payable_id,
                customer_id: payment.customer_id,
            })
            .await
            .map_err(ServiceError::InternalError)
    }
}
