use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::payment::GatewayKind;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without waiting; a full or closed channel is logged and ignored
    pub fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping event: {}", e);
        }
    }
}

/// Domain events published by the checkout and payment services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    CartCleared {
        cart_id: Uuid,
        removed_items: u64,
    },
    PaymentStarted {
        payment_id: Uuid,
        gateway: GatewayKind,
    },
    PaymentPaid {
        payment_id: Uuid,
        payable_id: Uuid,
    },
    PaymentCaptured {
        payment_id: Uuid,
        amount: Decimal,
    },
    PaymentCaptureFailed {
        payment_id: Uuid,
        attempts: i32,
    },
    PaymentFailed(Uuid),
    PaymentCancelled(Uuid),
    /// Hand-off to the invoicing pipeline (rendering and mailing live elsewhere)
    InvoiceRequested {
        payment_id: Uuid,
        payable_id: Uuid,
        customer_id: Option<Uuid>,
    },
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentCaptureFailed {
                payment_id,
                attempts,
            } => warn!(%payment_id, attempts, "capture failed"),
            Event::InvoiceRequested {
                payment_id,
                payable_id,
                ..
            } => info!(%payment_id, %payable_id, "invoice requested"),
            other => info!(event = ?other, "event"),
        }
    }

    info!("Event channel closed; stopping event processing loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_does_not_block_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();

        sender.send_or_log(Event::PaymentFailed(id));
        sender.send_or_log(Event::PaymentCancelled(id));

        assert_eq!(rx.recv().await, Some(Event::PaymentFailed(id)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender.send(Event::PaymentFailed(Uuid::new_v4())).await.is_err());
    }
}
