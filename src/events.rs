use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the reservation core.
///
/// These exist for observability; collaborators that need durable signals
/// (the low-stock alerting sink) read the persisted tables instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation_id: Uuid,
        caller_id: String,
        expires_at: DateTime<Utc>,
    },
    OrderCreated {
        order_id: Uuid,
        reservation_id: Uuid,
        total: i64,
    },
    ReservationExpired {
        reservation_id: Uuid,
        units_released: i32,
    },
    LowStock {
        product_id: Uuid,
        stock_after: i32,
        threshold: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("failed to send event: {}", e))
    }

    /// Fire-and-forget: event loss only costs a log line, never correctness.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("dropping domain event: {}", e);
        }
    }
}

/// Creates the event channel with a bounded capacity.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Background consumer that logs every domain event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match &event {
            Event::ReservationCreated {
                reservation_id,
                caller_id,
                expires_at,
            } => info!(
                %reservation_id,
                %caller_id,
                %expires_at,
                "reservation created"
            ),
            Event::OrderCreated {
                order_id,
                reservation_id,
                total,
            } => info!(%order_id, %reservation_id, total, "order created"),
            Event::ReservationExpired {
                reservation_id,
                units_released,
            } => info!(%reservation_id, units_released, "reservation expired"),
            Event::LowStock {
                product_id,
                stock_after,
                threshold,
            } => warn!(%product_id, stock_after, threshold, "stock below threshold"),
        }
    }
}
