use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// Delivery topic: the staff broadcast or one user's private channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Admin,
    User(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewBooking,
    BookingUpdated,
    BookingDeleted,
    PaymentSuccessful,
    PaymentFailed,
    PaymentError,
    CriticalEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewBooking => "new_booking",
            EventKind::BookingUpdated => "booking_updated",
            EventKind::BookingDeleted => "booking_deleted",
            EventKind::PaymentSuccessful => "payment_successful",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::PaymentError => "payment_error",
            EventKind::CriticalEvent => "critical_event",
        }
    }
}

/// What a subscriber receives, serialized as-is onto the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: EventKind,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget broadcast hub.
///
/// At-most-once delivery to whoever is subscribed right now. Publishing never
/// fails: a missing channel or a lagging receiver only drops the message.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn publish(&self, channel: Channel, event: EventKind, data: serde_json::Value) {
        let delivered = match self.channels.get(&channel) {
            Some(sender) => sender
                .send(Notification {
                    event,
                    data,
                    at: Utc::now(),
                })
                .unwrap_or(0),
            None => 0,
        };
        metrics::counter!(observability::NOTIFICATIONS_TOTAL, "event" => event.as_str())
            .increment(1);
        tracing::debug!(event = event.as_str(), ?channel, delivered, "notification published");
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
