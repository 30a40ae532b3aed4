use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Why a user is being notified about one of their reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifTrigger {
    /// A supervisor booked the reservation on the user's behalf.
    BookForced,
    /// A supervisor asks the user to cancel the reservation.
    UnbookRequested,
    /// A supervisor removed the reservation (or its slot).
    UnbookForced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(rename = "userid")]
    pub user_id: UserId,
    #[serde(rename = "reservationid")]
    pub reservation_id: Ulid,
    pub trigger: NotifTrigger,
    pub timestamp: Ms,
}

/// Per-user broadcast hub. Delivery is best effort: a notification nobody
/// listens for is logged and dropped.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. Never fails the caller.
    pub fn send(&self, notification: Notification) {
        tracing::info!(
            user = notification.user_id,
            reservation = %notification.reservation_id,
            trigger = ?notification.trigger,
            "notify"
        );
        let delivered = match self.channels.get(&notification.user_id) {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::debug!("notification had no live listener");
        }
    }

    /// Drop a user's channel once nobody listens anymore.
    pub fn release(&self, user_id: UserId) {
        self.channels
            .remove_if(&user_id, |_, sender| sender.receiver_count() == 0);
    }
}
