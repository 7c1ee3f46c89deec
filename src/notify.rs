use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Channel that receives every appended notification.
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";

/// Per-case channel name: `case_<id>`.
pub fn case_channel(case_id: &str) -> String {
    format!("case_{case_id}")
}

/// Broadcast hub for store events, keyed by channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
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

    /// Subscribe to a channel. Creates it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop the channel once nobody holds a receiver for it.
    pub fn release_idle(&self, channel: &str) {
        self.channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send to a channel. No-op if nobody is listening.
    pub fn send(&self, channel: &str, event: &Event) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event.clone());
        }
    }

    /// Route an event to the channel it belongs to.
    pub fn publish(&self, event: &Event) {
        match event {
            Event::CaseUpserted { case } => self.send(&case_channel(&case.id), event),
            Event::CaseDeleted { id } => {
                self.send(&case_channel(id), event);
                self.channels.remove(&case_channel(id));
            }
            Event::NotificationAdded { .. } => self.send(NOTIFICATIONS_CHANNEL, event),
        }
    }

    /// Whether `channel` names something a client may LISTEN on.
    pub fn is_valid_channel(channel: &str) -> bool {
        channel == NOTIFICATIONS_CHANNEL
            || channel
                .strip_prefix("case_")
                .is_some_and(|id| !id.is_empty())
    }
}
