//! Event bus (C12): a small `tokio::sync::broadcast` wrapper that lets the
//! pipeline and retention cleaner notify the feed cache (and anything else
//! listening) without holding a direct reference to it.

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    ItemCompleted { channel_id: Uuid },
    ChannelRetentionRan { channel_id: Uuid, freed_bytes: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort publish: if nobody is listening, or the channel is lagged,
    /// this is logged and otherwise ignored. Losing an invalidation event
    /// only costs cache freshness, not correctness (spec §4.7/§4.3).
    pub fn publish(&self, event: Event) {
        if self.sender.send(event).is_err() {
            warn!("event published with no subscribers");
        }
    }

    pub fn item_completed(&self, channel_id: Uuid) {
        self.publish(Event::ItemCompleted { channel_id });
    }

    pub fn channel_retention_ran(&self, channel_id: Uuid, freed_bytes: u64) {
        self.publish(Event::ChannelRetentionRan {
            channel_id,
            freed_bytes,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
