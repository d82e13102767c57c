use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-product change feed. Every persisted event that touches a product is
/// published on that product's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to a product's events. Creates the channel if needed.
    pub fn subscribe(&self, product_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(product_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to every product the event touches. No-op without listeners.
    pub fn publish(&self, event: &Event) {
        for product_id in event.product_ids() {
            self.send(product_id, event);
        }
    }

    pub fn send(&self, product_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&product_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a product's channel once the product is gone. Live receivers see `Closed`.
    pub fn remove(&self, product_id: &Ulid) {
        self.channels.remove(product_id);
    }
}
