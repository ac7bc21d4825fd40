use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-employee broadcast of committed allocation events.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one employee's events. Creates the channel if needed.
    pub fn subscribe(&self, employee_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(employee_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to its employee's channel. No-op without listeners.
    pub fn send(&self, event: &Event) {
        let Some(employee_id) = event.employee_id() else {
            return;
        };
        let closed = match self.channels.get(&employee_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if closed {
            // every receiver is gone
            self.channels
                .remove_if(&employee_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
