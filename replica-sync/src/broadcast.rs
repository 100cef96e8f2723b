//! Consumer registry and fan-out.

use crate::protocol::{Broadcast, HostMessage};
use replica_types::ConsumerId;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// The host's registered consumers.
///
/// Delivery never fails from the host's point of view: a consumer whose
/// channel is gone is dropped from the registry and everyone else still
/// gets the message.
#[derive(Debug, Default)]
pub struct Broadcaster {
    consumers: HashMap<ConsumerId, mpsc::UnboundedSender<HostMessage>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer, replacing any channel it had before.
    pub fn register(&mut self, id: ConsumerId, outbox: mpsc::UnboundedSender<HostMessage>) {
        self.consumers.insert(id, outbox);
        debug!("Consumer {} registered ({} total)", id, self.consumers.len());
    }

    pub fn unregister(&mut self, id: &ConsumerId) -> bool {
        self.consumers.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn contains(&self, id: &ConsumerId) -> bool {
        self.consumers.contains_key(id)
    }

    /// Sends `message` to every consumer. Returns how many received it.
    pub fn broadcast(&mut self, message: Broadcast) -> usize {
        let mut dead = Vec::new();
        for (id, outbox) in &self.consumers {
            if outbox.send(HostMessage::Broadcast(message.clone())).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            self.consumers.remove(id);
            debug!("Pruned disconnected consumer {}", id);
        }
        self.consumers.len()
    }

    /// Sends `message` to one consumer. Returns false, and forgets the
    /// consumer, when it is gone.
    pub fn send_to(&mut self, id: &ConsumerId, message: HostMessage) -> bool {
        let Some(outbox) = self.consumers.get(id) else {
            debug!("Dropping message for unknown consumer {}", id);
            return false;
        };
        if outbox.send(message).is_ok() {
            return true;
        }
        self.consumers.remove(id);
        debug!("Pruned disconnected consumer {}", id);
        false
    }
}
