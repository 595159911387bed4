//! Server-initiated notification fan-out.
//!
//! A bounded broadcast channel carries notification envelopes from the
//! dispatcher to however many transport streams are listening. A stream
//! that falls too far behind sees a lag error from its receiver and is
//! expected to disconnect its client rather than stall the bus.

use crate::rpc::Envelope;
use tokio::sync::broadcast;

const NOTIFICATION_BUFFER: usize = 256;

/// Broadcast bus for `$/...` notifications pushed to SSE/stdio streams.
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Envelope>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_BUFFER);
        NotificationBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// not an error; notifications are fire-and-forget.
    pub fn publish(&self, envelope: Envelope) {
        let _ = self.sender.send(envelope);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
