/// Event Broadcasting - real-time sync event streaming
///
/// Uses tokio broadcast channels for the pub/sub pattern. Service layers
/// (RPC, websocket frontends) subscribe to hear about chain advancement;
/// the synchronizer publishes exactly one event per cycle that moved the
/// indexed tip.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event types that can be broadcast to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// The indexed chain tip advanced to `height`
    BlockAdded { height: i32 },
}

/// Broadcast channel for sync events
pub struct EventBroadcaster {
    pub block_tx: broadcast::Sender<SyncEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (block_tx, _) = broadcast::channel(1000);
        Self { block_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.block_tx.subscribe()
    }

    /// Broadcast a new indexed tip
    pub fn broadcast_block(&self, height: i32) {
        let _ = self.block_tx.send(SyncEvent::BlockAdded { height });
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_subscriber() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast_block(42);
        match rx.try_recv().unwrap() {
            SyncEvent::BlockAdded { height } => assert_eq!(height, 42),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.broadcast_block(1);
    }
}
