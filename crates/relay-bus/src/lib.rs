//! Address-based publish/subscribe seam between peers and the signaling
//! relay. A channel is just a string address; whoever subscribes to it
//! receives whatever anyone publishes to it. Delivery is at-most-once per
//! subscriber: a publish with no current subscriber is dropped, and order
//! is only preserved within a single channel, never across channels.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// One message delivered on a relay channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connection closed")]
    Closed,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

pub trait Relay: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage>;
    fn publish(&self, channel: &str, payload: Bytes) -> RelayResult<()>;
}

/// In-memory relay for tests and single-process setups.
#[derive(Debug, Default)]
pub struct LocalRelay {
    channels: parking_lot::RwLock<
        std::collections::HashMap<String, broadcast::Sender<RelayMessage>>,
    >,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<RelayMessage> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Relay for LocalRelay {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, payload: Bytes) -> RelayResult<()> {
        let sender = self.sender_for(channel);
        // No subscriber means nobody is registered at this address; the
        // message is dropped, not an error.
        let _ = sender.send(RelayMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }
}
