//! Broadcast signaling for the two cache-pressure events the writer and its
//! embedders care about: `cacheTooFull` and `cacheSpaceAvailable`.
//!
//! A single-topic pub/sub signal over `tokio::sync::broadcast`: cache
//! high/low watermark crossings, rather than a general-purpose named-event
//! bus, since there is exactly one topic to carry.

use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// The cache has crossed `MAX_CACHE_SIZE`; producers should apply backpressure.
    TooFull,
    /// The cache has drained back under the low watermark.
    SpaceAvailable,
}

/// Owns the broadcast sender; `subscribe()` hands out independent receivers.
#[derive(Clone)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
}

impl CacheEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Broadcasts an event. A send with no subscribers is not an error: the
    /// writer can run with nobody listening for pressure events.
    pub fn emit(&self, event: CacheEvent) {
        debug!(?event, "cache event");
        let _ = self.tx.send(event);
    }
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let events = CacheEvents::new();
        let mut rx = events.subscribe();
        events.emit(CacheEvent::TooFull);
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::TooFull);
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let events = CacheEvents::new();
        events.emit(CacheEvent::SpaceAvailable);
    }
}
