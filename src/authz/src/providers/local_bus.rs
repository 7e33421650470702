//! In-process message transport over a tokio broadcast channel

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use treeacl_core::error::Result;
use treeacl_core::traits::MessageProvider;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus shared by in-process replicas.
///
/// Every clone publishes to and subscribes from the same channel. Slow
/// subscribers observe `RecvError::Lagged` once `capacity` messages are
/// outstanding.
#[derive(Clone)]
pub struct LocalMessageBus {
    sender: broadcast::Sender<Vec<u8>>,
    muted: Arc<AtomicBool>,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Silently drop every message sent while muted, simulating a lossy
    /// transport
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageProvider for LocalMessageBus {
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.muted.load(Ordering::SeqCst) {
            debug!(bytes = payload.len(), "Bus muted, message dropped");
            return Ok(());
        }
        // no subscribers is not an error for a broadcast bus
        if self.sender.send(payload).is_err() {
            debug!("Message sent without subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_channel() {
        let bus = LocalMessageBus::new();
        let other = bus.clone();
        let mut rx = other.subscribe();

        bus.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_muted_bus_drops_messages() {
        let bus = LocalMessageBus::new();
        let mut rx = bus.subscribe();
        bus.set_muted(true);
        bus.send(vec![1]).await.unwrap();
        bus.set_muted(false);
        bus.send(vec![2]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let bus = LocalMessageBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..4u8 {
            bus.send(vec![i]).await.unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
    }

    #[test]
    fn test_send_without_subscribers() {
        let bus = LocalMessageBus::new();
        tokio_test::block_on(async {
            assert!(bus.send(vec![0]).await.is_ok());
        });
    }
}
