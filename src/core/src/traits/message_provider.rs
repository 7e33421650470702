//! Replication transport contract

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Broadcasts encoded activities between cooperating processes.
///
/// Delivery may be at-least-once and may drop messages for slow receivers
/// (`RecvError::Lagged`); the activity engine detects the resulting gaps and
/// refills them from the store's activity log.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Broadcast one encoded activity message
    async fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to every message sent after this call, including our own
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}
