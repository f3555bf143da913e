//! Dissemination contract for liveness records.
//!
//! Delivery is eventual and unordered across nodes; receivers rely on the
//! record merge rules rather than on arrival order.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

use super::record::LivenessRecord;

/// Capacity for the in-process fan-in channel.
const LOCAL_BROADCAST_CAPACITY: usize = 1024;

#[async_trait]
pub trait BroadcastChannel: Send + Sync + 'static {
    /// Publish a batch of records to every reachable node.
    async fn publish_batch(&self, records: Vec<LivenessRecord>) -> anyhow::Result<()>;

    async fn publish(&self, record: LivenessRecord) -> anyhow::Result<()> {
        self.publish_batch(vec![record]).await
    }

    /// Stream of records arriving from other nodes.
    fn subscribe(&self) -> BoxStream<'static, LivenessRecord>;
}

/// In-process broadcast hub.
///
/// Every clone shares the same channel, so several trackers in one process
/// (simulations, tests) can gossip with each other. Network transports also
/// use it as their inbound side: received records are handed to `deliver`.
#[derive(Clone, Debug)]
pub struct LocalBroadcast {
    tx: broadcast::Sender<LivenessRecord>,
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Hand records to local subscribers. Returns how many subscribers exist.
    pub fn deliver(&self, records: impl IntoIterator<Item = LivenessRecord>) -> usize {
        let mut receivers = 0;
        for record in records {
            // No subscribers is fine: nobody is listening yet.
            receivers = self.tx.send(record).unwrap_or(0);
        }
        receivers
    }
}

#[async_trait]
impl BroadcastChannel for LocalBroadcast {
    async fn publish_batch(&self, records: Vec<LivenessRecord>) -> anyhow::Result<()> {
        self.deliver(records);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, LivenessRecord> {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(record) => return Some((record, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Anti-entropy republishing covers whatever was dropped.
                        tracing::debug!(skipped, "liveness subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_records() {
        let hub = LocalBroadcast::new();
        let mut sub = hub.subscribe();
        hub.publish(LivenessRecord::new(4, 1, 100)).await.unwrap();
        hub.publish_batch(vec![LivenessRecord::new(5, 2, 200)])
            .await
            .unwrap();

        assert_eq!(sub.next().await.map(|r| r.node_id), Some(4));
        assert_eq!(sub.next().await.map(|r| r.epoch), Some(2));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let hub = LocalBroadcast::new();
        hub.publish(LivenessRecord::new(1, 1, 1)).await.unwrap();
        assert_eq!(hub.deliver([LivenessRecord::new(1, 1, 2)]), 0);
    }
}
