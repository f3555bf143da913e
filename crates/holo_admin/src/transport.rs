//! Node-to-node HTTP transport: liveness gossip and remote stats queries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, FuturesUnordered, StreamExt};
use holo_control::{
    BroadcastChannel, DeadlineExceeded, LivenessRecord, LocalBroadcast, NodeId, PartitionId,
    PartitionStatsResult, StatsProvider,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::storage::LocalStore;

pub const GOSSIP_PATH: &str = "/_internal/liveness";
pub const STATS_PATH: &str = "/_internal/stats";

/// Upper bound for a single gossip push.
const GOSSIP_TIMEOUT: Duration = Duration::from_secs(2);

/// Body of `POST /_internal/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsQuery {
    pub partitions: Vec<PartitionId>,
    /// Time the caller is still willing to wait.
    pub timeout_ms: u64,
}

pub fn build_http_client(connect_timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .context("build http client")
}

/// Pushes liveness records to every peer over HTTP. Records pushed by peers
/// arrive through the API handler into `inbox`.
pub struct HttpGossip {
    node_id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    client: reqwest::Client,
    inbox: LocalBroadcast,
}

impl HttpGossip {
    pub fn new(
        node_id: NodeId,
        peers: HashMap<NodeId, SocketAddr>,
        client: reqwest::Client,
        inbox: LocalBroadcast,
    ) -> Self {
        Self {
            node_id,
            peers,
            client,
            inbox,
        }
    }
}

#[async_trait]
impl BroadcastChannel for HttpGossip {
    async fn publish_batch(&self, records: Vec<LivenessRecord>) -> anyhow::Result<()> {
        let mut pushes = FuturesUnordered::new();
        let mut attempted = 0usize;
        for (peer_id, addr) in &self.peers {
            if *peer_id == self.node_id {
                continue;
            }
            let request = self
                .client
                .post(format!("http://{addr}{GOSSIP_PATH}"))
                .timeout(GOSSIP_TIMEOUT)
                .json(&records);
            attempted += 1;
            pushes.push(async move { (*peer_id, request.send().await) });
        }

        let mut failed = 0usize;
        while let Some((peer_id, result)) = pushes.next().await {
            let result = result.and_then(|resp| resp.error_for_status());
            if let Err(err) = result {
                failed += 1;
                // Unreachable peers are expected while they are down.
                tracing::debug!(peer_id, error = %err, "liveness gossip push failed");
            }
        }
        if attempted > 0 && failed == attempted {
            anyhow::bail!("liveness gossip reached no peers");
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, LivenessRecord> {
        self.inbox.subscribe()
    }
}

/// Answers stats queries from the local store for this node and over HTTP
/// for every other node.
pub struct ClusterStatsProvider {
    node_id: NodeId,
    local: Arc<LocalStore>,
    peers: HashMap<NodeId, SocketAddr>,
    client: reqwest::Client,
}

impl ClusterStatsProvider {
    pub fn new(
        node_id: NodeId,
        local: Arc<LocalStore>,
        peers: HashMap<NodeId, SocketAddr>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            node_id,
            local,
            peers,
            client,
        }
    }

    async fn query_remote(
        &self,
        node_id: NodeId,
        partitions: Vec<PartitionId>,
        deadline: Instant,
    ) -> anyhow::Result<PartitionStatsResult> {
        let addr = self
            .peers
            .get(&node_id)
            .with_context(|| format!("no address known for node {node_id}"))?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeadlineExceeded { node_id }.into());
        }

        let query = StatsQuery {
            partitions,
            timeout_ms: remaining.as_millis().max(1) as u64,
        };
        let response = self
            .client
            .post(format!("http://{addr}{STATS_PATH}"))
            .timeout(remaining)
            .json(&query)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    anyhow::Error::new(DeadlineExceeded { node_id })
                } else {
                    anyhow::Error::new(err)
                }
            })
            .with_context(|| format!("stats request to node {node_id} at {addr} failed"))?;
        let status = response.status();
        if status == reqwest::StatusCode::GATEWAY_TIMEOUT {
            return Err(DeadlineExceeded { node_id }.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("node {node_id} answered stats request with {status}: {body}");
        }
        let result: PartitionStatsResult = response
            .json()
            .await
            .with_context(|| format!("decode stats response from node {node_id}"))?;
        anyhow::ensure!(
            result.node_id == node_id,
            "stats response from {addr} claims node {} (expected {node_id})",
            result.node_id
        );
        Ok(result)
    }
}

#[async_trait]
impl StatsProvider for ClusterStatsProvider {
    async fn query(
        &self,
        node_id: NodeId,
        partitions: Vec<PartitionId>,
        deadline: Instant,
    ) -> anyhow::Result<PartitionStatsResult> {
        if node_id == self.node_id {
            return self
                .local
                .partition_stats(node_id, partitions, deadline)
                .await;
        }
        self.query_remote(node_id, partitions, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_control::{NodeOutcome, StatsFanoutCoordinator, StatsRequest};

    /// Accepts connections and never answers them.
    async fn silent_peer() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind silent peer");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (addr, task)
    }

    fn provider(dir: &tempfile::TempDir, peer: SocketAddr) -> Arc<ClusterStatsProvider> {
        let local = Arc::new(LocalStore::open(dir.path()).expect("open store"));
        let client = build_http_client(Duration::from_millis(500)).expect("http client");
        Arc::new(ClusterStatsProvider::new(
            1,
            local,
            HashMap::from([(2, peer)]),
            client,
        ))
    }

    #[tokio::test]
    async fn elapsed_deadline_is_a_timeout_not_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (addr, peer) = silent_peer().await;
        let provider = provider(&dir, addr);

        let err = provider
            .query(2, vec![1], Instant::now())
            .await
            .expect_err("no time left");
        assert_eq!(
            err.downcast_ref::<DeadlineExceeded>(),
            Some(&DeadlineExceeded { node_id: 2 })
        );

        let coordinator = StatsFanoutCoordinator::new(provider);
        for budget_ms in [0u64, 5, 200] {
            let outcomes = coordinator
                .collect(
                    vec![StatsRequest {
                        node_id: 2,
                        partitions: vec![1],
                    }],
                    Instant::now() + Duration::from_millis(budget_ms),
                )
                .await;
            assert_eq!(outcomes[&2], NodeOutcome::TimedOut, "budget {budget_ms}ms");
        }
        coordinator.shutdown().await;
        peer.abort();
    }
}
