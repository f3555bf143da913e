//! Deadline-bounded stats fan-out.
//!
//! `collect` dispatches one worker per target node onto a shared
//! `TaskTracker`. Every worker bounds its provider call by the request
//! deadline and reports into an mpsc channel whose capacity equals the number
//! of dispatched workers, so a report never waits on the coordinator. If the
//! coordinator stops waiting (deadline reached, caller dropped the future),
//! the workers still finish on their own by the same deadline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::task::TaskTracker;

use crate::liveness::{LivenessTracker, NodeLivenessStatus};
use crate::types::{NodeId, PartitionId};

/// Stats for one partition replica as reported by its host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition_id: PartitionId,
    pub key_count: u64,
    pub approximate_stored_bytes: u64,
}

/// One node's answer to a stats query.
///
/// Only partitions the node actually hosts appear in `partitions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionStatsResult {
    pub node_id: NodeId,
    pub partitions: Vec<PartitionStats>,
}

impl PartitionStatsResult {
    pub fn key_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.key_count).sum()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.approximate_stored_bytes)
            .sum()
    }
}

/// A provider ran out of time before it could answer.
///
/// Providers return this (possibly wrapped in context) instead of a generic
/// error so the coordinator records the target as timed out rather than
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stats query for node {node_id} exceeded its deadline")]
pub struct DeadlineExceeded {
    pub node_id: NodeId,
}

/// Per-node stats source. Implementations must honor `deadline` themselves
/// (remote transports translate it into a request timeout).
#[async_trait]
pub trait StatsProvider: Send + Sync + 'static {
    async fn query(
        &self,
        node_id: NodeId,
        partitions: Vec<PartitionId>,
        deadline: Instant,
    ) -> anyhow::Result<PartitionStatsResult>;
}

/// Liveness view consulted before contacting a node.
#[async_trait]
pub trait LivenessOracle: Send + Sync + 'static {
    async fn status(&self, node_id: NodeId) -> NodeLivenessStatus;
}

#[async_trait]
impl LivenessOracle for LivenessTracker {
    async fn status(&self, node_id: NodeId) -> NodeLivenessStatus {
        self.observe(node_id).await
    }
}

/// Outcome recorded for one fan-out target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Responded(PartitionStatsResult),
    /// The node answered with an explicit error.
    Failed(String),
    /// No answer by the deadline.
    TimedOut,
    /// Not contacted because of its liveness status.
    Skipped(NodeLivenessStatus),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Responded(_))
    }
}

/// Partitions one node is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRequest {
    pub node_id: NodeId,
    pub partitions: Vec<PartitionId>,
}

pub struct StatsFanoutCoordinator {
    provider: Arc<dyn StatsProvider>,
    liveness: Option<Arc<dyn LivenessOracle>>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for StatsFanoutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsFanoutCoordinator")
            .field("inflight", &self.tasks.len())
            .field("filters_by_liveness", &self.liveness.is_some())
            .finish()
    }
}

impl StatsFanoutCoordinator {
    pub fn new(provider: Arc<dyn StatsProvider>) -> Self {
        Self {
            provider,
            liveness: None,
            tasks: TaskTracker::new(),
        }
    }

    /// Skip targets the oracle classifies as not contactable.
    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessOracle>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Workers dispatched by any `collect` call that have not finished yet.
    pub fn inflight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting work and wait for every dispatched worker to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Query every target node concurrently and return one outcome per
    /// distinct node, never waiting past `deadline`.
    pub async fn collect(
        &self,
        requests: Vec<StatsRequest>,
        deadline: Instant,
    ) -> BTreeMap<NodeId, NodeOutcome> {
        let targets = dedupe(requests);
        let mut outcomes = BTreeMap::new();
        if targets.is_empty() {
            return outcomes;
        }

        let mut dispatch = Vec::with_capacity(targets.len());
        for (node_id, partitions) in targets {
            if let Some(liveness) = &self.liveness {
                let status = liveness.status(node_id).await;
                if !status.is_contactable() {
                    tracing::debug!(node_id, status = %status, "skipping stats fan-out target");
                    outcomes.insert(node_id, NodeOutcome::Skipped(status));
                    continue;
                }
            }
            dispatch.push((node_id, partitions));
        }
        if dispatch.is_empty() {
            return outcomes;
        }

        let expected = dispatch.len();
        let (tx, mut rx) = mpsc::channel(expected);
        for (node_id, partitions) in dispatch.iter().cloned() {
            let tx = tx.clone();
            let provider = self.provider.clone();
            self.tasks.spawn(async move {
                let outcome =
                    match timeout_at(deadline, provider.query(node_id, partitions, deadline)).await
                    {
                        Ok(Ok(result)) => NodeOutcome::Responded(result),
                        Ok(Err(err)) if err.downcast_ref::<DeadlineExceeded>().is_some() => {
                            NodeOutcome::TimedOut
                        }
                        Ok(Err(err)) => NodeOutcome::Failed(format!("{err:#}")),
                        Err(_) => NodeOutcome::TimedOut,
                    };
                // Capacity covers every worker; this only fails once the
                // coordinator has stopped listening.
                let _ = tx.try_send((node_id, outcome));
            });
        }
        drop(tx);

        let mut received = 0;
        while received < expected {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((node_id, outcome))) => {
                    outcomes.insert(node_id, outcome);
                    received += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if received < expected {
            for (node_id, _) in &dispatch {
                outcomes.entry(*node_id).or_insert(NodeOutcome::TimedOut);
            }
            tracing::warn!(
                expected,
                received,
                "stats fan-out deadline reached before every node reported"
            );
        }
        outcomes
    }
}

/// One request per node, with the union of its partitions.
fn dedupe(requests: Vec<StatsRequest>) -> BTreeMap<NodeId, Vec<PartitionId>> {
    let mut merged: BTreeMap<NodeId, BTreeSet<PartitionId>> = BTreeMap::new();
    for request in requests {
        merged
            .entry(request.node_id)
            .or_default()
            .extend(request.partitions);
    }
    merged
        .into_iter()
        .map(|(node_id, partitions)| (node_id, partitions.into_iter().collect()))
        .collect()
}
