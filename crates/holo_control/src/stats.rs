//! Cluster-wide stats: target resolution and aggregation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::fanout::{NodeOutcome, StatsFanoutCoordinator, StatsRequest};
use crate::types::{NodeId, PartitionId};

/// A partition and the nodes assigned to host its replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub partition_id: PartitionId,
    pub replicas: Vec<NodeId>,
}

/// What an administrative stats request is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsTarget {
    Table { database: String, table: String },
    Database { database: String },
}

impl StatsTarget {
    pub fn database(&self) -> &str {
        match self {
            StatsTarget::Table { database, .. } | StatsTarget::Database { database } => database,
        }
    }
}

impl std::fmt::Display for StatsTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsTarget::Table { database, table } => write!(f, "{database}.{table}"),
            StatsTarget::Database { database } => write!(f, "{database}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("database {0:?} not found")]
    DatabaseNotFound(String),
    #[error("table {table:?} not found in database {database:?}")]
    TableNotFound { database: String, table: String },
    /// The name matched more than one object (e.g. differing only by case).
    #[error("{kind} name {name:?} is ambiguous: {candidates:?}")]
    Ambiguous {
        kind: &'static str,
        name: String,
        candidates: Vec<String>,
    },
}

impl ResolutionError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ResolutionError::DatabaseNotFound(_) | ResolutionError::TableNotFound { .. }
        )
    }
}

/// Maps a table or database to the partitions backing it.
#[async_trait]
pub trait RangeLocator: Send + Sync + 'static {
    async fn resolve(
        &self,
        target: &StatsTarget,
    ) -> Result<Vec<PartitionDescriptor>, ResolutionError>;
}

/// Aggregated stats over a set of partitions.
///
/// Sums cover successful node results only. Partial coverage shows up in
/// `missing_node_ids`, never as an estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterStatsReport {
    pub partition_count: u64,
    pub replica_count: u64,
    /// Number of nodes that were asked.
    pub node_count: u64,
    pub responding_node_ids: Vec<NodeId>,
    pub missing_node_ids: Vec<NodeId>,
    /// Explicit failures; these nodes are also listed in `missing_node_ids`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_errors: BTreeMap<NodeId, String>,
    pub aggregated_key_count: u64,
    pub aggregated_stored_bytes: u64,
}

impl ClusterStatsReport {
    pub fn is_complete(&self) -> bool {
        self.missing_node_ids.is_empty()
    }
}

/// Host node -> partitions it is assigned.
fn hosted_by_node(partitions: &[PartitionDescriptor]) -> BTreeMap<NodeId, BTreeSet<PartitionId>> {
    let mut hosted: BTreeMap<NodeId, BTreeSet<PartitionId>> = BTreeMap::new();
    for descriptor in partitions {
        for node_id in &descriptor.replicas {
            hosted
                .entry(*node_id)
                .or_default()
                .insert(descriptor.partition_id);
        }
    }
    hosted
}

/// One fan-out request per host node.
pub fn stats_requests(partitions: &[PartitionDescriptor]) -> Vec<StatsRequest> {
    hosted_by_node(partitions)
        .into_iter()
        .map(|(node_id, partitions)| StatsRequest {
            node_id,
            partitions: partitions.into_iter().collect(),
        })
        .collect()
}

/// Merge per-node outcomes into a report.
///
/// Every node named as a host is a target. Targets without a successful
/// outcome (timed out, failed, skipped, or absent from `outcomes`) are
/// missing. A responding node contributes one replica for each assigned
/// partition it reported; partitions it did not report (e.g. not yet
/// replicated there) add nothing.
pub fn aggregate(
    partitions: &[PartitionDescriptor],
    outcomes: &BTreeMap<NodeId, NodeOutcome>,
) -> ClusterStatsReport {
    let hosted = hosted_by_node(partitions);
    let distinct: BTreeSet<PartitionId> = partitions.iter().map(|p| p.partition_id).collect();

    let mut report = ClusterStatsReport {
        partition_count: distinct.len() as u64,
        node_count: hosted.len() as u64,
        ..ClusterStatsReport::default()
    };

    for (node_id, assigned) in &hosted {
        match outcomes.get(node_id) {
            Some(NodeOutcome::Responded(result)) => {
                report.responding_node_ids.push(*node_id);
                let mut seen = BTreeSet::new();
                for stats in &result.partitions {
                    if !assigned.contains(&stats.partition_id) || !seen.insert(stats.partition_id)
                    {
                        continue;
                    }
                    report.replica_count += 1;
                    report.aggregated_key_count += stats.key_count;
                    report.aggregated_stored_bytes += stats.approximate_stored_bytes;
                }
            }
            Some(NodeOutcome::Failed(message)) => {
                report.missing_node_ids.push(*node_id);
                report.node_errors.insert(*node_id, message.clone());
            }
            Some(NodeOutcome::TimedOut) | Some(NodeOutcome::Skipped(_)) | None => {
                report.missing_node_ids.push(*node_id);
            }
        }
    }
    report
}

/// Resolve `target`, fan out to its hosts, and aggregate.
///
/// Only resolution fails the request; node failures and timeouts end up in
/// the report.
pub async fn cluster_stats(
    locator: &dyn RangeLocator,
    coordinator: &StatsFanoutCoordinator,
    target: &StatsTarget,
    deadline: Instant,
) -> Result<ClusterStatsReport, ResolutionError> {
    let partitions = locator.resolve(target).await?;
    let outcomes = coordinator
        .collect(stats_requests(&partitions), deadline)
        .await;
    let report = aggregate(&partitions, &outcomes);
    if report.is_complete() {
        tracing::debug!(
            scope = %target,
            partitions = report.partition_count,
            replicas = report.replica_count,
            "collected cluster stats"
        );
    } else {
        tracing::info!(
            scope = %target,
            missing = ?report.missing_node_ids,
            responding = ?report.responding_node_ids,
            "collected partial cluster stats"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{PartitionStats, PartitionStatsResult, StatsProvider};
    use crate::liveness::NodeLivenessStatus;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn partition(partition_id: PartitionId, replicas: &[NodeId]) -> PartitionDescriptor {
        PartitionDescriptor {
            partition_id,
            replicas: replicas.to_vec(),
        }
    }

    fn responded(node_id: NodeId, parts: &[(PartitionId, u64)]) -> NodeOutcome {
        NodeOutcome::Responded(PartitionStatsResult {
            node_id,
            partitions: parts
                .iter()
                .map(|&(partition_id, key_count)| PartitionStats {
                    partition_id,
                    key_count,
                    approximate_stored_bytes: key_count * 100,
                })
                .collect(),
        })
    }

    #[test]
    fn requests_group_partitions_by_host() {
        let requests = stats_requests(&[partition(1, &[3, 1]), partition(2, &[1, 2])]);
        assert_eq!(
            requests,
            vec![
                StatsRequest {
                    node_id: 1,
                    partitions: vec![1, 2]
                },
                StatsRequest {
                    node_id: 2,
                    partitions: vec![2]
                },
                StatsRequest {
                    node_id: 3,
                    partitions: vec![1]
                },
            ]
        );
    }

    #[test]
    fn all_replicas_respond() {
        let partitions = [partition(7, &[1, 2, 3])];
        let outcomes = BTreeMap::from([
            (1, responded(1, &[(7, 10)])),
            (2, responded(2, &[(7, 10)])),
            (3, responded(3, &[(7, 10)])),
        ]);
        let report = aggregate(&partitions, &outcomes);
        assert_eq!(report.partition_count, 1);
        assert_eq!(report.replica_count, 3);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.responding_node_ids, vec![1, 2, 3]);
        assert!(report.missing_node_ids.is_empty());
        assert!(report.aggregated_key_count >= 10);
        assert_eq!(report.aggregated_stored_bytes, 3_000);
    }

    #[test]
    fn stopped_replica_is_missing_and_contributes_nothing() {
        let partitions = [partition(7, &[1, 2, 3])];
        let outcomes = BTreeMap::from([
            (1, responded(1, &[(7, 10)])),
            (2, NodeOutcome::TimedOut),
            (3, responded(3, &[(7, 10)])),
        ]);
        let report = aggregate(&partitions, &outcomes);
        assert_eq!(report.partition_count, 1);
        assert_eq!(report.replica_count, 2);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.responding_node_ids, vec![1, 3]);
        assert_eq!(report.missing_node_ids, vec![2]);
        assert_eq!(report.aggregated_key_count, 20);
        assert!(report.node_errors.is_empty());
    }

    #[test]
    fn errors_are_missing_but_reported_separately() {
        let partitions = [partition(1, &[1, 2]), partition(2, &[2, 3])];
        let outcomes = BTreeMap::from([
            (1, responded(1, &[(1, 4)])),
            (2, NodeOutcome::Failed("disk full".into())),
            (3, NodeOutcome::Skipped(NodeLivenessStatus::Dead)),
        ]);
        let report = aggregate(&partitions, &outcomes);
        assert_eq!(report.partition_count, 2);
        assert_eq!(report.replica_count, 1);
        assert_eq!(report.missing_node_ids, vec![2, 3]);
        assert_eq!(report.node_errors.get(&2).map(String::as_str), Some("disk full"));
        assert_eq!(report.aggregated_key_count, 4);
    }

    #[test]
    fn unassigned_and_duplicate_partitions_are_ignored() {
        let partitions = [partition(1, &[1])];
        let outcomes = BTreeMap::from([
            (1, responded(1, &[(1, 5), (1, 5), (99, 1_000)])),
            (42, responded(42, &[(1, 5)])),
        ]);
        let report = aggregate(&partitions, &outcomes);
        assert_eq!(report.replica_count, 1);
        assert_eq!(report.aggregated_key_count, 5);
        assert_eq!(report.responding_node_ids, vec![1]);
    }

    #[test]
    fn partition_count_is_independent_of_responses() {
        let partitions = [partition(1, &[1]), partition(2, &[1]), partition(3, &[2])];
        let report = aggregate(&partitions, &BTreeMap::new());
        assert_eq!(report.partition_count, 3);
        assert_eq!(report.replica_count, 0);
        assert_eq!(report.missing_node_ids, vec![1, 2]);
        assert!(!report.is_complete());
    }

    #[test]
    fn aggregation_is_order_independent() {
        let partitions = [partition(1, &[1, 2, 3])];
        let entries = [
            (3, responded(3, &[(1, 1)])),
            (1, responded(1, &[(1, 2)])),
            (2, NodeOutcome::TimedOut),
        ];
        let forward: BTreeMap<_, _> = entries.iter().cloned().collect();
        let backward: BTreeMap<_, _> = entries.iter().rev().cloned().collect();
        assert_eq!(aggregate(&partitions, &forward), aggregate(&partitions, &backward));
    }

    struct StaticLocator;

    #[async_trait]
    impl RangeLocator for StaticLocator {
        async fn resolve(
            &self,
            target: &StatsTarget,
        ) -> Result<Vec<PartitionDescriptor>, ResolutionError> {
            match target {
                StatsTarget::Table { table, .. } if table == "orders" => {
                    Ok(vec![partition(1, &[1, 2, 3])])
                }
                StatsTarget::Table { database, table } => Err(ResolutionError::TableNotFound {
                    database: database.clone(),
                    table: table.clone(),
                }),
                StatsTarget::Database { database } => {
                    Err(ResolutionError::DatabaseNotFound(database.clone()))
                }
            }
        }
    }

    struct DownNodes(HashSet<NodeId>);

    #[async_trait]
    impl StatsProvider for DownNodes {
        async fn query(
            &self,
            node_id: NodeId,
            partitions: Vec<PartitionId>,
            _deadline: Instant,
        ) -> anyhow::Result<PartitionStatsResult> {
            if self.0.contains(&node_id) {
                std::future::pending::<()>().await;
            }
            Ok(PartitionStatsResult {
                node_id,
                partitions: partitions
                    .into_iter()
                    .map(|partition_id| PartitionStats {
                        partition_id,
                        key_count: 10,
                        approximate_stored_bytes: 640,
                    })
                    .collect(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_stats_returns_best_effort_report() {
        let coordinator = StatsFanoutCoordinator::new(Arc::new(DownNodes(HashSet::from([2]))));
        let target = StatsTarget::Table {
            database: "shop".into(),
            table: "orders".into(),
        };
        let report = cluster_stats(
            &StaticLocator,
            &coordinator,
            &target,
            Instant::now() + Duration::from_millis(250),
        )
        .await
        .expect("resolution succeeds");
        assert_eq!(report.replica_count, 2);
        assert_eq!(report.missing_node_ids, vec![2]);
        assert_eq!(report.aggregated_key_count, 20);
    }

    #[tokio::test]
    async fn resolution_failure_is_fatal() {
        let coordinator = StatsFanoutCoordinator::new(Arc::new(DownNodes(HashSet::new())));
        let target = StatsTarget::Table {
            database: "shop".into(),
            table: "missing".into(),
        };
        let err = cluster_stats(
            &StaticLocator,
            &coordinator,
            &target,
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .expect_err("unknown table");
        assert!(err.is_not_found());
        assert_eq!(coordinator.inflight(), 0);
    }
}
