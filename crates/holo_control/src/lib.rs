//! HoloStore control-plane crate.
//!
//! Two subsystems live here, both transport-agnostic:
//! - `liveness`: lease-based node liveness (records, store, classifier,
//!   tracker and its renewal loop).
//! - `fanout` + `stats`: concurrent per-node stats collection bounded by a
//!   deadline, and the merge of per-node results into one cluster report.
//!
//! Higher layers supply the collaborators (`LivenessStore`,
//! `BroadcastChannel`, `StatsProvider`, `RangeLocator`) and drive the
//! operations; this crate never performs network IO itself.

pub mod fanout;
pub mod liveness;
pub mod stats;
mod types;

pub use fanout::{
    DeadlineExceeded, LivenessOracle, NodeOutcome, PartitionStats, PartitionStatsResult,
    StatsFanoutCoordinator, StatsProvider, StatsRequest,
};
pub use liveness::{
    classify, spawn_gossip_listener, spawn_renewal_loop, BroadcastChannel, CasConflict,
    FenceError, LivenessConfig, LivenessRecord, LivenessStore, LivenessThresholds,
    LivenessTracker, LocalBroadcast, MembershipError, MembershipState, MemoryLivenessStore,
    NodeLivenessStatus, RenewalError, StoreError,
};
pub use stats::{
    aggregate, cluster_stats, stats_requests, ClusterStatsReport, PartitionDescriptor,
    RangeLocator, ResolutionError, StatsTarget,
};
pub use types::{unix_time_ms, Clock, ManualClock, NodeId, PartitionId, SystemClock};
