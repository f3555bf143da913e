//! Liveness record: one node's lease as last observed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Administrative membership of a node.
///
/// Variants are ordered by lifecycle; a node only ever moves forward, and a
/// decommissioned record is terminal and never deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipState {
    Active,
    Decommissioning,
    Decommissioned,
}

impl MembershipState {
    pub fn as_str(self) -> &'static str {
        match self {
            MembershipState::Active => "ACTIVE",
            MembershipState::Decommissioning => "DECOMMISSIONING",
            MembershipState::Decommissioned => "DECOMMISSIONED",
        }
    }

    /// Whether `next` is reachable from `self` (including staying put).
    pub fn can_transition_to(self, next: MembershipState) -> bool {
        next >= self
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(MembershipState::Active),
            "decommissioning" => Ok(MembershipState::Decommissioning),
            "decommissioned" => Ok(MembershipState::Decommissioned),
            other => anyhow::bail!("unknown membership state: {other}"),
        }
    }
}

/// Lease state for a single node.
///
/// `epoch` is the fencing authority: a record with a higher epoch supersedes
/// any record with a lower one regardless of expiration. Within one epoch,
/// `expiration_ms` never moves backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessRecord {
    pub node_id: NodeId,
    pub epoch: u64,
    /// Absolute wall-clock time (unix ms) after which the lease is invalid.
    pub expiration_ms: u64,
    pub draining: bool,
    pub membership: MembershipState,
}

impl LivenessRecord {
    pub fn new(node_id: NodeId, epoch: u64, expiration_ms: u64) -> Self {
        Self {
            node_id,
            epoch,
            expiration_ms,
            draining: false,
            membership: MembershipState::Active,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expiration_ms
    }

    fn order_key(&self) -> (u64, u64, MembershipState) {
        (self.epoch, self.expiration_ms, self.membership)
    }

    /// Returns true when `self` is a strictly newer observation than `other`.
    pub fn supersedes(&self, other: &LivenessRecord) -> bool {
        debug_assert_eq!(self.node_id, other.node_id);
        self.order_key() > other.order_key()
    }

    /// Combine two observations of the same node.
    ///
    /// The newer record wins, but membership is carried forward from whichever
    /// side has progressed further so a renewal built from a stale read can
    /// never undo a decommission.
    pub fn merge(&self, other: &LivenessRecord) -> LivenessRecord {
        let (newer, older) = if other.supersedes(self) {
            (other, self)
        } else {
            (self, other)
        };
        LivenessRecord {
            membership: newer.membership.max(older.membership),
            ..*newer
        }
    }
}
