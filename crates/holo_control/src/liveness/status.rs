//! Pure liveness classification.
//!
//! Both the liveness API and the fan-out target filter call `classify`, so
//! the meaning of "live" cannot drift between call sites.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::{LivenessRecord, MembershipState};

/// Observable liveness of a node. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeLivenessStatus {
    /// No record has ever been observed.
    Unknown,
    Live,
    /// Lease expired recently; may be a transient delay.
    Unavailable,
    /// Lease expired beyond the dead threshold.
    Dead,
    Draining,
    Decommissioning,
    Decommissioned,
}

impl NodeLivenessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeLivenessStatus::Unknown => "UNKNOWN",
            NodeLivenessStatus::Live => "LIVE",
            NodeLivenessStatus::Unavailable => "UNAVAILABLE",
            NodeLivenessStatus::Dead => "DEAD",
            NodeLivenessStatus::Draining => "DRAINING",
            NodeLivenessStatus::Decommissioning => "DECOMMISSIONING",
            NodeLivenessStatus::Decommissioned => "DECOMMISSIONED",
        }
    }

    /// Whether a request to this node has any chance of being answered.
    ///
    /// Unknown and Unavailable nodes are still tried: the former may simply
    /// not have gossiped yet, the latter may be a short stall.
    pub fn is_contactable(self) -> bool {
        !matches!(
            self,
            NodeLivenessStatus::Dead | NodeLivenessStatus::Decommissioned
        )
    }
}

impl fmt::Display for NodeLivenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time thresholds applied by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessThresholds {
    /// How long past expiration a node stays Unavailable before it is Dead.
    pub dead_after: Duration,
}

impl LivenessThresholds {
    fn dead_after_ms(&self) -> u64 {
        self.dead_after.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

/// Map a record and the evaluator's current time to a status.
///
/// Decommissioned is terminal and overrides every time-based check. An
/// unexpired lease is Live, refined to Decommissioning or Draining by the
/// record's administrative flags. An expired lease is Unavailable until the
/// dead threshold has elapsed, then Dead.
pub fn classify(
    record: Option<&LivenessRecord>,
    now_ms: u64,
    thresholds: LivenessThresholds,
) -> NodeLivenessStatus {
    let Some(record) = record else {
        return NodeLivenessStatus::Unknown;
    };

    if record.membership == MembershipState::Decommissioned {
        return NodeLivenessStatus::Decommissioned;
    }

    if now_ms < record.expiration_ms {
        if record.membership == MembershipState::Decommissioning {
            return NodeLivenessStatus::Decommissioning;
        }
        if record.draining {
            return NodeLivenessStatus::Draining;
        }
        return NodeLivenessStatus::Live;
    }

    if now_ms - record.expiration_ms < thresholds.dead_after_ms() {
        NodeLivenessStatus::Unavailable
    } else {
        NodeLivenessStatus::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: LivenessThresholds = LivenessThresholds {
        dead_after: Duration::from_secs(60),
    };

    fn record(expiration_ms: u64) -> LivenessRecord {
        LivenessRecord::new(1, 1, expiration_ms)
    }

    #[test]
    fn missing_record_is_unknown() {
        assert_eq!(classify(None, 0, THRESHOLDS), NodeLivenessStatus::Unknown);
    }

    #[test]
    fn lease_boundaries() {
        let rec = record(10_000);
        assert_eq!(classify(Some(&rec), 9_999, THRESHOLDS), NodeLivenessStatus::Live);
        // Expiration itself is no longer covered by the lease.
        assert_eq!(
            classify(Some(&rec), 10_000, THRESHOLDS),
            NodeLivenessStatus::Unavailable
        );
        assert_eq!(
            classify(Some(&rec), 69_999, THRESHOLDS),
            NodeLivenessStatus::Unavailable
        );
        assert_eq!(classify(Some(&rec), 70_000, THRESHOLDS), NodeLivenessStatus::Dead);
    }

    #[test]
    fn status_degrades_monotonically_without_renewal() {
        let rec = record(5_000);
        let rank = |s: NodeLivenessStatus| match s {
            NodeLivenessStatus::Live => 0,
            NodeLivenessStatus::Unavailable => 1,
            NodeLivenessStatus::Dead => 2,
            other => panic!("unexpected status {other}"),
        };
        let mut last = 0;
        for now in (0..200_000).step_by(250) {
            let current = rank(classify(Some(&rec), now, THRESHOLDS));
            assert!(current >= last, "status reverted at t={now}");
            last = current;
        }
        assert_eq!(last, 2);
    }

    #[test]
    fn flags_refine_live_only_while_lease_is_valid() {
        let mut rec = record(10_000);
        rec.draining = true;
        assert_eq!(classify(Some(&rec), 1, THRESHOLDS), NodeLivenessStatus::Draining);
        assert_eq!(
            classify(Some(&rec), 20_000, THRESHOLDS),
            NodeLivenessStatus::Unavailable
        );

        rec.membership = MembershipState::Decommissioning;
        assert_eq!(
            classify(Some(&rec), 1, THRESHOLDS),
            NodeLivenessStatus::Decommissioning
        );
        assert_eq!(classify(Some(&rec), 500_000, THRESHOLDS), NodeLivenessStatus::Dead);
    }

    #[test]
    fn decommissioned_overrides_time() {
        let mut rec = record(10_000);
        rec.membership = MembershipState::Decommissioned;
        for now in [0, 10_000, 1_000_000] {
            assert_eq!(
                classify(Some(&rec), now, THRESHOLDS),
                NodeLivenessStatus::Decommissioned
            );
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let rec = record(42_000);
        let first = classify(Some(&rec), 50_000, THRESHOLDS);
        for _ in 0..10 {
            assert_eq!(classify(Some(&rec), 50_000, THRESHOLDS), first);
        }
    }

    #[test]
    fn contactable_excludes_dead_and_decommissioned() {
        assert!(NodeLivenessStatus::Live.is_contactable());
        assert!(NodeLivenessStatus::Unknown.is_contactable());
        assert!(NodeLivenessStatus::Unavailable.is_contactable());
        assert!(NodeLivenessStatus::Draining.is_contactable());
        assert!(!NodeLivenessStatus::Dead.is_contactable());
        assert!(!NodeLivenessStatus::Decommissioned.is_contactable());
    }
}
