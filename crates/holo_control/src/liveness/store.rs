//! Liveness record storage.
//!
//! Every local mutation (self-renewal, fencing, membership changes) goes
//! through `conditional_put`, keyed on the epoch the caller last observed.
//! Records learned from other nodes enter through `merge_remote`, which only
//! ever moves a record forward.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::anyhow;
use async_trait::async_trait;

use super::record::LivenessRecord;
use crate::types::NodeId;

/// A conditional update observed a different epoch than the caller expected.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "liveness record for node {node_id} changed concurrently (expected epoch {expected:?}, found {actual:?})"
)]
pub struct CasConflict {
    pub node_id: NodeId,
    pub expected: Option<u64>,
    /// The record as re-read when the condition failed.
    pub actual: Option<LivenessRecord>,
}

impl CasConflict {
    pub fn actual_epoch(&self) -> u64 {
        self.actual.map(|r| r.epoch).unwrap_or(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] CasConflict),
    #[error("invalid liveness update: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Owner of the per-node liveness records known to this process.
#[async_trait]
pub trait LivenessStore: Send + Sync + 'static {
    async fn get(&self, node_id: NodeId) -> anyhow::Result<Option<LivenessRecord>>;

    /// All known records, ordered by node id.
    async fn list(&self) -> anyhow::Result<Vec<LivenessRecord>>;

    /// Install `next` only if the stored epoch equals `expected_epoch`
    /// (`None` means no record may exist yet). Returns the stored record.
    ///
    /// Implementations must reject updates that lower the epoch or, within an
    /// epoch, move the expiration backwards, and must never regress membership.
    async fn conditional_put(
        &self,
        expected_epoch: Option<u64>,
        next: LivenessRecord,
    ) -> Result<LivenessRecord, StoreError>;

    /// Fold in a record received from another node. Returns true when the
    /// local view changed.
    async fn merge_remote(&self, incoming: LivenessRecord) -> anyhow::Result<bool>;
}

/// In-process liveness store.
#[derive(Debug, Default)]
pub struct MemoryLivenessStore {
    records: RwLock<BTreeMap<NodeId, LivenessRecord>>,
}

impl MemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_transition(
    current: Option<&LivenessRecord>,
    next: &LivenessRecord,
) -> Result<(), StoreError> {
    let Some(current) = current else {
        return Ok(());
    };
    if next.epoch < current.epoch {
        return Err(StoreError::Invalid(format!(
            "epoch for node {} would regress from {} to {}",
            next.node_id, current.epoch, next.epoch
        )));
    }
    if next.epoch == current.epoch && next.expiration_ms < current.expiration_ms {
        return Err(StoreError::Invalid(format!(
            "expiration for node {} would regress within epoch {} ({} -> {})",
            next.node_id, next.epoch, current.expiration_ms, next.expiration_ms
        )));
    }
    Ok(())
}

#[async_trait]
impl LivenessStore for MemoryLivenessStore {
    async fn get(&self, node_id: NodeId) -> anyhow::Result<Option<LivenessRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("liveness store lock poisoned"))?;
        Ok(records.get(&node_id).copied())
    }

    async fn list(&self) -> anyhow::Result<Vec<LivenessRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("liveness store lock poisoned"))?;
        Ok(records.values().copied().collect())
    }

    async fn conditional_put(
        &self,
        expected_epoch: Option<u64>,
        next: LivenessRecord,
    ) -> Result<LivenessRecord, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("liveness store lock poisoned"))?;
        let current = records.get(&next.node_id).copied();

        if current.map(|r| r.epoch) != expected_epoch {
            return Err(CasConflict {
                node_id: next.node_id,
                expected: expected_epoch,
                actual: current,
            }
            .into());
        }
        validate_transition(current.as_ref(), &next)?;

        let stored = match current {
            Some(current) => LivenessRecord {
                membership: next.membership.max(current.membership),
                ..next
            },
            None => next,
        };
        records.insert(stored.node_id, stored);
        Ok(stored)
    }

    async fn merge_remote(&self, incoming: LivenessRecord) -> anyhow::Result<bool> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("liveness store lock poisoned"))?;
        match records.get(&incoming.node_id).copied() {
            None => {
                records.insert(incoming.node_id, incoming);
                Ok(true)
            }
            Some(current) => {
                let merged = current.merge(&incoming);
                if merged == current {
                    return Ok(false);
                }
                records.insert(incoming.node_id, merged);
                Ok(true)
            }
        }
    }
}
