//! Local fjall-backed partition store.
//!
//! Each hosted partition (range) lives in its own fjall partition named
//! `range_{id}`; the set of hosted ranges is persisted in `hosted_ranges` so
//! it survives restarts. Stats are computed by scanning, bounded by the
//! caller's deadline.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use holo_control::{
    DeadlineExceeded, NodeId, PartitionId, PartitionStats, PartitionStatsResult,
};

/// Check the deadline every this many scanned entries.
const DEADLINE_CHECK_EVERY: u64 = 256;

pub struct LocalStore {
    keyspace: Arc<Keyspace>,
    hosted_index: PartitionHandle,
    ranges: RwLock<BTreeMap<PartitionId, PartitionHandle>>,
}

fn range_partition_name(partition_id: PartitionId) -> String {
    format!("range_{partition_id}")
}

fn decode_partition_id(bytes: &[u8]) -> anyhow::Result<PartitionId> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("invalid hosted range key length {}", bytes.len()))?;
    Ok(PartitionId::from_be_bytes(raw))
}

impl LocalStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = Arc::new(
            fjall::Config::new(path)
                .open()
                .context("open fjall keyspace")?,
        );
        let hosted_index = keyspace
            .open_partition("hosted_ranges", PartitionCreateOptions::default())
            .context("open hosted range index")?;

        let mut ranges = BTreeMap::new();
        for item in hosted_index.iter() {
            let (key, _) = item?;
            let partition_id = decode_partition_id(&key)?;
            let handle = keyspace.open_partition(
                &range_partition_name(partition_id),
                PartitionCreateOptions::default(),
            )?;
            ranges.insert(partition_id, handle);
        }
        if !ranges.is_empty() {
            tracing::info!(ranges = ranges.len(), "reopened hosted ranges");
        }

        Ok(Self {
            keyspace,
            hosted_index,
            ranges: RwLock::new(ranges),
        })
    }

    /// Start hosting `partition_id` (no-op if already hosted).
    pub fn ensure_hosted(&self, partition_id: PartitionId) -> anyhow::Result<()> {
        let mut ranges = self
            .ranges
            .write()
            .map_err(|_| anyhow!("range map lock poisoned"))?;
        if ranges.contains_key(&partition_id) {
            return Ok(());
        }
        let handle = self.keyspace.open_partition(
            &range_partition_name(partition_id),
            PartitionCreateOptions::default(),
        )?;
        self.hosted_index
            .insert(partition_id.to_be_bytes().as_slice(), b"".as_slice())
            .context("record hosted range")?;
        ranges.insert(partition_id, handle);
        Ok(())
    }

    pub fn hosted(&self) -> anyhow::Result<Vec<PartitionId>> {
        let ranges = self
            .ranges
            .read()
            .map_err(|_| anyhow!("range map lock poisoned"))?;
        Ok(ranges.keys().copied().collect())
    }

    fn handle(&self, partition_id: PartitionId) -> anyhow::Result<Option<PartitionHandle>> {
        let ranges = self
            .ranges
            .read()
            .map_err(|_| anyhow!("range map lock poisoned"))?;
        Ok(ranges.get(&partition_id).cloned())
    }

    /// Flush the journal to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall keyspace")
    }

    pub fn put(&self, partition_id: PartitionId, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let handle = self
            .handle(partition_id)?
            .with_context(|| format!("range {partition_id} is not hosted on this node"))?;
        handle.insert(key, value)?;
        Ok(())
    }

    /// Stats for every requested partition this node hosts. Partitions it
    /// does not host are left out of the result.
    pub async fn partition_stats(
        &self,
        node_id: NodeId,
        partitions: Vec<PartitionId>,
        deadline: tokio::time::Instant,
    ) -> anyhow::Result<PartitionStatsResult> {
        let mut handles = Vec::with_capacity(partitions.len());
        for partition_id in partitions {
            if let Some(handle) = self.handle(partition_id)? {
                handles.push((partition_id, handle));
            }
        }

        let deadline = deadline.into_std();
        let partitions = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(|(partition_id, handle)| {
                    scan_partition(node_id, partition_id, &handle, deadline)
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await
        .context("stats scan task failed")??;

        Ok(PartitionStatsResult {
            node_id,
            partitions,
        })
    }
}

fn scan_partition(
    node_id: NodeId,
    partition_id: PartitionId,
    handle: &PartitionHandle,
    deadline: std::time::Instant,
) -> anyhow::Result<PartitionStats> {
    let mut key_count = 0u64;
    let mut stored_bytes = 0u64;
    for item in handle.iter() {
        let (key, value) = item?;
        key_count += 1;
        stored_bytes += (key.len() + value.len()) as u64;
        if key_count % DEADLINE_CHECK_EVERY == 0 && std::time::Instant::now() >= deadline {
            return Err(anyhow::Error::new(DeadlineExceeded { node_id })
                .context(format!("stats scan of range {partition_id}")));
        }
    }
    Ok(PartitionStats {
        partition_id,
        key_count,
        approximate_stored_bytes: stored_bytes,
    })
}
