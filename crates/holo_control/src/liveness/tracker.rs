//! Ownership of the local node's lease.
//!
//! The tracker renews the local record through the store's conditional
//! update, publishes every change, and answers status queries for any node
//! from the merged view. Two background tasks accompany it: the renewal loop
//! (the node's proof of life) and the gossip listener that folds in records
//! from peers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::gossip::BroadcastChannel;
use super::record::{LivenessRecord, MembershipState};
use super::status::{classify, LivenessThresholds, NodeLivenessStatus};
use super::store::{LivenessStore, StoreError};
use crate::types::{Clock, NodeId};

/// Bounded retries for conditional updates that race with non-fencing writers.
const MAX_CAS_RETRIES: usize = 3;

/// Lease timing and failure policy.
#[derive(Clone, Copy, Debug)]
pub struct LivenessConfig {
    /// How far past "now" each renewal pushes the expiration.
    pub lease_duration: Duration,
    /// Renewal cadence; must leave headroom below `lease_duration`.
    pub renew_interval: Duration,
    /// Expired for at least this long => Dead.
    pub dead_threshold: Duration,
    /// Expired for at least this long => another node may fence the epoch.
    pub fence_threshold: Duration,
    /// Consecutive failed renewals before the node marks itself degraded.
    pub max_renewal_failures: u32,
    /// Republish every known record each N renewal ticks (0 disables).
    pub resync_every_ticks: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(9);
        Self {
            lease_duration,
            renew_interval: lease_duration / 2,
            dead_threshold: Duration::from_secs(60),
            fence_threshold: lease_duration,
            max_renewal_failures: 3,
            resync_every_ticks: 4,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.lease_duration.is_zero(),
            "lease duration must be positive"
        );
        anyhow::ensure!(
            !self.renew_interval.is_zero() && self.renew_interval < self.lease_duration,
            "renew interval ({:?}) must be positive and below the lease duration ({:?})",
            self.renew_interval,
            self.lease_duration
        );
        anyhow::ensure!(
            self.max_renewal_failures > 0,
            "max renewal failures must be at least 1"
        );
        Ok(())
    }

    pub fn thresholds(&self) -> LivenessThresholds {
        LivenessThresholds {
            dead_after: self.dead_threshold,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[derive(Debug, thiserror::Error)]
pub enum RenewalError {
    /// A fence raised the epoch underneath this node. The lease under
    /// `expected` is void; the node must restart its lease at `actual`.
    #[error("lease epoch {expected} for node {node_id} was superseded by epoch {actual}")]
    EpochMismatch {
        node_id: NodeId,
        expected: u64,
        actual: u64,
    },
    #[error("node {0} has no registered liveness record")]
    NotRegistered(NodeId),
    #[error("node {0} is decommissioned")]
    Decommissioned(NodeId),
    #[error("liveness store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    /// Someone else changed the epoch first. Safe to ignore.
    #[error("fence of node {node_id} lost the race (observed epoch {observed_epoch}, now {current_epoch})")]
    LostRace {
        node_id: NodeId,
        observed_epoch: u64,
        current_epoch: u64,
    },
    #[error("lease of node {node_id} has not been expired long enough to fence (expiration {expiration_ms}, now {now_ms})")]
    NotExpired {
        node_id: NodeId,
        expiration_ms: u64,
        now_ms: u64,
    },
    #[error("no liveness record for node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} cannot fence itself")]
    SelfFence(NodeId),
    #[error("node {0} is decommissioned")]
    Decommissioned(NodeId),
    #[error("liveness store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("no liveness record for node {0}")]
    UnknownNode(NodeId),
    #[error("node {node_id} cannot move from {from} to {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: MembershipState,
        to: MembershipState,
    },
    /// Concurrent writers kept changing the record between read and update.
    #[error("membership update for node {0} kept conflicting")]
    Conflict(NodeId),
    #[error("liveness store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Local lease owner plus read access to every known record.
pub struct LivenessTracker {
    node_id: NodeId,
    cfg: LivenessConfig,
    store: Arc<dyn LivenessStore>,
    broadcast: Arc<dyn BroadcastChannel>,
    clock: Arc<dyn Clock>,
    /// Epoch this node currently holds its lease under; 0 before registration.
    lease_epoch: AtomicU64,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl std::fmt::Debug for LivenessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessTracker")
            .field("node_id", &self.node_id)
            .field("lease_epoch", &self.lease_epoch.load(Ordering::SeqCst))
            .field("degraded", &self.degraded.load(Ordering::SeqCst))
            .finish()
    }
}

impl LivenessTracker {
    pub fn new(
        node_id: NodeId,
        cfg: LivenessConfig,
        store: Arc<dyn LivenessStore>,
        broadcast: Arc<dyn BroadcastChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_id,
            cfg,
            store,
            broadcast,
            clock,
            lease_epoch: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.cfg
    }

    pub fn lease_epoch(&self) -> u64 {
        self.lease_epoch.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Every owner update moves the expiration strictly forward, so peers
    /// treat it as newer even when the flags changed within one millisecond.
    fn extended(&self, current: &LivenessRecord, now_ms: u64) -> LivenessRecord {
        let target = now_ms.saturating_add(duration_ms(self.cfg.lease_duration));
        LivenessRecord {
            expiration_ms: target.max(current.expiration_ms.saturating_add(1)),
            ..*current
        }
    }

    /// Upper bound on one gossip publish made from the renewal path.
    ///
    /// Renewing and publishing share one tick, so a peer that never answers
    /// must not hold the tick past the next renewal.
    fn publish_budget(&self) -> Duration {
        (self.cfg.renew_interval / 4).max(Duration::from_millis(1))
    }

    async fn announce(&self, record: LivenessRecord) {
        let published =
            tokio::time::timeout(self.publish_budget(), self.broadcast.publish(record)).await;
        let err = match published {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(_) => anyhow::anyhow!("publish exceeded {:?}", self.publish_budget()),
        };
        // The store already holds the update; the next tick republishes.
        tracing::warn!(
            node_id = record.node_id,
            epoch = record.epoch,
            error = ?err,
            "failed to publish liveness record"
        );
    }

    /// Create or resume this node's record.
    ///
    /// A node with no record starts at epoch 1. A node whose previous lease
    /// already expired starts a fresh epoch, invalidating anything granted
    /// under the old one. An unexpired lease is simply renewed.
    pub async fn register(&self) -> Result<LivenessRecord, RenewalError> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now_ms();
            let current = self.store.get(self.node_id).await?;
            let next = match current {
                None => LivenessRecord::new(
                    self.node_id,
                    1,
                    now.saturating_add(duration_ms(self.cfg.lease_duration)),
                ),
                Some(rec) if rec.membership == MembershipState::Decommissioned => {
                    return Err(RenewalError::Decommissioned(self.node_id));
                }
                Some(rec) if rec.is_expired_at(now) => {
                    let bumped = LivenessRecord {
                        epoch: rec.epoch + 1,
                        draining: false,
                        ..rec
                    };
                    self.extended(&bumped, now)
                }
                Some(rec) => self.extended(
                    &LivenessRecord {
                        draining: false,
                        ..rec
                    },
                    now,
                ),
            };

            match self
                .store
                .conditional_put(current.map(|r| r.epoch), next)
                .await
            {
                Ok(stored) => {
                    self.lease_epoch.store(stored.epoch, Ordering::SeqCst);
                    tracing::info!(
                        node_id = self.node_id,
                        epoch = stored.epoch,
                        expiration_ms = stored.expiration_ms,
                        "registered node liveness"
                    );
                    self.announce(stored).await;
                    return Ok(stored);
                }
                Err(StoreError::Conflict(conflict)) => {
                    tracing::debug!(error = %conflict, "liveness registration raced, retrying");
                }
                Err(err) => return Err(RenewalError::Store(err.into())),
            }
        }
        let actual = self
            .store
            .get(self.node_id)
            .await?
            .map(|r| r.epoch)
            .unwrap_or(0);
        Err(RenewalError::EpochMismatch {
            node_id: self.node_id,
            expected: self.lease_epoch(),
            actual,
        })
    }

    /// This node's current record.
    pub async fn self_record(&self) -> Result<LivenessRecord, RenewalError> {
        self.store
            .get(self.node_id)
            .await?
            .ok_or(RenewalError::NotRegistered(self.node_id))
    }

    /// Extend the local lease by one lease duration from now.
    ///
    /// Conditioned on the epoch the lease is held under; if a fence raised it,
    /// this fails with `EpochMismatch` and the lease stays void until
    /// `restart_lease` succeeds.
    pub async fn renew(&self) -> Result<LivenessRecord, RenewalError> {
        self.update_own_record(|rec| rec).await
    }

    /// Set or clear the draining flag on the local record.
    pub async fn set_draining(&self, draining: bool) -> Result<LivenessRecord, RenewalError> {
        let record = self
            .update_own_record(move |rec| LivenessRecord { draining, ..rec })
            .await?;
        tracing::info!(node_id = self.node_id, draining, "updated draining flag");
        Ok(record)
    }

    async fn update_own_record<F>(&self, apply: F) -> Result<LivenessRecord, RenewalError>
    where
        F: Fn(LivenessRecord) -> LivenessRecord + Send,
    {
        let expected = self.lease_epoch();
        if expected == 0 {
            return Err(RenewalError::NotRegistered(self.node_id));
        }
        let current = self.self_record().await?;
        if current.membership == MembershipState::Decommissioned {
            return Err(RenewalError::Decommissioned(self.node_id));
        }
        if current.epoch != expected {
            return Err(RenewalError::EpochMismatch {
                node_id: self.node_id,
                expected,
                actual: current.epoch,
            });
        }

        let next = self.extended(&apply(current), self.clock.now_ms());
        match self.store.conditional_put(Some(expected), next).await {
            Ok(stored) => {
                self.announce(stored).await;
                Ok(stored)
            }
            Err(StoreError::Conflict(conflict)) => Err(RenewalError::EpochMismatch {
                node_id: self.node_id,
                expected,
                actual: conflict.actual_epoch(),
            }),
            Err(err) => Err(RenewalError::Store(err.into())),
        }
    }

    /// Adopt the epoch currently stored for this node and renew under it.
    pub async fn restart_lease(&self) -> Result<LivenessRecord, RenewalError> {
        let previous = self.lease_epoch();
        let current = self.self_record().await?;
        if current.membership == MembershipState::Decommissioned {
            return Err(RenewalError::Decommissioned(self.node_id));
        }
        let next = self.extended(&current, self.clock.now_ms());
        match self.store.conditional_put(Some(current.epoch), next).await {
            Ok(stored) => {
                self.lease_epoch.store(stored.epoch, Ordering::SeqCst);
                tracing::info!(
                    node_id = self.node_id,
                    previous_epoch = previous,
                    epoch = stored.epoch,
                    "restarted lease under new epoch"
                );
                self.announce(stored).await;
                Ok(stored)
            }
            Err(StoreError::Conflict(conflict)) => Err(RenewalError::EpochMismatch {
                node_id: self.node_id,
                expected: current.epoch,
                actual: conflict.actual_epoch(),
            }),
            Err(err) => Err(RenewalError::Store(err.into())),
        }
    }

    /// Classify any node from the most recent record known locally.
    pub async fn observe(&self, node_id: NodeId) -> NodeLivenessStatus {
        match self.store.get(node_id).await {
            Ok(record) => classify(record.as_ref(), self.clock.now_ms(), self.cfg.thresholds()),
            Err(err) => {
                tracing::warn!(node_id, error = ?err, "liveness lookup failed");
                NodeLivenessStatus::Unknown
            }
        }
    }

    /// Every known record with its status, all evaluated at the same instant.
    pub async fn livenesses(&self) -> anyhow::Result<Vec<(LivenessRecord, NodeLivenessStatus)>> {
        let records = self.store.list().await?;
        let now = self.clock.now_ms();
        let thresholds = self.cfg.thresholds();
        Ok(records
            .into_iter()
            .map(|rec| (rec, classify(Some(&rec), now, thresholds)))
            .collect())
    }

    /// Raise another node's epoch without extending its expiration.
    ///
    /// Only allowed once that node's lease has been expired for at least the
    /// fence threshold. Losing the conditional update to a concurrent fence
    /// (or to the node restarting itself) yields `LostRace`.
    pub async fn increment_epoch(&self, node_id: NodeId) -> Result<LivenessRecord, FenceError> {
        if node_id == self.node_id {
            return Err(FenceError::SelfFence(node_id));
        }
        let current = self
            .store
            .get(node_id)
            .await?
            .ok_or(FenceError::UnknownNode(node_id))?;
        if current.membership == MembershipState::Decommissioned {
            return Err(FenceError::Decommissioned(node_id));
        }

        let now = self.clock.now_ms();
        let fenceable_at = current
            .expiration_ms
            .saturating_add(duration_ms(self.cfg.fence_threshold));
        if now < fenceable_at {
            return Err(FenceError::NotExpired {
                node_id,
                expiration_ms: current.expiration_ms,
                now_ms: now,
            });
        }

        let next = LivenessRecord {
            epoch: current.epoch + 1,
            ..current
        };
        match self.store.conditional_put(Some(current.epoch), next).await {
            Ok(stored) => {
                tracing::info!(
                    node_id,
                    fenced_by = self.node_id,
                    epoch = stored.epoch,
                    "fenced expired node liveness"
                );
                self.announce(stored).await;
                Ok(stored)
            }
            Err(StoreError::Conflict(conflict)) => Err(FenceError::LostRace {
                node_id,
                observed_epoch: current.epoch,
                current_epoch: conflict.actual_epoch(),
            }),
            Err(err) => Err(FenceError::Store(err.into())),
        }
    }

    /// Move a node's membership forward (e.g. start or finish decommission).
    pub async fn set_membership(
        &self,
        node_id: NodeId,
        membership: MembershipState,
    ) -> Result<LivenessRecord, MembershipError> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .store
                .get(node_id)
                .await?
                .ok_or(MembershipError::UnknownNode(node_id))?;
            if !current.membership.can_transition_to(membership) {
                return Err(MembershipError::InvalidTransition {
                    node_id,
                    from: current.membership,
                    to: membership,
                });
            }
            if current.membership == membership {
                return Ok(current);
            }

            let next = LivenessRecord {
                membership,
                ..current
            };
            match self.store.conditional_put(Some(current.epoch), next).await {
                Ok(stored) => {
                    tracing::info!(node_id, membership = %membership, "updated node membership");
                    self.announce(stored).await;
                    return Ok(stored);
                }
                Err(StoreError::Conflict(conflict)) => {
                    tracing::debug!(error = %conflict, "membership update raced, re-reading");
                }
                Err(err) => return Err(MembershipError::Store(err.into())),
            }
        }
        Err(MembershipError::Conflict(node_id))
    }

    /// Fold in a record received from a peer.
    pub async fn apply_remote(&self, record: LivenessRecord) -> anyhow::Result<bool> {
        let changed = self.store.merge_remote(record).await?;
        if changed && record.node_id == self.node_id && record.epoch > self.lease_epoch() {
            tracing::warn!(
                node_id = self.node_id,
                lease_epoch = self.lease_epoch(),
                fenced_epoch = record.epoch,
                "local lease was fenced by a peer"
            );
        }
        Ok(changed)
    }

    /// Republish every known record (anti-entropy).
    pub async fn publish_all(&self) -> anyhow::Result<()> {
        let records = self.store.list().await?;
        if records.is_empty() {
            return Ok(());
        }
        self.broadcast.publish_batch(records).await
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(node_id = self.node_id, "liveness renewal recovered");
        }
    }

    fn record_failure(&self, err: &RenewalError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            node_id = self.node_id,
            failures,
            error = %err,
            "liveness renewal failed"
        );
        if failures >= self.cfg.max_renewal_failures && !self.degraded.swap(true, Ordering::SeqCst)
        {
            tracing::error!(
                node_id = self.node_id,
                failures,
                "marking node degraded after consecutive renewal failures"
            );
        }
    }

    /// One iteration of the renewal loop.
    pub async fn run_renewal_tick(&self, tick: u64) {
        match self.renew().await {
            Ok(_) => self.record_success(),
            Err(RenewalError::EpochMismatch {
                expected, actual, ..
            }) => {
                tracing::warn!(
                    node_id = self.node_id,
                    expected,
                    actual,
                    "liveness epoch mismatch; restarting lease"
                );
                match self.restart_lease().await {
                    Ok(_) => self.record_success(),
                    Err(err) => self.record_failure(&err),
                }
            }
            Err(RenewalError::Decommissioned(_)) => {
                tracing::debug!(node_id = self.node_id, "skipping renewal for decommissioned node");
            }
            Err(err) => self.record_failure(&err),
        }

        let resync = u64::from(self.cfg.resync_every_ticks);
        if resync > 0 && tick % resync == 0 {
            match tokio::time::timeout(self.publish_budget(), self.publish_all()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = ?err, "liveness resync publish failed"),
                Err(_) => tracing::debug!("liveness resync publish timed out"),
            }
        }
    }
}

/// Spawn the renewal loop. It runs until `shutdown` flips to true or its
/// sender is dropped.
pub fn spawn_renewal_loop(
    tracker: Arc<LivenessTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tracker.cfg.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    tick += 1;
                    tracker.run_renewal_tick(tick).await;
                }
            }
        }
    })
}

/// Spawn the task that merges records arriving over `broadcast`.
pub fn spawn_gossip_listener(
    tracker: Arc<LivenessTracker>,
    broadcast: Arc<dyn BroadcastChannel>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut incoming = broadcast.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                next = incoming.next() => {
                    let Some(record) = next else {
                        return;
                    };
                    if let Err(err) = tracker.apply_remote(record).await {
                        tracing::warn!(node_id = record.node_id, error = ?err, "failed to merge liveness record");
                    }
                }
            }
        }
    })
}
