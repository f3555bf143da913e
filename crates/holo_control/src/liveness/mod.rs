//! Node liveness module wiring.
//!
//! `record` defines the lease record and its supersede/merge rules, `status`
//! is the pure classifier, `store` holds the conditional-update interface,
//! `gossip` the dissemination contract, and `tracker` the local node's lease
//! ownership plus its background loops.

mod gossip;
mod record;
mod status;
mod store;
mod tracker;

pub use gossip::{BroadcastChannel, LocalBroadcast};
pub use record::{LivenessRecord, MembershipState};
pub use status::{classify, LivenessThresholds, NodeLivenessStatus};
pub use store::{CasConflict, LivenessStore, MemoryLivenessStore, StoreError};
pub use tracker::{
    spawn_gossip_listener, spawn_renewal_loop, FenceError, LivenessConfig, LivenessTracker,
    MembershipError, RenewalError,
};
