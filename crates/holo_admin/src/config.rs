//! Node command-line and environment configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use holo_control::{LivenessConfig, NodeId};

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long)]
    pub node_id: NodeId,

    /// Address for the admin HTTP API and node-to-node traffic.
    #[arg(long)]
    pub listen_http: SocketAddr,

    /// Comma-separated list like: `1@127.0.0.1:8081,2@127.0.0.1:8082,3@127.0.0.1:8083`
    #[arg(long)]
    pub initial_members: String,

    #[arg(long)]
    pub data_dir: String,

    /// JSON file describing databases, tables and partition placement.
    #[arg(long, env = "HOLO_CATALOG")]
    pub catalog: Option<String>,

    /// Lease length granted by each renewal.
    #[arg(long, env = "HOLO_LEASE_DURATION_MS", default_value_t = 9_000)]
    pub lease_duration_ms: u64,

    /// Renewal cadence (0 = half the lease duration).
    #[arg(long, env = "HOLO_RENEW_INTERVAL_MS", default_value_t = 0)]
    pub renew_interval_ms: u64,

    /// Time past expiration after which a node is reported DEAD.
    #[arg(long, env = "HOLO_DEAD_THRESHOLD_MS", default_value_t = 60_000)]
    pub dead_threshold_ms: u64,

    /// Time past expiration after which a node's epoch may be fenced.
    #[arg(long, env = "HOLO_FENCE_THRESHOLD_MS", default_value_t = 9_000)]
    pub fence_threshold_ms: u64,

    /// Consecutive failed renewals before the node reports itself degraded.
    #[arg(long, env = "HOLO_MAX_RENEWAL_FAILURES", default_value_t = 3)]
    pub max_renewal_failures: u32,

    /// Republish every known liveness record each N renewal ticks (0 disables).
    #[arg(long, env = "HOLO_GOSSIP_RESYNC_TICKS", default_value_t = 4)]
    pub gossip_resync_ticks: u32,

    /// Default deadline for stats requests that do not pass `timeout_ms`.
    #[arg(long, env = "HOLO_STATS_TIMEOUT_MS", default_value_t = 10_000)]
    pub stats_timeout_ms: u64,

    #[arg(long, env = "HOLO_RPC_CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub rpc_connect_timeout_ms: u64,
}

impl NodeArgs {
    pub fn liveness_config(&self) -> anyhow::Result<LivenessConfig> {
        let lease_duration = Duration::from_millis(self.lease_duration_ms.max(1));
        let renew_interval = if self.renew_interval_ms == 0 {
            (lease_duration / 2).max(Duration::from_millis(1))
        } else {
            Duration::from_millis(self.renew_interval_ms)
        };
        let cfg = LivenessConfig {
            lease_duration,
            renew_interval,
            dead_threshold: Duration::from_millis(self.dead_threshold_ms.max(1)),
            fence_threshold: Duration::from_millis(self.fence_threshold_ms.max(1)),
            max_renewal_failures: self.max_renewal_failures.max(1),
            resync_every_ticks: self.gossip_resync_ticks,
        };
        cfg.validate().context("invalid liveness configuration")?;
        Ok(cfg)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_connect_timeout_ms.max(1))
    }
}

pub fn parse_members(input: &str) -> anyhow::Result<HashMap<NodeId, SocketAddr>> {
    let mut out = HashMap::new();
    for part in input.split(',').filter(|s| !s.trim().is_empty()) {
        let (id, addr) = part
            .trim()
            .split_once('@')
            .with_context(|| format!("invalid member entry (expected id@host:port): {part}"))?;
        let id: NodeId = id.parse().context("invalid member id")?;
        let addr: SocketAddr = addr.parse().context("invalid member addr")?;
        out.insert(id, addr);
    }
    anyhow::ensure!(!out.is_empty(), "initial_members is empty");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> NodeArgs {
        let mut argv = vec![
            "holo-admin",
            "--node-id",
            "1",
            "--listen-http",
            "127.0.0.1:8081",
            "--initial-members",
            "1@127.0.0.1:8081",
            "--data-dir",
            "/tmp/holo",
        ];
        argv.extend_from_slice(extra);
        NodeArgs::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn parse_members_accepts_list() {
        let members = parse_members("1@127.0.0.1:1, 2@127.0.0.1:2,").expect("parse");
        assert_eq!(members.len(), 2);
        assert_eq!(members[&2], "127.0.0.1:2".parse().unwrap());
    }

    #[test]
    fn parse_members_rejects_bad_entries() {
        assert!(parse_members("").is_err());
        assert!(parse_members("1-127.0.0.1:1").is_err());
        assert!(parse_members("x@127.0.0.1:1").is_err());
        assert!(parse_members("1@nowhere").is_err());
    }

    #[test]
    fn renew_interval_defaults_to_half_lease() {
        let cfg = args(&[]).liveness_config().expect("config");
        assert_eq!(cfg.lease_duration, Duration::from_secs(9));
        assert_eq!(cfg.renew_interval, Duration::from_millis(4_500));
        assert_eq!(cfg.max_renewal_failures, 3);
    }

    #[test]
    fn renew_interval_must_stay_below_lease() {
        let err = args(&["--lease-duration-ms", "1000", "--renew-interval-ms", "1000"])
            .liveness_config()
            .expect_err("renewal as slow as the lease");
        assert!(format!("{err:#}").contains("renew interval"));
    }
}
