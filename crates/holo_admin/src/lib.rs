//! HoloStore control-plane node.
//!
//! Wires the liveness tracker, gossip, the local partition store and the
//! stats fan-out behind one HTTP listener, and exposes the same node as an
//! embeddable component for tests and other processes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use holo_control::{
    spawn_gossip_listener, spawn_renewal_loop, BroadcastChannel, LivenessStore, LivenessTracker,
    LocalBroadcast, MemoryLivenessStore, NodeId, StatsFanoutCoordinator, SystemClock,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod api;
pub mod catalog;
pub mod config;
pub mod storage;
pub mod transport;

pub use config::{parse_members, NodeArgs};

use api::AppState;
use catalog::Catalog;
use storage::LocalStore;
use transport::{build_http_client, ClusterStatsProvider, HttpGossip};

/// Initialize the node and serve until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Initialize the node and serve until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let node = start_node(args).await?;
    if let Err(err) = shutdown.await {
        tracing::warn!(error = %err, "shutdown signal failed; stopping node");
    }
    node.stop().await
}

/// A started node and its background tasks.
pub struct RunningNode {
    state: AppState,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<anyhow::Result<()>>,
    background: Vec<JoinHandle<()>>,
}

impl RunningNode {
    pub fn node_id(&self) -> NodeId {
        self.state.tracker.node_id()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tracker(&self) -> Arc<LivenessTracker> {
        self.state.tracker.clone()
    }

    pub fn coordinator(&self) -> Arc<StatsFanoutCoordinator> {
        self.state.coordinator.clone()
    }

    pub fn local_store(&self) -> Arc<LocalStore> {
        self.state.local.clone()
    }

    /// Stop serving, stop background loops, and wait for in-flight fan-out
    /// workers to finish.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.background {
            let _ = task.await;
        }
        let served = match self.server.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("http server task join failed: {err}")),
        };
        self.state.coordinator.shutdown().await;
        if let Err(err) = self.state.local.persist() {
            tracing::warn!(error = ?err, "failed to persist local store on shutdown");
        }
        tracing::info!(node_id = self.state.tracker.node_id(), "node stopped");
        served
    }
}

pub async fn start_node(args: NodeArgs) -> anyhow::Result<RunningNode> {
    let liveness_cfg = args.liveness_config()?;
    let members = parse_members(&args.initial_members)?;
    anyhow::ensure!(
        members.contains_key(&args.node_id),
        "initial_members does not include this node ({})",
        args.node_id
    );

    let data_dir = PathBuf::from(&args.data_dir);
    std::fs::create_dir_all(&data_dir).context("create data dir")?;
    let local = Arc::new(LocalStore::open(&data_dir.join("storage"))?);

    let catalog = match &args.catalog {
        Some(path) => Catalog::load(std::path::Path::new(path))?,
        None => Catalog::default(),
    };
    for partition_id in catalog.partitions_hosted_by(args.node_id) {
        local.ensure_hosted(partition_id)?;
    }

    let client = build_http_client(args.connect_timeout())?;
    let inbox = LocalBroadcast::new();
    let gossip: Arc<dyn BroadcastChannel> = Arc::new(HttpGossip::new(
        args.node_id,
        members.clone(),
        client.clone(),
        inbox.clone(),
    ));
    let store: Arc<dyn LivenessStore> = Arc::new(MemoryLivenessStore::new());
    let tracker = Arc::new(LivenessTracker::new(
        args.node_id,
        liveness_cfg,
        store,
        gossip.clone(),
        Arc::new(SystemClock),
    ));

    let provider = Arc::new(ClusterStatsProvider::new(
        args.node_id,
        local.clone(),
        members,
        client,
    ));
    let coordinator =
        Arc::new(StatsFanoutCoordinator::new(provider).with_liveness(tracker.clone()));

    let state = AppState {
        tracker: tracker.clone(),
        coordinator,
        catalog: Arc::new(catalog),
        local,
        inbox,
        stats_timeout: args.stats_timeout(),
    };

    let listener = tokio::net::TcpListener::bind(args.listen_http)
        .await
        .with_context(|| format!("bind http listener {}", args.listen_http))?;
    let local_addr = listener.local_addr().context("read listener address")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = api::router(state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("http server failed")
    });

    // Subscribe before registering so no peer record is missed.
    let listener_task = spawn_gossip_listener(tracker.clone(), gossip, shutdown_rx.clone());
    let record = tracker
        .register()
        .await
        .context("register node liveness")?;
    let renewal_task = spawn_renewal_loop(tracker.clone(), shutdown_rx);

    tracing::info!(
        node_id = args.node_id,
        http = %local_addr,
        epoch = record.epoch,
        "node started"
    );

    Ok(RunningNode {
        state,
        local_addr,
        shutdown_tx,
        server,
        background: vec![listener_task, renewal_task],
    })
}

/// Minimal embeddable configuration for running a node inside another process.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub node_id: NodeId,
    pub listen_http: SocketAddr,
    pub initial_members: String,
    pub data_dir: PathBuf,
    pub catalog: Option<PathBuf>,
    pub lease_duration: Duration,
    /// Zero selects half the lease duration.
    pub renew_interval: Duration,
    pub dead_threshold: Duration,
    pub fence_threshold: Duration,
    pub stats_timeout: Duration,
}

impl EmbeddedNodeConfig {
    pub fn single_node(node_id: NodeId, listen_http: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            node_id,
            listen_http,
            initial_members: format!("{node_id}@{listen_http}"),
            data_dir,
            catalog: None,
            lease_duration: Duration::from_secs(9),
            renew_interval: Duration::ZERO,
            dead_threshold: Duration::from_secs(60),
            fence_threshold: Duration::from_secs(9),
            stats_timeout: Duration::from_secs(10),
        }
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    use clap::Parser;

    let millis = |d: Duration| d.as_millis().to_string();
    let mut argv = vec![
        "holo-admin".to_string(),
        "--node-id".to_string(),
        config.node_id.to_string(),
        "--listen-http".to_string(),
        config.listen_http.to_string(),
        "--initial-members".to_string(),
        config.initial_members.clone(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--lease-duration-ms".to_string(),
        millis(config.lease_duration),
        "--renew-interval-ms".to_string(),
        millis(config.renew_interval),
        "--dead-threshold-ms".to_string(),
        millis(config.dead_threshold),
        "--fence-threshold-ms".to_string(),
        millis(config.fence_threshold),
        "--stats-timeout-ms".to_string(),
        millis(config.stats_timeout),
    ];
    if let Some(catalog) = &config.catalog {
        argv.push("--catalog".to_string());
        argv.push(catalog.display().to_string());
    }

    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

pub struct EmbeddedNodeHandle {
    node: RunningNode,
}

impl EmbeddedNodeHandle {
    pub fn node(&self) -> &RunningNode {
        &self.node
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.node.stop().await
    }
}

pub async fn start_embedded_node(config: EmbeddedNodeConfig) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let node = start_node(args).await?;
    Ok(EmbeddedNodeHandle { node })
}
