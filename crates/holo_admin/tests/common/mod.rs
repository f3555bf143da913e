//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use holo_admin::{start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle};
use serde::de::DeserializeOwned;

/// Upper bound for cluster convergence in tests.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

/// One table with a single partition replicated on nodes 1-3, plus a second
/// table in the same database on its own partition.
pub const THREE_REPLICA_CATALOG: &str = r#"{
    "databases": [
        {
            "name": "shop",
            "tables": [
                {"name": "orders", "partitions": [{"partition_id": 1, "replicas": [1, 2, 3]}]},
                {"name": "audit", "partitions": [{"partition_id": 2, "replicas": [1, 2]}]}
            ]
        }
    ]
}"#;

/// Reserve an ephemeral localhost port.
pub fn pick_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

pub struct TestCluster {
    nodes: Vec<Option<EmbeddedNodeHandle>>,
    pub addrs: Vec<SocketAddr>,
    pub http: reqwest::Client,
    _dir: tempfile::TempDir,
}

pub struct ClusterOptions {
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub dead_threshold: Duration,
    pub fence_threshold: Duration,
    pub catalog: Option<&'static str>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(2_000),
            renew_interval: Duration::from_millis(400),
            dead_threshold: Duration::from_secs(60),
            fence_threshold: Duration::from_millis(2_000),
            catalog: Some(THREE_REPLICA_CATALOG),
        }
    }
}

impl TestCluster {
    pub async fn start(size: usize, options: ClusterOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog_path = options.catalog.map(|json| {
            let path = dir.path().join("catalog.json");
            std::fs::write(&path, json).expect("write catalog");
            path
        });

        let addrs: Vec<SocketAddr> = (0..size)
            .map(|_| {
                format!("127.0.0.1:{}", pick_free_port())
                    .parse()
                    .expect("socket addr")
            })
            .collect();
        let members = addrs
            .iter()
            .enumerate()
            .map(|(idx, addr)| format!("{}@{addr}", idx + 1))
            .collect::<Vec<_>>()
            .join(",");

        let mut nodes = Vec::with_capacity(size);
        for (idx, addr) in addrs.iter().enumerate() {
            let node_id = (idx + 1) as u64;
            let mut config = EmbeddedNodeConfig::single_node(
                node_id,
                *addr,
                dir.path().join(format!("node-{node_id}")),
            );
            config.initial_members = members.clone();
            config.catalog = catalog_path.clone();
            config.lease_duration = options.lease_duration;
            config.renew_interval = options.renew_interval;
            config.dead_threshold = options.dead_threshold;
            config.fence_threshold = options.fence_threshold;
            let handle = start_embedded_node(config)
                .await
                .unwrap_or_else(|err| panic!("start node {node_id}: {err:#}"));
            nodes.push(Some(handle));
        }

        Self {
            nodes,
            addrs,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("http client"),
            _dir: dir,
        }
    }

    pub fn node(&self, node_id: u64) -> &EmbeddedNodeHandle {
        self.nodes[(node_id - 1) as usize]
            .as_ref()
            .expect("node is running")
    }

    pub fn url(&self, node_id: u64, path: &str) -> String {
        format!("http://{}{path}", self.addrs[(node_id - 1) as usize])
    }

    /// Write the same keys into every running replica of `partition_id`.
    pub fn write_replicated(&self, partition_id: u64, rows: usize) {
        for handle in self.nodes.iter().flatten() {
            let store = handle.node().local_store();
            if !store.hosted().expect("hosted").contains(&partition_id) {
                continue;
            }
            for i in 0..rows {
                store
                    .put(partition_id, format!("row/{i:04}").as_bytes(), b"payload")
                    .expect("put row");
            }
        }
    }

    pub async fn stop(&mut self, node_id: u64) {
        let handle = self.nodes[(node_id - 1) as usize]
            .take()
            .expect("node already stopped");
        handle.shutdown().await.expect("shutdown node");
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        node_id: u64,
        path: &str,
    ) -> anyhow::Result<(reqwest::StatusCode, T)> {
        let response = self.http.get(self.url(node_id, path)).send().await?;
        let status = response.status();
        let body = response.json::<T>().await?;
        Ok((status, body))
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        node_id: u64,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(reqwest::StatusCode, T)> {
        let response = self
            .http
            .post(self.url(node_id, path))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<T>().await?;
        Ok((status, body))
    }

    pub async fn shutdown(mut self) {
        for slot in self.nodes.iter_mut() {
            if let Some(handle) = slot.take() {
                handle.shutdown().await.expect("shutdown node");
            }
        }
    }
}

/// Poll `check` until it succeeds or `timeout` elapses; panics with the last
/// error on timeout.
pub async fn succeeds_soon<F, Fut, T>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(value) => return value,
            Err(err) => {
                if Instant::now() >= deadline {
                    panic!("timed out waiting for {what}: {err:#}");
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
