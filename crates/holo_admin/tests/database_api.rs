//! Database details endpoint, with and without aggregated stats.
//!
//! Test flow:
//! 1) Start three nodes sharing a catalog with two tables in `shop`.
//! 2) Write rows into both tables' replicas.
//! 3) Read `/databases/shop` plainly, then with `include_stats=true`.
//! 4) Look up names that are unknown or only match ignoring case.
//!
//! Verification:
//! - Stats are only computed when requested and cover every table.
//! - Unknown names map to 404, case-only clashes to 409.

mod common;

use common::{succeeds_soon, ClusterOptions, TestCluster, CONVERGE_TIMEOUT};
use holo_admin::api::DatabaseDetails;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn database_details_include_stats_on_request() {
    let cluster = TestCluster::start(3, ClusterOptions::default()).await;
    cluster.write_replicated(1, 10);
    cluster.write_replicated(2, 4);

    let (status, details): (_, DatabaseDetails) = cluster
        .get_json(2, "/databases/shop")
        .await
        .expect("database details");
    assert!(status.is_success());
    assert_eq!(details.database, "shop");
    assert_eq!(details.tables, vec!["orders".to_string(), "audit".to_string()]);
    assert!(details.stats.is_none());

    let report = succeeds_soon("complete database stats", CONVERGE_TIMEOUT, || async {
        let (status, details): (_, DatabaseDetails) = cluster
            .get_json(2, "/databases/shop?include_stats=true")
            .await?;
        anyhow::ensure!(status.is_success(), "status {status}");
        let report = details
            .stats
            .ok_or_else(|| anyhow::anyhow!("stats missing from response"))?;
        anyhow::ensure!(report.is_complete(), "missing {:?}", report.missing_node_ids);
        Ok(report)
    })
    .await;
    assert_eq!(report.partition_count, 2);
    // Partition 1 on three nodes plus partition 2 on two.
    assert_eq!(report.replica_count, 5);
    assert_eq!(report.node_count, 3);
    assert_eq!(report.aggregated_key_count, 3 * 10 + 2 * 4);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn database_lookup_errors_map_to_http_statuses() {
    const CASE_CLASH: &str = r#"{
        "databases": [
            {"name": "Sales", "tables": []},
            {"name": "sales", "tables": []}
        ]
    }"#;
    let cluster = TestCluster::start(
        1,
        ClusterOptions {
            catalog: Some(CASE_CLASH),
            ..ClusterOptions::default()
        },
    )
    .await;

    let (status, details): (_, DatabaseDetails) = cluster
        .get_json(1, "/databases/sales")
        .await
        .expect("exact match");
    assert!(status.is_success());
    assert_eq!(details.database, "sales");
    assert!(details.tables.is_empty());

    let (status, body): (_, serde_json::Value) = cluster
        .get_json(1, "/databases/SALES")
        .await
        .expect("ambiguous lookup");
    assert_eq!(status, reqwest::StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap_or_default().contains("ambiguous"));

    let (status, _): (_, serde_json::Value) = cluster
        .get_json(1, "/databases/inventory?include_stats=true")
        .await
        .expect("unknown database");
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

    cluster.shutdown().await;
}
