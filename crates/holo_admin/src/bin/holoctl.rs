//! Minimal admin client for the control-plane HTTP API.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_admin::api::{DatabaseDetails, LivenessResponse};
use holo_control::{ClusterStatsReport, LivenessRecord};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "holoctl")]
#[command(about = "Control-plane admin client for HoloStore", long_about = None)]
struct Args {
    /// Target HTTP address for a node (host:port).
    #[arg(long, default_value = "127.0.0.1:8081")]
    target: String,
    /// Client-side request timeout in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
    /// Print raw JSON instead of tables.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show every known liveness record and its status.
    Liveness,
    /// Aggregate stats for one table across all replicas.
    TableStats {
        #[arg(long)]
        database: String,
        #[arg(long)]
        table: String,
        /// Server-side fan-out deadline.
        #[arg(long)]
        stats_timeout_ms: Option<u64>,
    },
    /// Show a database's tables, optionally with aggregated stats.
    Database {
        #[arg(long)]
        database: String,
        #[arg(long, default_value_t = false)]
        include_stats: bool,
    },
    /// Raise the epoch of a node whose lease has been expired long enough.
    Fence {
        #[arg(long)]
        node_id: u64,
    },
    /// Set or clear the draining flag on the target node.
    Drain {
        #[arg(long, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        draining: bool,
    },
    /// Move a node to DECOMMISSIONING, or DECOMMISSIONED with --finalize.
    Decommission {
        #[arg(long)]
        node_id: u64,
        #[arg(long, default_value_t = false)]
        finalize: bool,
    },
}

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
        let status = response.status();
        let body = response.text().await.context("read response body")?;
        if !status.is_success() {
            anyhow::bail!("request failed with {status}: {body}");
        }
        serde_json::from_str(&body).with_context(|| format!("parse response json: {body}"))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        Self::decode(response).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client {
        base: format!("http://{}", args.target),
        http: reqwest::Client::builder()
            .timeout(Duration::from_millis(args.timeout_ms.max(1)))
            .build()
            .context("build http client")?,
    };

    match args.command {
        Command::Liveness => {
            let resp: LivenessResponse = client.get("/cluster/liveness").await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
                return Ok(());
            }
            let rows = resp
                .livenesses
                .iter()
                .map(|rec| {
                    let status = resp
                        .statuses
                        .get(&rec.node_id)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "n/a".to_string());
                    vec![
                        rec.node_id.to_string(),
                        status,
                        rec.epoch.to_string(),
                        rec.expiration_ms.to_string(),
                        rec.draining.to_string(),
                        rec.membership.to_string(),
                    ]
                })
                .collect::<Vec<_>>();
            print_ascii_table(
                &["node", "status", "epoch", "expiration_ms", "draining", "membership"],
                &rows,
            );
            if resp.self_degraded {
                println!("warning: target node reports degraded liveness renewal");
            }
        }
        Command::TableStats {
            database,
            table,
            stats_timeout_ms,
        } => {
            let mut path = format!("/databases/{database}/tables/{table}/stats");
            if let Some(ms) = stats_timeout_ms {
                path.push_str(&format!("?timeout_ms={ms}"));
            }
            let report: ClusterStatsReport = client.get(&path).await?;
            print_report(&report, args.json)?;
        }
        Command::Database {
            database,
            include_stats,
        } => {
            let details: DatabaseDetails = client
                .get(&format!("/databases/{database}?include_stats={include_stats}"))
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&details)?);
                return Ok(());
            }
            println!("database: {}", details.database);
            println!("tables: {}", details.tables.join(", "));
            if let Some(report) = &details.stats {
                print_report(report, false)?;
            }
        }
        Command::Fence { node_id } => {
            let record: LivenessRecord = client
                .post(
                    &format!("/cluster/liveness/{node_id}/fence"),
                    serde_json::json!({}),
                )
                .await?;
            println!("node {node_id} fenced; epoch is now {}", record.epoch);
        }
        Command::Drain { draining } => {
            let record: LivenessRecord = client
                .post("/cluster/drain", serde_json::json!({ "draining": draining }))
                .await?;
            println!("node {} draining={}", record.node_id, record.draining);
        }
        Command::Decommission { node_id, finalize } => {
            let membership = if finalize {
                "DECOMMISSIONED"
            } else {
                "DECOMMISSIONING"
            };
            let record: LivenessRecord = client
                .post(
                    &format!("/cluster/liveness/{node_id}/membership"),
                    serde_json::json!({ "membership": membership }),
                )
                .await?;
            println!("node {node_id} membership={}", record.membership);
        }
    }
    Ok(())
}

fn join_ids(ids: &[u64]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn print_report(report: &ClusterStatsReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let rows = vec![
        vec!["partitions".to_string(), report.partition_count.to_string()],
        vec!["replicas".to_string(), report.replica_count.to_string()],
        vec!["nodes asked".to_string(), report.node_count.to_string()],
        vec!["responding".to_string(), join_ids(&report.responding_node_ids)],
        vec!["missing".to_string(), join_ids(&report.missing_node_ids)],
        vec!["keys".to_string(), report.aggregated_key_count.to_string()],
        vec![
            "stored bytes".to_string(),
            report.aggregated_stored_bytes.to_string(),
        ],
    ];
    print_ascii_table(&["stat", "value"], &rows);
    for (node_id, err) in &report.node_errors {
        println!("node {node_id} error: {err}");
    }
    Ok(())
}

fn print_ascii_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx >= widths.len() {
                widths.push(cell.len());
            } else {
                widths[idx] = widths[idx].max(cell.len());
            }
        }
    }

    let separator = {
        let mut s = String::from("+");
        for w in &widths {
            s.push_str(&"-".repeat(*w + 2));
            s.push('+');
        }
        s
    };

    println!("{separator}");
    print!("|");
    for (idx, header) in headers.iter().enumerate() {
        print!(" {:width$} |", header, width = widths[idx]);
    }
    println!();
    println!("{separator}");
    for row in rows {
        print!("|");
        for (idx, cell) in row.iter().enumerate() {
            print!(" {:width$} |", cell, width = widths[idx]);
        }
        println!();
    }
    println!("{separator}");
}
