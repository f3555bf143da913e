//! Administrative HTTP surface plus the internal node-to-node endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use holo_control::{
    cluster_stats, ClusterStatsReport, DeadlineExceeded, FenceError, LivenessRecord,
    LivenessTracker, LocalBroadcast, MembershipError, MembershipState, NodeId,
    NodeLivenessStatus, PartitionStatsResult, RenewalError, ResolutionError,
    StatsFanoutCoordinator, StatsTarget,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::catalog::Catalog;
use crate::storage::LocalStore;
use crate::transport::{StatsQuery, GOSSIP_PATH, STATS_PATH};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<LivenessTracker>,
    pub coordinator: Arc<StatsFanoutCoordinator>,
    pub catalog: Arc<Catalog>,
    pub local: Arc<LocalStore>,
    /// Inbound side of liveness gossip.
    pub inbox: LocalBroadcast,
    pub stats_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/cluster/liveness", get(liveness))
        .route("/cluster/liveness/{node_id}/fence", post(fence))
        .route("/cluster/liveness/{node_id}/membership", post(set_membership))
        .route("/cluster/drain", post(drain))
        .route("/databases/{db}", get(database_details))
        .route("/databases/{db}/tables/{table}/stats", get(table_stats))
        .route(GOSSIP_PATH, post(receive_gossip))
        .route(STATS_PATH, post(local_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Fence(#[from] FenceError),
    #[error(transparent)]
    Renewal(#[from] RenewalError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Resolution(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Resolution(_) => StatusCode::CONFLICT,
            ApiError::Fence(FenceError::UnknownNode(_)) => StatusCode::NOT_FOUND,
            ApiError::Fence(FenceError::SelfFence(_)) => StatusCode::BAD_REQUEST,
            ApiError::Fence(FenceError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Fence(_) => StatusCode::CONFLICT,
            ApiError::Renewal(RenewalError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Renewal(_) => StatusCode::CONFLICT,
            ApiError::Membership(MembershipError::UnknownNode(_)) => StatusCode::NOT_FOUND,
            ApiError::Membership(MembershipError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Membership(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(err) if err.downcast_ref::<DeadlineExceeded>().is_some() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(error = %self, "admin request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub livenesses: Vec<LivenessRecord>,
    pub statuses: BTreeMap<NodeId, NodeLivenessStatus>,
    /// Whether the answering node has failed enough renewals to be degraded.
    pub self_degraded: bool,
}

async fn liveness(State(state): State<AppState>) -> ApiResult<LivenessResponse> {
    let snapshot = state.tracker.livenesses().await?;
    let statuses = snapshot
        .iter()
        .map(|(record, status)| (record.node_id, *status))
        .collect();
    Ok(Json(LivenessResponse {
        livenesses: snapshot.into_iter().map(|(record, _)| record).collect(),
        statuses,
        self_degraded: state.tracker.is_degraded(),
    }))
}

async fn fence(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<LivenessRecord> {
    Ok(Json(state.tracker.increment_epoch(node_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub membership: String,
}

async fn set_membership(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
    Json(request): Json<MembershipRequest>,
) -> ApiResult<LivenessRecord> {
    let membership: MembershipState = request
        .membership
        .parse()
        .map_err(|err: anyhow::Error| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(state.tracker.set_membership(node_id, membership).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DrainRequest {
    pub draining: bool,
}

async fn drain(
    State(state): State<AppState>,
    Json(request): Json<DrainRequest>,
) -> ApiResult<LivenessRecord> {
    Ok(Json(state.tracker.set_draining(request.draining).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    /// Overrides the node's default stats deadline.
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub include_stats: bool,
}

impl StatsParams {
    fn deadline(&self, default_timeout: Duration) -> Instant {
        let timeout = self
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        Instant::now() + timeout
    }
}

async fn collect_stats(
    state: &AppState,
    target: StatsTarget,
    params: &StatsParams,
) -> Result<ClusterStatsReport, ApiError> {
    let deadline = params.deadline(state.stats_timeout);
    Ok(cluster_stats(
        state.catalog.as_ref(),
        state.coordinator.as_ref(),
        &target,
        deadline,
    )
    .await?)
}

async fn table_stats(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
    Query(params): Query<StatsParams>,
) -> ApiResult<ClusterStatsReport> {
    let report = collect_stats(&state, StatsTarget::Table { database, table }, &params).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseDetails {
    pub database: String,
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ClusterStatsReport>,
}

async fn database_details(
    State(state): State<AppState>,
    Path(database): Path<String>,
    Query(params): Query<StatsParams>,
) -> ApiResult<DatabaseDetails> {
    let (database, tables) = state.catalog.table_names(&database)?;
    let stats = if params.include_stats {
        let target = StatsTarget::Database {
            database: database.clone(),
        };
        Some(collect_stats(&state, target, &params).await?)
    } else {
        None
    };
    Ok(Json(DatabaseDetails {
        database,
        tables,
        stats,
    }))
}

async fn receive_gossip(
    State(state): State<AppState>,
    Json(records): Json<Vec<LivenessRecord>>,
) -> StatusCode {
    state.inbox.deliver(records);
    StatusCode::NO_CONTENT
}

async fn local_stats(
    State(state): State<AppState>,
    Json(query): Json<StatsQuery>,
) -> ApiResult<PartitionStatsResult> {
    let budget = Duration::from_millis(query.timeout_ms.max(1)).min(state.stats_timeout);
    let deadline = Instant::now() + budget;
    let result = state
        .local
        .partition_stats(state.tracker.node_id(), query.partitions, deadline)
        .await?;
    Ok(Json(result))
}
