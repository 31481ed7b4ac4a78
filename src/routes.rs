use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::StatusCode,
    routing::{get, post},
    Json,
    Router,
};
use data_model::{FrameworkId, SandboxReport, TaskId};
use state_store::RocksDBSandboxStore;
use tower_http::trace::TraceLayer;

use crate::{
    http_objects::{ApiError, HostSyncResponse, SyncerStatus, TaskSandbox},
    sandbox::{agent_cache::QueryState, SandboxSyncer},
};

#[derive(Clone)]
pub struct RouteState {
    pub syncer: Arc<SandboxSyncer>,
    pub store: Arc<RocksDBSandboxStore>,
    pub agent_port: u16,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/v1/sandboxes",
            post(report_sandbox).with_state(route_state.clone()),
        )
        .route(
            "/v1/hosts/{hostname}/sync",
            post(request_host_sync).with_state(route_state.clone()),
        )
        .route(
            "/v1/frameworks/{framework_id}/hosts/{hostname}/sync",
            post(sync_agent_sandboxes).with_state(route_state.clone()),
        )
        .route(
            "/v1/tasks/{task_id}",
            get(task_sandbox).with_state(route_state.clone()),
        )
        .route("/v1/status", get(status).with_state(route_state.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
}

async fn index() -> &'static str {
    "Sandbox Syncer"
}

/// A task reporting its own sandbox directory.
async fn report_sandbox(
    State(state): State<RouteState>,
    Json(report): Json<SandboxReport>,
) -> StatusCode {
    state.syncer.update_sandbox(report);
    StatusCode::ACCEPTED
}

/// Marks the host for the next host sync pass.
async fn request_host_sync(
    Path(hostname): Path<String>,
    State(state): State<RouteState>,
) -> StatusCode {
    state.syncer.request_host_sync(&hostname);
    StatusCode::ACCEPTED
}

/// Queries the host now, or joins a live query to it, and waits for the
/// outcome.
async fn sync_agent_sandboxes(
    Path((framework_id, hostname)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<HostSyncResponse>, ApiError> {
    let handle = state
        .syncer
        .sync_agent_sandboxes(FrameworkId::new(framework_id), &hostname);
    match handle.wait().await {
        QueryState::Success(directories) => Ok(Json(HostSyncResponse {
            hostname,
            sandboxes: directories.len(),
        })),
        QueryState::Error(message) => Err(ApiError::bad_gateway(&message)),
        QueryState::Pending => Err(ApiError::internal_error_str("agent query did not complete")),
    }
}

async fn task_sandbox(
    Path(task_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<TaskSandbox>, ApiError> {
    let instance = state
        .store
        .get_task_instance(&TaskId::new(task_id))
        .map_err(|e| ApiError::internal_error(e.into()))?
        .ok_or_else(|| ApiError::not_found("task instance not found"))?;
    Ok(Json(TaskSandbox::from_instance(instance, state.agent_port)))
}

async fn status(State(state): State<RouteState>) -> Json<SyncerStatus> {
    let syncer = &state.syncer;
    Json(SyncerStatus {
        framework_id: syncer.pending_sync().framework_id(),
        pending_sandboxes: syncer.aggregator().pending_count(),
        pending_hosts: syncer.pending_sync().len(),
        cached_queries: syncer.agent_cache().len(),
    })
}
