use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{FrameworkId, TaskId, TaskInstance};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// The agent behind a host sync could not be queried.
    pub fn bad_gateway(message: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncerStatus {
    pub framework_id: Option<FrameworkId>,
    pub pending_sandboxes: usize,
    pub pending_hosts: usize,
    pub cached_queries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSyncResponse {
    pub hostname: String,
    pub sandboxes: usize,
}

/// A task instance as seen from outside, with a link to its sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSandbox {
    pub task_id: TaskId,
    pub hostname: String,
    pub sandbox_directory: Option<String>,
    pub output_url: Option<String>,
}

impl TaskSandbox {
    pub fn from_instance(instance: TaskInstance, agent_port: u16) -> Self {
        let output_url = instance.output_url(agent_port);
        Self {
            task_id: instance.task_id,
            hostname: instance.hostname,
            sandbox_directory: instance.sandbox_directory,
            output_url,
        }
    }
}
