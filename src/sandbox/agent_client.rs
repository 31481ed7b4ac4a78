use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{AgentState, FrameworkId, SandboxDirectories};
use reqwest::{
    header::{HeaderValue, AUTHORIZATION},
    StatusCode,
};
use tracing::trace;

use crate::config::AgentClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to reach agent {hostname}: {source}")]
    Transport {
        hostname: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("agent {hostname} responded with {status}")]
    UnexpectedStatus { hostname: String, status: StatusCode },

    #[error("failed to decode state of agent {hostname}: {source}")]
    Decode {
        hostname: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to authenticate to agent {hostname}: {source}")]
    Auth {
        hostname: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Fetches the sandbox directories an agent reports for a framework.
#[async_trait]
pub trait AgentQuery: Send + Sync {
    async fn query_agent(
        &self,
        framework_id: &FrameworkId,
        hostname: &str,
    ) -> Result<SandboxDirectories, QueryError>;
}

/// Produces the `Authorization` header for requests to an agent, if any.
pub trait AuthProvider: Send + Sync {
    fn authorization(&self, hostname: &str) -> Result<Option<HeaderValue>>;
}

/// SPNEGO authentication with a token acquired outside of the process.
pub struct NegotiateToken {
    token: String,
}

impl NegotiateToken {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl AuthProvider for NegotiateToken {
    fn authorization(&self, _hostname: &str) -> Result<Option<HeaderValue>> {
        let mut value = HeaderValue::from_str(&format!("Negotiate {}", self.token))?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

/// HTTP client for the agent `state.json` endpoint.
pub struct AgentClient {
    client: reqwest::Client,
    port: u16,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl AgentClient {
    pub fn new(config: &AgentClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;
        let auth = config
            .negotiate_token
            .clone()
            .map(|token| Arc::new(NegotiateToken::new(token)) as Arc<dyn AuthProvider>);
        Ok(Self {
            client,
            port: config.port,
            auth,
        })
    }

    pub fn state_url(&self, hostname: &str) -> String {
        format!("http://{}:{}/state.json", hostname, self.port)
    }

    pub async fn agent_state(&self, hostname: &str) -> Result<AgentState, QueryError> {
        let mut request = self.client.get(self.state_url(hostname));
        if let Some(auth) = &self.auth {
            let header = auth
                .authorization(hostname)
                .map_err(|source| QueryError::Auth {
                    hostname: hostname.to_string(),
                    source,
                })?;
            if let Some(header) = header {
                request = request.header(AUTHORIZATION, header);
            }
        }

        let transport = |source| QueryError::Transport {
            hostname: hostname.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::UnexpectedStatus {
                hostname: hostname.to_string(),
                status,
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|source| QueryError::Decode {
            hostname: hostname.to_string(),
            source,
        })
    }
}

#[async_trait]
impl AgentQuery for AgentClient {
    async fn query_agent(
        &self,
        framework_id: &FrameworkId,
        hostname: &str,
    ) -> Result<SandboxDirectories, QueryError> {
        let state = self.agent_state(hostname).await?;
        let directories = state.sandbox_directories(framework_id);
        trace!(
            hostname,
            %framework_id,
            sandboxes = directories.len(),
            "queried agent state"
        );
        Ok(directories)
    }
}
