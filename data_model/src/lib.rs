pub mod test_objects;

use std::fmt::{self, Display};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use url::Url;

/// Task id -> sandbox directory on the agent that ran the task.
pub type SandboxDirectories = im::HashMap<TaskId, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier the cluster manager assigned to the scheduler when it
/// registered. Agents group executors by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct FrameworkId(String);

impl FrameworkId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FrameworkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where a sandbox report came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportType {
    /// The task's status update carried its sandbox directory.
    StatusUpdate,
    /// The executor sent the directory in a framework message.
    FrameworkMessage,
}

/// A task reporting its own sandbox directory, bypassing agent polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxReport {
    pub task_id: TaskId,
    pub sandbox_directory: String,
    pub report_type: ReportType,
}

impl SandboxReport {
    pub fn new(task_id: TaskId, sandbox_directory: String, report_type: ReportType) -> Self {
        Self {
            task_id,
            sandbox_directory,
            report_type,
        }
    }
}

/// Durable record of a task instance as the scheduler stores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
pub struct TaskInstance {
    pub task_id: TaskId,
    pub hostname: String,
    #[builder(default)]
    #[serde(default)]
    pub sandbox_directory: Option<String>,
}

impl TaskInstance {
    pub fn key(&self) -> &str {
        self.task_id.get()
    }

    pub fn has_sandbox(&self) -> bool {
        self.sandbox_directory.is_some()
    }

    /// Link to the sandbox through the agent's file API, once the sandbox
    /// directory is known.
    pub fn output_url(&self, agent_port: u16) -> Option<String> {
        let sandbox_directory = self.sandbox_directory.as_ref()?;
        let mut url = Url::parse(&format!(
            "http://{}:{}/files/read.json",
            self.hostname, agent_port
        ))
        .ok()?;
        url.query_pairs_mut().append_pair("path", sandbox_directory);
        Some(url.to_string())
    }
}

/// Executor entry of an agent's `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentExecutor {
    pub id: TaskId,
    pub directory: String,
}

/// Framework entry of an agent's `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentFramework {
    pub id: FrameworkId,
    #[serde(default)]
    pub executors: Vec<AgentExecutor>,
    #[serde(default)]
    pub completed_executors: Vec<AgentExecutor>,
}

impl AgentFramework {
    pub fn sandbox_directories(&self) -> SandboxDirectories {
        self.executors
            .iter()
            .chain(self.completed_executors.iter())
            .map(|executor| (executor.id.clone(), executor.directory.clone()))
            .collect()
    }
}

/// The subset of an agent's `state.json` the syncer reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AgentState {
    #[serde(default)]
    pub frameworks: Vec<AgentFramework>,
    #[serde(default)]
    pub completed_frameworks: Vec<AgentFramework>,
}

impl AgentState {
    /// Active frameworks are searched before completed ones and the first
    /// match wins.
    pub fn framework(&self, framework_id: &FrameworkId) -> Option<&AgentFramework> {
        self.frameworks
            .iter()
            .chain(self.completed_frameworks.iter())
            .find(|framework| &framework.id == framework_id)
    }

    /// Sandbox directories of every executor the framework ran on this agent.
    /// An agent that never ran the framework yields an empty map.
    pub fn sandbox_directories(&self, framework_id: &FrameworkId) -> SandboxDirectories {
        self.framework(framework_id)
            .map(AgentFramework::sandbox_directories)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{mock_agent_framework, TEST_FRAMEWORK_ID};

    #[test]
    fn test_active_framework_wins_over_completed() {
        let framework_id = FrameworkId::from(TEST_FRAMEWORK_ID);
        let state = AgentState {
            frameworks: vec![mock_agent_framework(TEST_FRAMEWORK_ID, &[("t1", "/active")])],
            completed_frameworks: vec![mock_agent_framework(
                TEST_FRAMEWORK_ID,
                &[("t1", "/completed"), ("t2", "/completed")],
            )],
        };

        let directories = state.sandbox_directories(&framework_id);
        assert_eq!(directories.len(), 1);
        assert_eq!(directories.get(&TaskId::from("t1")).unwrap(), "/active");
    }

    #[test]
    fn test_completed_framework_is_searched() {
        let framework_id = FrameworkId::from(TEST_FRAMEWORK_ID);
        let state = AgentState {
            frameworks: vec![mock_agent_framework("other", &[("x", "/x")])],
            completed_frameworks: vec![mock_agent_framework(
                TEST_FRAMEWORK_ID,
                &[("t2", "/sandbox/t2")],
            )],
        };

        let directories = state.sandbox_directories(&framework_id);
        assert_eq!(directories.len(), 1);
        assert_eq!(directories.get(&TaskId::from("t2")).unwrap(), "/sandbox/t2");
    }

    #[test]
    fn test_missing_framework_is_empty() {
        let state = AgentState {
            frameworks: vec![mock_agent_framework("other", &[("x", "/x")])],
            completed_frameworks: vec![],
        };
        assert!(state
            .sandbox_directories(&FrameworkId::from(TEST_FRAMEWORK_ID))
            .is_empty());
    }

    #[test]
    fn test_executors_and_completed_executors_are_merged() {
        let json = serde_json::json!({
            "frameworks": [{
                "id": TEST_FRAMEWORK_ID,
                "executors": [{"id": "t1", "directory": "/d/t1"}],
                "completed_executors": [{"id": "t2", "directory": "/d/t2"}]
            }]
        });
        let state: AgentState = serde_json::from_value(json).unwrap();

        let directories = state.sandbox_directories(&FrameworkId::from(TEST_FRAMEWORK_ID));
        assert_eq!(directories.len(), 2);
        assert_eq!(directories.get(&TaskId::from("t2")).unwrap(), "/d/t2");
        assert!(state.completed_frameworks.is_empty());
    }

    #[test]
    fn test_task_instance_builder_defaults_to_no_sandbox() {
        let instance = TaskInstanceBuilder::default()
            .task_id(TaskId::from("t1"))
            .hostname("agent-1".to_string())
            .build()
            .unwrap();
        assert!(!instance.has_sandbox());
        assert_eq!(instance.key(), "t1");
    }

    #[test]
    fn test_output_url_points_at_agent_file_api() {
        let mut instance = TaskInstanceBuilder::default()
            .task_id(TaskId::from("t1"))
            .hostname("agent-1.test".to_string())
            .build()
            .unwrap();
        assert_eq!(instance.output_url(5051), None);

        instance.sandbox_directory = Some("/var/sandbox/t 1".to_string());
        assert_eq!(
            instance.output_url(5051).as_deref(),
            Some("http://agent-1.test:5051/files/read.json?path=%2Fvar%2Fsandbox%2Ft+1")
        );
    }
}
