pub mod tests {
    use rand::{distr::Alphanumeric, Rng};

    use crate::{
        AgentExecutor,
        AgentFramework,
        AgentState,
        FrameworkId,
        SandboxDirectories,
        TaskId,
        TaskInstance,
        TaskInstanceBuilder,
    };

    pub const TEST_FRAMEWORK_ID: &str = "test-framework";
    pub const TEST_HOSTNAME: &str = "agent-1.test";

    pub fn random_task_id() -> TaskId {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        TaskId::new(format!("task-{}", suffix))
    }

    pub fn mock_sandbox_directory(hostname: &str, task_id: &TaskId) -> String {
        format!("/var/lib/agent/{}/executors/{}/runs/latest", hostname, task_id)
    }

    pub fn mock_agent_framework(framework_id: &str, executors: &[(&str, &str)]) -> AgentFramework {
        AgentFramework {
            id: FrameworkId::from(framework_id),
            executors: executors
                .iter()
                .map(|(id, directory)| AgentExecutor {
                    id: TaskId::from(*id),
                    directory: directory.to_string(),
                })
                .collect(),
            completed_executors: vec![],
        }
    }

    /// Agent state running every task in `directories` under the test
    /// framework.
    pub fn mock_agent_state(directories: &SandboxDirectories) -> AgentState {
        let executors = directories
            .iter()
            .map(|(id, directory)| AgentExecutor {
                id: id.clone(),
                directory: directory.clone(),
            })
            .collect();
        AgentState {
            frameworks: vec![AgentFramework {
                id: FrameworkId::from(TEST_FRAMEWORK_ID),
                executors,
                completed_executors: vec![],
            }],
            completed_frameworks: vec![],
        }
    }

    /// `count` tasks with generated ids and sandbox directories on `hostname`.
    pub fn mock_sandbox_directories(hostname: &str, count: usize) -> SandboxDirectories {
        (0..count)
            .map(|_| {
                let task_id = random_task_id();
                let directory = mock_sandbox_directory(hostname, &task_id);
                (task_id, directory)
            })
            .collect()
    }

    pub fn mock_task_instance(task_id: &TaskId, sandbox_directory: Option<String>) -> TaskInstance {
        TaskInstanceBuilder::default()
            .task_id(task_id.clone())
            .hostname(TEST_HOSTNAME.to_string())
            .sandbox_directory(sandbox_directory)
            .build()
            .unwrap()
    }
}
