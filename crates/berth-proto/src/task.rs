//! Task descriptions and status updates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::offer::Resource;
use crate::{AgentId, ResourceId, TaskId};

// ── TaskInfo ──────────────────────────────────────────────────────

/// Canonical description of a launched or launchable task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    /// Stable task name (`{pod}-{index}-{task}`); survives relaunches.
    pub name: String,
    /// Current task-id; empty for reservation-only records.
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub command: CommandInfo,
    /// When present, the task launches under a dedicated executor.
    pub executor: Option<ExecutorInfo>,
    /// Resources held by this task, with their reservation labels.
    pub resources: Vec<Resource>,
    pub labels: HashMap<String, String>,
}

impl TaskInfo {
    /// Whether this record only holds reservations (no running task).
    pub fn is_reservation_only(&self) -> bool {
        self.task_id.is_empty()
    }

    /// All resource-ids held by this task.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter_map(|r| r.resource_id().map(str::to_string))
            .collect()
    }
}

/// Command a task runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommandInfo {
    pub value: String,
    pub environment: HashMap<String, String>,
}

/// Executor a task group runs under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorInfo {
    pub name: String,
}

// ── TaskStatus ────────────────────────────────────────────────────

/// A status update for a task, as reported by the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub container: Option<ContainerStatus>,
}

impl TaskStatus {
    /// Build a bare status with no reason/message/container detail.
    pub fn new(task_id: &str, state: TaskState) -> Self {
        Self {
            task_id: task_id.to_string(),
            state,
            reason: None,
            message: None,
            container: None,
        }
    }
}

/// Container-level detail attached to some statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerStatus {
    /// IP addresses assigned to the task's container, host or overlay.
    pub ip_addresses: Vec<String>,
}

/// Task lifecycle states reported by the master.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Dropped,
    Unreachable,
    Gone,
}

impl TaskState {
    /// Whether the state is terminal: the task-id will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
        )
    }

    /// Whether the state indicates a failure the recovery plan reacts to.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Lost | TaskState::Dropped | TaskState::Gone
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, task_id: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            task_id: task_id.to_string(),
            agent_id: "agent-1".to_string(),
            command: CommandInfo::default(),
            executor: None,
            resources: vec![Resource::reserved_scalar("cpus", 1.0, "role", "p", "rid-1")],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn empty_task_id_is_reservation_only() {
        assert!(task("p0-0-server", "").is_reservation_only());
        assert!(!task("p0-0-server", "t-1").is_reservation_only());
    }

    #[test]
    fn resource_ids_collected_from_reservations() {
        assert_eq!(task("p0-0-server", "t-1").resource_ids(), vec!["rid-1".to_string()]);
    }

    #[test]
    fn terminal_states() {
        for s in [
            TaskState::Finished,
            TaskState::Failed,
            TaskState::Killed,
            TaskState::Lost,
            TaskState::Dropped,
            TaskState::Gone,
        ] {
            assert!(s.is_terminal(), "{s:?} should be terminal");
        }
        for s in [
            TaskState::Staging,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Unreachable,
        ] {
            assert!(!s.is_terminal(), "{s:?} should not be terminal");
        }
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
