//! StateStore — tasks, statuses, goal overrides, and per-task properties.
//!
//! Status writes are validated: a terminal task cannot re-enter a
//! non-terminal state under the same task-id, and statuses for tasks the
//! store does not know are rejected. Status-induced lookups go by task-id,
//! not name, since names can be rebound across relaunches.

use std::sync::Arc;

use tracing::{debug, info};

use berth_proto::{TaskInfo, TaskStatus};
use berth_spec::OverrideStatus;

use crate::error::{StoreError, StoreResult};
use crate::paths;
use crate::persister::Persister;

/// Typed store for everything task-scoped, plus the uninstall marker.
#[derive(Clone)]
pub struct StateStore {
    persister: Arc<dyn Persister>,
}

impl StateStore {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }

    /// The underlying persister, for layers that need raw access (the
    /// uninstall teardown deletes the full subtree through it).
    pub fn persister(&self) -> Arc<dyn Persister> {
        Arc::clone(&self.persister)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Upsert TaskInfos, one blob per task. Writing one at a time bounds
    /// the damage of a crash to a single inconsistent record; the
    /// reconciliation pass resyncs the rest.
    pub fn store_tasks(&self, tasks: &[TaskInfo]) -> StoreResult<()> {
        for task in tasks {
            let value = serde_json::to_vec(task)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            self.persister.set(&paths::task_info(&task.name), &value)?;
            debug!(task = %task.name, task_id = %task.task_id, "task info stored");
        }
        Ok(())
    }

    pub fn fetch_tasks(&self) -> StoreResult<Vec<TaskInfo>> {
        let mut tasks = Vec::new();
        for name in self.persister.list(paths::TASKS)? {
            if let Some(task) = self.fetch_task(&name)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub fn fetch_task(&self, name: &str) -> StoreResult<Option<TaskInfo>> {
        match self.persister.get(&paths::task_info(name)) {
            Ok(bytes) => {
                let task = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialize(e.to_string()))?;
                Ok(Some(task))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a task and everything stored under it.
    pub fn clear_task(&self, name: &str) -> StoreResult<()> {
        let removed = self.persister.recursive_delete(&paths::task(name))?;
        info!(task = name, removed, "task cleared");
        Ok(())
    }

    /// Resolve the task name a status belongs to, by task-id.
    pub fn task_name_for_status(&self, status: &TaskStatus) -> StoreResult<String> {
        if status.task_id.is_empty() {
            return Err(StoreError::UnknownTask("<empty task-id>".to_string()));
        }
        for task in self.fetch_tasks()? {
            if task.task_id == status.task_id {
                return Ok(task.name);
            }
        }
        Err(StoreError::UnknownTask(status.task_id.clone()))
    }

    // ── Statuses ───────────────────────────────────────────────────

    /// Store a status for a known task. Idempotent; rejects a terminal →
    /// non-terminal transition under the same task-id.
    pub fn store_status(&self, name: &str, status: &TaskStatus) -> StoreResult<()> {
        let task = self
            .fetch_task(name)?
            .ok_or_else(|| StoreError::UnknownTask(name.to_string()))?;

        if let Some(previous) = self.fetch_status(name)? {
            let same_task_id =
                previous.task_id == status.task_id && task.task_id == status.task_id;
            if same_task_id && previous.state.is_terminal() && !status.state.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    task: name.to_string(),
                    from: format!("{:?}", previous.state),
                    to: format!("{:?}", status.state),
                });
            }
        }

        let value = serde_json::to_vec(status)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.persister.set(&paths::task_status(name), &value)?;
        debug!(task = name, state = ?status.state, "status stored");
        Ok(())
    }

    pub fn fetch_status(&self, name: &str) -> StoreResult<Option<TaskStatus>> {
        match self.persister.get(&paths::task_status(name)) {
            Ok(bytes) => {
                let status = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialize(e.to_string()))?;
                Ok(Some(status))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All stored statuses, in task-name order.
    pub fn fetch_statuses(&self) -> StoreResult<Vec<TaskStatus>> {
        let mut statuses = Vec::new();
        for name in self.persister.list(paths::TASKS)? {
            if let Some(status) = self.fetch_status(&name)? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    /// Drop a stale status, e.g. before relaunching a task under a new id.
    pub fn clear_status(&self, name: &str) -> StoreResult<()> {
        match self.persister.delete(&paths::task_status(name)) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Goal overrides ─────────────────────────────────────────────

    /// Store an override status, validating against the transition table.
    pub fn store_goal_override(&self, name: &str, status: &OverrideStatus) -> StoreResult<()> {
        if self.fetch_task(name)?.is_none() {
            return Err(StoreError::UnknownTask(name.to_string()));
        }
        let current = self.fetch_goal_override(name)?;
        if !current.allows(status) {
            return Err(StoreError::InvalidOverrideTransition(name.to_string()));
        }
        let value = serde_json::to_vec(status)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.persister.set(&paths::goal_override(name), &value)?;
        info!(task = name, target = ?status.target, progress = ?status.progress, "goal override stored");
        Ok(())
    }

    /// The task's override status; inactive when none was ever stored.
    pub fn fetch_goal_override(&self, name: &str) -> StoreResult<OverrideStatus> {
        match self.persister.get(&paths::goal_override(name)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialize(e.to_string())),
            Err(StoreError::NotFound(_)) => Ok(OverrideStatus::inactive()),
            Err(e) => Err(e),
        }
    }

    // ── Properties ─────────────────────────────────────────────────

    /// Store a free-form property scoped to a task.
    pub fn store_property(&self, name: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_property_key(key)?;
        self.persister.set(&paths::task_property(name, key), value)
    }

    pub fn fetch_property(&self, name: &str, key: &str) -> StoreResult<Vec<u8>> {
        validate_property_key(key)?;
        self.persister.get(&paths::task_property(name, key))
    }

    pub fn property_keys(&self, name: &str) -> StoreResult<Vec<String>> {
        self.persister.list(&paths::task_properties(name))
    }

    // ── Uninstall marker ───────────────────────────────────────────

    /// Flag the service as uninstalling. Write-once: the bit is never
    /// cleared for the lifetime of the persisted state.
    pub fn set_uninstalling(&self) -> StoreResult<()> {
        self.persister.set(&paths::uninstall_marker(), b"uninstall")?;
        info!("uninstall marker set");
        Ok(())
    }

    pub fn is_uninstalling(&self) -> StoreResult<bool> {
        match self.persister.get(&paths::uninstall_marker()) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn validate_property_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.contains('/') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::RedbPersister;
    use berth_proto::{CommandInfo, Resource, TaskState};
    use berth_spec::{GoalOverride, OverrideProgress};
    use std::collections::HashMap;

    fn store() -> StateStore {
        StateStore::new(Arc::new(RedbPersister::open_in_memory().unwrap()))
    }

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
    fn store_and_fetch_tasks() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1"), task("p0-1-server", "t-2")])
            .unwrap();

        let tasks = s.fetch_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            s.fetch_task("p0-0-server").unwrap().unwrap().task_id,
            "t-1"
        );
    }

    #[test]
    fn clear_task_removes_subtree() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        s.store_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Running))
            .unwrap();

        s.clear_task("p0-0-server").unwrap();
        assert!(s.fetch_task("p0-0-server").unwrap().is_none());
        assert!(s.fetch_status("p0-0-server").unwrap().is_none());
    }

    #[test]
    fn status_for_unknown_task_rejected() {
        let s = store();
        let err = s
            .store_status("nope", &TaskStatus::new("t-1", TaskState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[test]
    fn terminal_cannot_reenter_nonterminal_same_id() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        s.store_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Failed))
            .unwrap();

        let err = s
            .store_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn new_task_id_may_go_nonterminal_after_terminal() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        s.store_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Failed))
            .unwrap();

        // Relaunch under a fresh task-id.
        s.store_tasks(&[task("p0-0-server", "t-2")]).unwrap();
        s.store_status("p0-0-server", &TaskStatus::new("t-2", TaskState::Running))
            .unwrap();
        assert_eq!(
            s.fetch_status("p0-0-server").unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[test]
    fn status_store_is_idempotent() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        let status = TaskStatus::new("t-1", TaskState::Finished);
        s.store_status("p0-0-server", &status).unwrap();
        s.store_status("p0-0-server", &status).unwrap();
        assert_eq!(s.fetch_status("p0-0-server").unwrap().unwrap(), status);
    }

    #[test]
    fn task_name_resolved_by_task_id() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1"), task("p0-1-server", "t-2")])
            .unwrap();

        let name = s
            .task_name_for_status(&TaskStatus::new("t-2", TaskState::Running))
            .unwrap();
        assert_eq!(name, "p0-1-server");

        let err = s
            .task_name_for_status(&TaskStatus::new("t-9", TaskState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[test]
    fn reservation_only_record_not_resolved_by_empty_id() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "")]).unwrap();
        let err = s
            .task_name_for_status(&TaskStatus::new("", TaskState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[test]
    fn goal_override_defaults_inactive() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        assert_eq!(
            s.fetch_goal_override("p0-0-server").unwrap(),
            OverrideStatus::inactive()
        );
    }

    #[test]
    fn goal_override_transition_enforced() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();

        s.store_goal_override("p0-0-server", &OverrideStatus::pending(GoalOverride::Paused))
            .unwrap();
        // Jumping targets mid-flight is rejected.
        let err = s
            .store_goal_override("p0-0-server", &OverrideStatus::pending(GoalOverride::Stopped))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOverrideTransition(_)));

        s.store_goal_override(
            "p0-0-server",
            &OverrideStatus {
                target: GoalOverride::Paused,
                progress: OverrideProgress::InProgress,
            },
        )
        .unwrap();
    }

    #[test]
    fn properties_scoped_per_task() {
        let s = store();
        s.store_tasks(&[task("p0-0-server", "t-1")]).unwrap();
        s.store_property("p0-0-server", "last_ip", b"10.0.0.1").unwrap();

        assert_eq!(
            s.fetch_property("p0-0-server", "last_ip").unwrap(),
            b"10.0.0.1"
        );
        assert_eq!(
            s.property_keys("p0-0-server").unwrap(),
            vec!["last_ip".to_string()]
        );
        assert!(matches!(
            s.store_property("p0-0-server", "bad/key", b""),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn uninstall_marker_sticks() {
        let s = store();
        assert!(!s.is_uninstalling().unwrap());
        s.set_uninstalling().unwrap();
        assert!(s.is_uninstalling().unwrap());
        // Setting again is harmless.
        s.set_uninstalling().unwrap();
        assert!(s.is_uninstalling().unwrap());
    }
}
