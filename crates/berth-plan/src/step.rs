//! Steps — the leaves of a plan.
//!
//! Step status machine:
//!
//! ```text
//! Pending → Prepared → Starting → Started → Complete
//!    any → Error         (terminal, non-recoverable)
//!    Waiting              (externally blocked)
//! ```
//!
//! A launch step re-enters Pending when its task fails before completion,
//! so the next tick relaunches it.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use uuid::Uuid;

use berth_offer::PodInstanceRequirement;
use berth_proto::{TaskState, TaskStatus};
use berth_spec::GoalState;

/// Where a step currently is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// `start()` ran; for launch steps, a requirement is available.
    Prepared,
    /// Blocked on something outside the scheduler.
    Waiting,
    /// Recommendations were accepted; waiting on task statuses.
    Starting,
    /// The task reached its running state; goal not yet met.
    Started,
    /// Goal predicate holds.
    Complete,
    /// Terminal, non-recoverable failure.
    Error(String),
}

impl StepStatus {
    /// Whether the step holds its pod instance as a dirty asset.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            StepStatus::Prepared | StepStatus::Starting | StepStatus::Started
        )
    }
}

/// Whether a recovery step relaunches in place or replaces outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryType {
    /// Relaunch on the existing reservations.
    Transient,
    /// Discard reservations and reserve afresh; the old resource-ids
    /// surface later as unexpected and are unreserved.
    Permanent,
}

/// The concrete work a step maps to.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Launch (part of) a pod instance. The requirement's `existing` and
    /// `deployed` snapshots are refreshed by the plan scheduler each tick.
    Launch {
        requirement: Box<PodInstanceRequirement>,
        recovery: Option<RecoveryType>,
    },
    /// Kill the given task-ids; complete once all are terminal.
    KillTasks { task_ids: Vec<String> },
    /// Wait until every listed resource-id has been unreserved/destroyed.
    ResourceCleanup { remaining: BTreeSet<String> },
    /// Remove a task's stored state.
    EraseTask { task_name: String },
    /// Flag the persisted uninstall bit.
    SetUninstallFlag,
    /// Delete TLS secrets through the secrets client.
    DeleteSecrets,
    /// Recursively delete all persistent state.
    DeleteState,
    /// Tear down the framework registration.
    DeregisterFramework,
}

/// One unit of deployment work.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub name: String,
    /// Pod instance this step touches; drives the dirty-asset rule.
    pub asset: Option<String>,
    pub status: StepStatus,
    pub kind: StepKind,
    /// Task-ids the last accepted launch produced; statuses for these
    /// advance the step.
    pub pending_task_ids: Vec<String>,
}

impl Step {
    pub fn new(name: &str, asset: Option<String>, kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            asset,
            status: StepStatus::Pending,
            kind,
            pending_task_ids: Vec::new(),
        }
    }

    /// Convenience constructor for a launch step.
    pub fn launch(
        name: &str,
        requirement: PodInstanceRequirement,
        recovery: Option<RecoveryType>,
    ) -> Self {
        let asset = requirement.instance_name();
        Self::new(
            name,
            Some(asset),
            StepKind::Launch { requirement: Box::new(requirement), recovery },
        )
    }

    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self.status, StepStatus::Pending | StepStatus::Prepared)
    }

    /// Begin the step. Launch steps move Pending → Prepared and expose
    /// their requirement; other kinds just move to Prepared and are
    /// executed by their owning scheduler.
    pub fn start(&mut self) -> Option<&PodInstanceRequirement> {
        if self.status == StepStatus::Pending {
            self.status = StepStatus::Prepared;
            debug!(step = %self.name, "step prepared");
        }
        match &self.kind {
            StepKind::Launch { requirement, .. } => Some(requirement),
            _ => None,
        }
    }

    /// Record that recommendations for this step were accepted; the given
    /// task-ids are what the launches produced.
    pub fn set_starting(&mut self, pending_task_ids: Vec<String>) {
        self.pending_task_ids = pending_task_ids;
        self.status = StepStatus::Starting;
        info!(step = %self.name, tasks = ?self.pending_task_ids, "step starting");
    }

    pub fn set_complete(&mut self) {
        self.status = StepStatus::Complete;
        info!(step = %self.name, "step complete");
    }

    /// Park the step on an external dependency; the owner re-drives it.
    pub fn set_waiting(&mut self) {
        debug!(step = %self.name, "step waiting on external dependency");
        self.status = StepStatus::Waiting;
    }

    pub fn set_error(&mut self, message: &str) {
        warn!(step = %self.name, message, "step errored");
        self.status = StepStatus::Error(message.to_string());
    }

    /// Advance a launch step from a status update for `task_name`.
    pub fn update_status(&mut self, task_name: &str, status: &TaskStatus) {
        match &self.kind {
            StepKind::Launch { requirement, .. } => {
                if !requirement.tasks_to_launch.iter().any(|n| n == task_name) {
                    return;
                }
                if !self.pending_task_ids.iter().any(|id| id == &status.task_id) {
                    return;
                }
                self.update_launch_status(requirement.goal_for(task_name), status);
            }
            StepKind::KillTasks { task_ids } => {
                if self.status == StepStatus::Complete {
                    return;
                }
                if task_ids.iter().any(|id| id == &status.task_id)
                    && status.state.is_terminal()
                {
                    self.pending_task_ids.retain(|id| id != &status.task_id);
                    if self.status == StepStatus::Starting && self.pending_task_ids.is_empty() {
                        self.set_complete();
                    }
                }
            }
            _ => {}
        }
    }

    fn update_launch_status(&mut self, goal: Option<GoalState>, status: &TaskStatus) {
        if self.status == StepStatus::Complete {
            return;
        }
        match status.state {
            TaskState::Staging | TaskState::Starting => {}
            TaskState::Running => match goal {
                Some(GoalState::Running) | None => self.set_complete(),
                Some(GoalState::Once) => {
                    self.status = StepStatus::Started;
                    debug!(step = %self.name, "step started, awaiting completion");
                }
            },
            TaskState::Finished => {
                if goal == Some(GoalState::Once) {
                    self.set_complete();
                } else {
                    // A Running-goal task exiting cleanly still needs a
                    // relaunch.
                    self.relaunch("task finished before goal");
                }
            }
            state if state.is_failed() || state == TaskState::Killed => {
                self.relaunch(&format!("task reached {state:?}"));
            }
            _ => {}
        }
    }

    fn relaunch(&mut self, reason: &str) {
        debug!(step = %self.name, reason, "step back to pending");
        self.pending_task_ids.clear();
        self.status = StepStatus::Pending;
    }

    /// Notify a resource-cleanup step that a resource-id was released.
    /// Returns true when this step tracked the id.
    pub fn resource_cleaned(&mut self, resource_id: &str) -> bool {
        let StepKind::ResourceCleanup { remaining } = &mut self.kind else {
            return false;
        };
        if !remaining.remove(resource_id) {
            return false;
        }
        if self.status == StepStatus::Pending {
            self.status = StepStatus::Prepared;
        }
        if remaining.is_empty() {
            self.set_complete();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_spec::{PodSpec, ResourceSpec, TaskSpec};
    use std::collections::HashMap;

    fn requirement(goal: GoalState) -> PodInstanceRequirement {
        PodInstanceRequirement {
            pod: PodSpec {
                name: "p0".to_string(),
                count: 1,
                placement: vec![],
                tasks: vec![TaskSpec {
                    name: "server".to_string(),
                    goal,
                    command: "./server".to_string(),
                    environment: HashMap::new(),
                    resources: vec![ResourceSpec::scalar("cpus", 1.0)],
                    volumes: vec![],
                }],
            },
            instance: 0,
            tasks_to_launch: vec!["p0-0-server".to_string()],
            existing: HashMap::new(),
            deployed: vec![],
            role: "role".to_string(),
            principal: "principal".to_string(),
            config_id: "cfg".to_string(),
        }
    }

    #[test]
    fn start_prepares_and_exposes_requirement() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Running), None);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.start().is_some());
        assert_eq!(step.status, StepStatus::Prepared);
        // start() is idempotent on a prepared step.
        assert!(step.start().is_some());
        assert_eq!(step.status, StepStatus::Prepared);
    }

    #[test]
    fn running_completes_running_goal() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Running), None);
        step.start();
        step.set_starting(vec!["t-1".to_string()]);

        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Running));
        assert!(step.is_complete());
    }

    #[test]
    fn once_goal_needs_finished() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Once), None);
        step.start();
        step.set_starting(vec!["t-1".to_string()]);

        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Running));
        assert_eq!(step.status, StepStatus::Started);

        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Finished));
        assert!(step.is_complete());
    }

    #[test]
    fn failure_returns_step_to_pending() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Running), None);
        step.start();
        step.set_starting(vec!["t-1".to_string()]);

        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Failed));
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.pending_task_ids.is_empty());
    }

    #[test]
    fn stale_task_id_ignored() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Running), None);
        step.start();
        step.set_starting(vec!["t-2".to_string()]);

        // Status for a previous incarnation.
        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Running));
        assert_eq!(step.status, StepStatus::Starting);
    }

    #[test]
    fn status_update_is_idempotent() {
        let mut step = Step::launch("p0-0", requirement(GoalState::Running), None);
        step.start();
        step.set_starting(vec!["t-1".to_string()]);

        let status = TaskStatus::new("t-1", TaskState::Running);
        step.update_status("p0-0-server", &status);
        step.update_status("p0-0-server", &status);
        assert!(step.is_complete());
    }

    #[test]
    fn kill_step_completes_when_all_terminal() {
        let mut step = Step::new(
            "kill-p0-0",
            Some("p0-0".to_string()),
            StepKind::KillTasks { task_ids: vec!["t-1".to_string(), "t-2".to_string()] },
        );
        step.set_starting(vec!["t-1".to_string(), "t-2".to_string()]);

        step.update_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Killed));
        assert!(!step.is_complete());
        step.update_status("p0-0-sidecar", &TaskStatus::new("t-2", TaskState::Killed));
        assert!(step.is_complete());
    }

    #[test]
    fn resource_cleanup_tracks_remaining() {
        let mut step = Step::new(
            "unreserve-p0-0",
            Some("p0-0".to_string()),
            StepKind::ResourceCleanup {
                remaining: ["rid-1".to_string(), "rid-2".to_string()].into_iter().collect(),
            },
        );

        assert!(step.resource_cleaned("rid-1"));
        assert!(!step.is_complete());
        assert!(!step.resource_cleaned("rid-9"));
        assert!(step.resource_cleaned("rid-2"));
        assert!(step.is_complete());
    }
}
