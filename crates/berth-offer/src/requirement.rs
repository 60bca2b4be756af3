//! The evaluator's input: one pod instance's launch requirement.

use std::collections::HashMap;

use berth_proto::TaskInfo;
use berth_spec::service::{pod_instance_name, task_full_name};
use berth_spec::PodSpec;

/// Everything the evaluator needs to match one pod instance against
/// offers. Built by the step that owns the work; the evaluator itself
/// reads no stores.
#[derive(Debug, Clone)]
pub struct PodInstanceRequirement {
    /// Snapshot of the pod spec this instance deploys.
    pub pod: PodSpec,
    /// Instance index within the pod.
    pub instance: u32,
    /// Full names of the tasks to actually launch; other tasks in the pod
    /// only produce transient placeholders.
    pub tasks_to_launch: Vec<String>,
    /// This instance's previously stored TaskInfos by full name; their
    /// resource-ids drive reservation reuse. Empty when replacing a
    /// permanently failed instance.
    pub existing: HashMap<String, TaskInfo>,
    /// All of the service's stored tasks, consulted by placement rules.
    pub deployed: Vec<TaskInfo>,
    /// Role new reservations are made under.
    pub role: String,
    /// Principal attached to new reservations.
    pub principal: String,
    /// Target config id stamped on launched tasks.
    pub config_id: String,
}

impl PodInstanceRequirement {
    /// The pod instance name, `{pod}-{index}`.
    pub fn instance_name(&self) -> String {
        pod_instance_name(&self.pod.name, self.instance)
    }

    /// Full names of every task in this pod instance, declaration order.
    pub fn task_names(&self) -> Vec<String> {
        self.pod
            .tasks
            .iter()
            .map(|t| task_full_name(&self.pod.name, self.instance, &t.name))
            .collect()
    }

    /// Whether the named task should actually launch.
    pub fn should_launch(&self, full_name: &str) -> bool {
        self.tasks_to_launch.iter().any(|n| n == full_name)
    }

    /// The declared goal of the named task, when it belongs to this pod.
    pub fn goal_for(&self, full_name: &str) -> Option<berth_spec::GoalState> {
        self.pod
            .tasks
            .iter()
            .find(|t| task_full_name(&self.pod.name, self.instance, &t.name) == full_name)
            .map(|t| t.goal)
    }
}
