//! Recovery — transient steps created when tasks fail.
//!
//! The recovery plan starts empty. A failed status spawns a step that
//! relaunches the task: in place on its existing reservations for a
//! transient failure, or as a full replacement (fresh reservations) when
//! the task carries the permanently-failed marker. Steps for tasks that
//! came back on their own are pruned.

use std::collections::HashMap;

use tracing::{debug, info};

use berth_offer::PodInstanceRequirement;
use berth_proto::{labels, TaskInfo, TaskStatus};
use berth_spec::service::task_full_name;
use berth_spec::{PodSpec, ServiceSpec};

use crate::manager::PlanManager;
use crate::plan::{Phase, Plan, Strategy};
use crate::step::{RecoveryType, Step, StepStatus};
use crate::RECOVERY_PLAN;

pub struct RecoveryPlanManager {
    plan: Plan,
    spec: ServiceSpec,
    config_id: String,
}

impl RecoveryPlanManager {
    pub fn new(spec: ServiceSpec, config_id: &str) -> Self {
        let plan = Plan::new(
            RECOVERY_PLAN,
            Strategy::Parallel,
            vec![Phase::new(RECOVERY_PLAN, Strategy::Parallel, Vec::new())],
        );
        Self { plan, spec, config_id: config_id.to_string() }
    }

    fn has_step_for(&self, task_name: &str) -> bool {
        self.plan
            .steps()
            .any(|s| s.name == recovery_step_name(task_name))
    }

    fn create_step(&mut self, task: &TaskInfo, recovery: RecoveryType) {
        let Some((pod, instance)) = locate_task(&self.spec, &task.name) else {
            debug!(task = %task.name, "failed task not in target spec, leaving to cleanup");
            return;
        };

        let requirement = PodInstanceRequirement {
            pod: pod.clone(),
            instance,
            tasks_to_launch: vec![task.name.clone()],
            existing: HashMap::new(),
            deployed: Vec::new(),
            role: self.spec.role.clone(),
            principal: self.spec.principal.clone(),
            config_id: self.config_id.clone(),
        };
        info!(task = %task.name, ?recovery, "recovery step created");
        self.plan.phases[0].steps.push(Step::launch(
            &recovery_step_name(&task.name),
            requirement,
            Some(recovery),
        ));
    }
}

impl PlanManager for RecoveryPlanManager {
    fn plan(&self) -> &Plan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    fn update(&mut self, task: &TaskInfo, status: &TaskStatus) {
        for step in self.plan.steps_mut() {
            step.update_status(&task.name, status);
        }
        // Completed recoveries leave the plan; a task that recovered on
        // its own drops its not-yet-launched step.
        let name = recovery_step_name(&task.name);
        self.plan.phases[0].steps.retain(|s| {
            if s.is_complete() {
                return false;
            }
            !(s.name == name && !needs_recovery(status) && s.status == StepStatus::Pending)
        });

        if needs_recovery(status) && !self.has_step_for(&task.name) {
            let recovery = if task.labels.contains_key(labels::PERMANENTLY_FAILED) {
                RecoveryType::Permanent
            } else {
                RecoveryType::Transient
            };
            self.create_step(task, recovery);
        }
    }
}

fn recovery_step_name(task_name: &str) -> String {
    format!("recover-{task_name}")
}

/// Failure states plus Killed: a killed Running-goal task still needs a
/// relaunch (goal overrides gate whether the relaunch actually happens).
fn needs_recovery(status: &TaskStatus) -> bool {
    status.state.is_failed() || status.state == berth_proto::TaskState::Killed
}

/// Find the pod and instance index a full task name belongs to.
fn locate_task<'a>(spec: &'a ServiceSpec, task_name: &str) -> Option<(&'a PodSpec, u32)> {
    for pod in &spec.pods {
        for index in 0..pod.count {
            for task in &pod.tasks {
                if task_full_name(&pod.name, index, &task.name) == task_name {
                    return Some((pod, index));
                }
            }
        }
    }
    None
}
