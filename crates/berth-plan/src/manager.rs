//! Plan managers — one owner per plan.

use std::collections::HashSet;

use berth_proto::{TaskInfo, TaskStatus};
use berth_spec::service::{pod_instance_name, task_full_name};
use berth_spec::{PlanSpec, ServiceSpec};

use berth_offer::PodInstanceRequirement;

use crate::plan::{Phase, Plan, Strategy};
use crate::step::Step;
use crate::DEPLOY_PLAN;

/// Owns a plan and advances it from task statuses. The dirty-asset set
/// passed to `candidates` holds pod instances already claimed this tick by
/// other plans; a manager must not hand out steps touching them.
pub trait PlanManager: Send {
    fn plan(&self) -> &Plan;

    fn plan_mut(&mut self) -> &mut Plan;

    /// Step ids eligible this tick, excluding dirty assets.
    fn candidates(&mut self, dirty: &HashSet<String>) -> Vec<String> {
        self.plan()
            .candidate_ids()
            .into_iter()
            .filter(|id| {
                self.plan()
                    .step(id)
                    .and_then(|s| s.asset.as_ref())
                    .is_none_or(|asset| !dirty.contains(asset))
            })
            .collect()
    }

    /// React to a status update for a known task.
    fn update(&mut self, task: &TaskInfo, status: &TaskStatus) {
        let name = task.name.clone();
        for step in self.plan_mut().steps_mut() {
            step.update_status(&name, status);
        }
    }
}

/// Drives the monotonic deployment plan generated from the target config.
/// A target-config change is effected by building a fresh manager from the
/// new spec.
pub struct DeploymentPlanManager {
    plan: Plan,
}

impl DeploymentPlanManager {
    /// Default deployment plan: one serial phase per pod, one launch step
    /// per pod instance.
    pub fn new(spec: &ServiceSpec, config_id: &str) -> Self {
        let phases = spec
            .pods
            .iter()
            .map(|pod| {
                let steps = (0..pod.count)
                    .map(|index| launch_step(spec, pod, index, config_id))
                    .collect();
                Phase::new(&pod.name, Strategy::Serial, steps)
            })
            .collect();
        Self { plan: Plan::new(DEPLOY_PLAN, Strategy::Serial, phases) }
    }

    /// Build a plan from a declared [`PlanSpec`], phase order as written.
    pub fn from_plan_spec(spec: &ServiceSpec, plan_spec: &PlanSpec, config_id: &str) -> Self {
        let phases = plan_spec
            .phases
            .iter()
            .filter_map(|phase_spec| {
                let pod = spec.pod(&phase_spec.pod)?;
                let steps = (0..pod.count)
                    .map(|index| launch_step(spec, pod, index, config_id))
                    .collect();
                Some(Phase::new(&phase_spec.name, Strategy::Serial, steps))
            })
            .collect();
        Self { plan: Plan::new(&plan_spec.name, Strategy::Serial, phases) }
    }
}

impl PlanManager for DeploymentPlanManager {
    fn plan(&self) -> &Plan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }
}

/// A launch step covering one full pod instance.
fn launch_step(spec: &ServiceSpec, pod: &berth_spec::PodSpec, index: u32, config_id: &str) -> Step {
    let tasks_to_launch = pod
        .tasks
        .iter()
        .map(|t| task_full_name(&pod.name, index, &t.name))
        .collect();
    let requirement = PodInstanceRequirement {
        pod: pod.clone(),
        instance: index,
        tasks_to_launch,
        existing: Default::default(),
        deployed: Vec::new(),
        role: spec.role.clone(),
        principal: spec.principal.clone(),
        config_id: config_id.to_string(),
    };
    Step::launch(&pod_instance_name(&pod.name, index), requirement, None)
}
