//! Decommission — ordered teardown of pod instances leaving the service.
//!
//! Built when the target spec shrinks a pod (or drops it entirely). Each
//! departing instance gets its own phase: kill its tasks, wait for their
//! reservations to be unreserved and volumes destroyed, then erase the
//! stored TaskInfos.

use std::collections::BTreeMap;

use tracing::info;

use berth_proto::{labels, TaskInfo};

use crate::manager::PlanManager;
use crate::plan::{Phase, Plan, Strategy};
use crate::step::{Step, StepKind};
use crate::DECOMMISSION_PLAN;

pub struct DecommissionPlanManager {
    plan: Plan,
    task_names: Vec<String>,
}

impl DecommissionPlanManager {
    /// Build a plan tearing down the given stored tasks. Returns `None`
    /// when nothing is departing.
    pub fn new(departing: &[TaskInfo]) -> Option<Self> {
        if departing.is_empty() {
            return None;
        }

        // Group by pod instance; fall back to the task name for records
        // that predate instance labels.
        let mut by_instance: BTreeMap<String, Vec<&TaskInfo>> = BTreeMap::new();
        for task in departing {
            let instance = task
                .labels
                .get(labels::POD_INSTANCE)
                .cloned()
                .unwrap_or_else(|| task.name.clone());
            by_instance.entry(instance).or_default().push(task);
        }

        let mut phases = Vec::new();
        for (instance, tasks) in &by_instance {
            let mut steps = Vec::new();

            let task_ids: Vec<String> = tasks
                .iter()
                .filter(|t| !t.is_reservation_only())
                .map(|t| t.task_id.clone())
                .collect();
            if !task_ids.is_empty() {
                steps.push(Step::new(
                    &format!("kill-{instance}"),
                    Some(instance.clone()),
                    StepKind::KillTasks { task_ids },
                ));
            }

            let resource_ids: Vec<String> =
                tasks.iter().flat_map(|t| t.resource_ids()).collect();
            if !resource_ids.is_empty() {
                steps.push(Step::new(
                    &format!("unreserve-{instance}"),
                    Some(instance.clone()),
                    StepKind::ResourceCleanup {
                        remaining: resource_ids.into_iter().collect(),
                    },
                ));
            }

            for task in tasks {
                steps.push(Step::new(
                    &format!("erase-{}", task.name),
                    Some(instance.clone()),
                    StepKind::EraseTask { task_name: task.name.clone() },
                ));
            }

            phases.push(Phase::new(instance, Strategy::Serial, steps));
        }

        let task_names = departing.iter().map(|t| t.name.clone()).collect();
        info!(instances = phases.len(), "decommission plan generated");
        Some(Self {
            plan: Plan::new(DECOMMISSION_PLAN, Strategy::Parallel, phases),
            task_names,
        })
    }

    /// Names of the tasks being decommissioned; these stay in the active
    /// set at registration so their statuses keep flowing until teardown.
    pub fn tasks_to_decommission(&self) -> &[String] {
        &self.task_names
    }
}

impl PlanManager for DecommissionPlanManager {
    fn plan(&self) -> &Plan {
        &self.plan
    }

    fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_proto::{CommandInfo, Resource};
    use std::collections::HashMap;

    fn departing_task(name: &str, instance: &str, task_id: &str, rid: &str) -> TaskInfo {
        let mut task_labels = HashMap::new();
        task_labels.insert(labels::POD_INSTANCE.to_string(), instance.to_string());
        TaskInfo {
            name: name.to_string(),
            task_id: task_id.to_string(),
            agent_id: "a1".to_string(),
            command: CommandInfo::default(),
            executor: None,
            resources: vec![Resource::reserved_scalar("cpus", 1.0, "role", "p", rid)],
            labels: task_labels,
        }
    }

    #[test]
    fn empty_departure_builds_no_plan() {
        assert!(DecommissionPlanManager::new(&[]).is_none());
    }

    #[test]
    fn plan_orders_kill_cleanup_erase() {
        let manager = DecommissionPlanManager::new(&[departing_task(
            "p1-0-server",
            "p1-0",
            "t-1",
            "rid-1",
        )])
        .unwrap();

        let names: Vec<_> = manager.plan().steps().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "kill-p1-0".to_string(),
                "unreserve-p1-0".to_string(),
                "erase-p1-0-server".to_string(),
            ]
        );
        assert_eq!(manager.tasks_to_decommission(), ["p1-0-server".to_string()]);
    }

    #[test]
    fn reservation_only_record_skips_kill() {
        let mut task = departing_task("p1-0-server", "p1-0", "", "rid-1");
        task.task_id = String::new();
        let manager = DecommissionPlanManager::new(&[task]).unwrap();

        let names: Vec<_> = manager.plan().steps().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec!["unreserve-p1-0".to_string(), "erase-p1-0-server".to_string()]
        );
    }

    #[test]
    fn instances_decommission_in_parallel_phases() {
        let manager = DecommissionPlanManager::new(&[
            departing_task("p1-0-server", "p1-0", "t-1", "rid-1"),
            departing_task("p1-1-server", "p1-1", "t-2", "rid-2"),
        ])
        .unwrap();

        assert_eq!(manager.plan().phases.len(), 2);
        // Both kill steps are eligible at once.
        assert_eq!(manager.plan().candidate_ids().len(), 2);
    }
}
