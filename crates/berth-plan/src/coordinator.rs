//! PlanCoordinator — the tick-level view over all active plans.
//!
//! Each tick the coordinator gathers candidate steps from its managers in
//! order, carrying a dirty-asset set: pod instances held by in-progress
//! steps anywhere, plus instances claimed by candidates already selected
//! this tick. The set is an explicit per-tick value handed to each
//! manager, not a back-pointer into the coordinator.

use std::collections::HashSet;

use tracing::debug;

use berth_proto::{TaskInfo, TaskStatus};

use crate::manager::PlanManager;
use crate::plan::Plan;
use crate::step::{Step, StepKind};

pub struct PlanCoordinator {
    managers: Vec<Box<dyn PlanManager>>,
}

impl PlanCoordinator {
    pub fn new(managers: Vec<Box<dyn PlanManager>>) -> Self {
        Self { managers }
    }

    /// Eligible step ids this tick, across all plans, dirty assets
    /// excluded. Earlier managers win contended assets.
    pub fn candidates(&mut self) -> Vec<String> {
        let mut dirty: HashSet<String> = self
            .managers
            .iter()
            .flat_map(|m| m.plan().dirty_assets())
            .collect();

        let mut selected = Vec::new();
        for manager in &mut self.managers {
            for id in manager.candidates(&dirty) {
                if let Some(asset) = manager
                    .plan()
                    .step(&id)
                    .and_then(|s| s.asset.clone())
                {
                    dirty.insert(asset);
                }
                selected.push(id);
            }
        }
        if !selected.is_empty() {
            debug!(candidates = selected.len(), "tick candidates gathered");
        }
        selected
    }

    /// Broadcast a status update to every plan manager.
    pub fn update(&mut self, task: &TaskInfo, status: &TaskStatus) {
        for manager in &mut self.managers {
            manager.update(task, status);
        }
    }

    pub fn plans(&self) -> Vec<&Plan> {
        self.managers.iter().map(|m| m.plan()).collect()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.managers.iter().find_map(|m| m.plan().step(id))
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.managers
            .iter_mut()
            .find_map(|m| m.plan_mut().step_mut(id))
    }

    /// All resource-cleanup steps across plans, for the cleanup recorder.
    pub fn resource_cleanup_steps_mut(&mut self) -> Vec<&mut Step> {
        self.managers
            .iter_mut()
            .flat_map(|m| m.plan_mut().steps_mut())
            .filter(|s| matches!(s.kind, StepKind::ResourceCleanup { .. }))
            .collect()
    }

    /// Whether every plan has run to completion.
    pub fn all_complete(&self) -> bool {
        self.managers.iter().all(|m| m.plan().is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::DeploymentPlanManager;
    use crate::plan::{Phase, Strategy};
    use crate::step::StepStatus;
    use berth_spec::{GoalState, PodSpec, ResourceSpec, ServiceSpec, TaskSpec};
    use std::collections::{BTreeSet, HashMap};

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "svc".to_string(),
            role: "svc-role".to_string(),
            principal: "svc-principal".to_string(),
            pods: vec![PodSpec {
                name: "p0".to_string(),
                count: 1,
                placement: vec![],
                tasks: vec![TaskSpec {
                    name: "server".to_string(),
                    goal: GoalState::Running,
                    command: "./server".to_string(),
                    environment: HashMap::new(),
                    resources: vec![ResourceSpec::scalar("cpus", 1.0)],
                    volumes: vec![],
                }],
            }],
            plans: vec![],
        }
    }

    /// Manager with one hand-built plan, for contention tests.
    struct FixedManager {
        plan: Plan,
    }

    impl PlanManager for FixedManager {
        fn plan(&self) -> &Plan {
            &self.plan
        }
        fn plan_mut(&mut self) -> &mut Plan {
            &mut self.plan
        }
    }

    fn cleanup_plan(name: &str, asset: &str) -> Plan {
        Plan::new(
            name,
            Strategy::Serial,
            vec![Phase::new(
                name,
                Strategy::Serial,
                vec![Step::new(
                    &format!("{name}-step"),
                    Some(asset.to_string()),
                    StepKind::ResourceCleanup {
                        remaining: BTreeSet::from(["rid".to_string()]),
                    },
                )],
            )],
        )
    }

    #[test]
    fn earlier_manager_wins_contended_asset() {
        let coordinator = &mut PlanCoordinator::new(vec![
            Box::new(FixedManager { plan: cleanup_plan("first", "p0-0") }),
            Box::new(FixedManager { plan: cleanup_plan("second", "p0-0") }),
        ]);

        let ids = coordinator.candidates();
        assert_eq!(ids.len(), 1);
        assert_eq!(coordinator.step(&ids[0]).unwrap().name, "first-step");
    }

    #[test]
    fn disjoint_assets_both_selected() {
        let coordinator = &mut PlanCoordinator::new(vec![
            Box::new(FixedManager { plan: cleanup_plan("first", "p0-0") }),
            Box::new(FixedManager { plan: cleanup_plan("second", "p1-0") }),
        ]);
        assert_eq!(coordinator.candidates().len(), 2);
    }

    #[test]
    fn in_progress_step_blocks_other_plans() {
        let mut busy = cleanup_plan("first", "p0-0");
        let id = busy.candidate_ids()[0].clone();
        busy.step_mut(&id).unwrap().status = StepStatus::Starting;

        let coordinator = &mut PlanCoordinator::new(vec![
            Box::new(FixedManager { plan: busy }),
            Box::new(FixedManager { plan: cleanup_plan("second", "p0-0") }),
        ]);

        assert!(coordinator.candidates().is_empty());
    }

    #[test]
    fn step_lookup_spans_managers() {
        let mut coordinator = PlanCoordinator::new(vec![
            Box::new(DeploymentPlanManager::new(&spec(), "cfg")),
            Box::new(FixedManager { plan: cleanup_plan("other", "p9-0") }),
        ]);

        let ids = coordinator.candidates();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert!(coordinator.step_mut(id).is_some());
        }
        assert_eq!(coordinator.resource_cleanup_steps_mut().len(), 1);
        assert!(!coordinator.all_complete());
    }
}
