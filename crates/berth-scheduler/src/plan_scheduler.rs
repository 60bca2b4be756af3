//! PlanScheduler — drives eligible launch steps through the evaluator.
//!
//! Each tick walks the candidate steps in order, refreshes each launch
//! requirement against current state (reservation reuse, goal overrides),
//! evaluates it against the offers not yet consumed this tick, and marks
//! matched steps Starting with their produced task-ids. No driver calls
//! and no persistence happen here; the caller records the returned
//! recommendations first and only then lets the processor accept them.

use std::collections::HashMap;

use tracing::{debug, warn};

use berth_offer::{OfferEvaluator, OfferOutcomeTracker, OfferRecommendation, PodInstanceRequirement};
use berth_plan::{PlanCoordinator, RecoveryType, StepKind};
use berth_proto::{Offer, TaskInfo};
use berth_spec::GoalOverride;
use berth_store::{StateStore, StoreResult};

use crate::config::SchedulerConfig;

/// The launches and reservations one tick produced.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub recommendations: Vec<OfferRecommendation>,
    /// Steps marked Starting this tick; reverted by the caller when the
    /// recommendations cannot be recorded.
    pub started_steps: Vec<String>,
}

pub struct PlanScheduler {
    evaluator: OfferEvaluator,
    state: StateStore,
    config: SchedulerConfig,
}

impl PlanScheduler {
    pub fn new(state: StateStore, config: SchedulerConfig) -> Self {
        Self { evaluator: OfferEvaluator::new(), state, config }
    }

    /// Evaluate the candidate launch steps against the offer batch.
    pub fn resource_offers(
        &self,
        coordinator: &mut PlanCoordinator,
        candidate_ids: &[String],
        offers: &[Offer],
        tracker: &mut OfferOutcomeTracker,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if candidate_ids.is_empty() || offers.is_empty() {
            return outcome;
        }

        let deployed = match self.state.fetch_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "skipping tick, could not load task state");
                return outcome;
            }
        };

        let mut remaining: Vec<Offer> = offers.to_vec();
        for id in candidate_ids {
            if remaining.is_empty() {
                break;
            }
            let Some(step) = coordinator.step_mut(id) else {
                continue;
            };
            let recovery = match &step.kind {
                StepKind::Launch { recovery, .. } => *recovery,
                _ => continue,
            };
            let Some(requirement) = step.start() else {
                continue;
            };
            let requirement = requirement.clone();
            let step_name = step.name.clone();

            let effective = match self.effective_requirement(&requirement, recovery, &deployed) {
                Ok(req) => req,
                Err(e) => {
                    warn!(step = %step_name, error = %e, "skipping step, could not refresh requirement");
                    continue;
                }
            };
            if effective.tasks_to_launch.is_empty() {
                debug!(step = %step_name, "all tasks stopped by override, nothing to launch");
                continue;
            }

            let recommendations = self.evaluator.evaluate(&effective, &remaining, tracker);
            if recommendations.is_empty() {
                continue;
            }

            // This step's offer leaves the pool for the rest of the tick.
            let used = berth_offer::recommendation::offer_ids(&recommendations);
            remaining.retain(|o| !used.contains(&o.id));

            let launched_ids: Vec<String> = recommendations
                .iter()
                .filter_map(|rec| match rec {
                    OfferRecommendation::Launch { task, should_launch: true, .. } => {
                        Some(task.task_id.clone())
                    }
                    _ => None,
                })
                .collect();

            // Transient placeholders never reach the recorder or driver.
            let live: Vec<OfferRecommendation> = recommendations
                .into_iter()
                .filter(|rec| {
                    !matches!(rec, OfferRecommendation::Launch { should_launch: false, .. })
                })
                .collect();

            if let Some(step) = coordinator.step_mut(id) {
                step.set_starting(launched_ids);
            }
            outcome.started_steps.push(id.clone());
            outcome.recommendations.extend(live);
        }
        outcome
    }

    /// Refresh a step's requirement against current state: reservation
    /// reuse, the deployed-task snapshot for placement, and goal
    /// overrides (Stopped tasks don't launch; Paused tasks launch with
    /// the pause command).
    fn effective_requirement(
        &self,
        requirement: &PodInstanceRequirement,
        recovery: Option<RecoveryType>,
        deployed: &[TaskInfo],
    ) -> StoreResult<PodInstanceRequirement> {
        let mut effective = requirement.clone();
        effective.deployed = deployed.to_vec();

        effective.existing = match recovery {
            // Replacement discards reservations; the old resource-ids
            // surface later as unexpected and are unreserved.
            Some(RecoveryType::Permanent) => HashMap::new(),
            _ => {
                let names = effective.task_names();
                deployed
                    .iter()
                    .filter(|t| names.contains(&t.name))
                    .map(|t| (t.name.clone(), t.clone()))
                    .collect()
            }
        };

        let mut to_launch = Vec::new();
        for name in &requirement.tasks_to_launch {
            let override_status = self.state.fetch_goal_override(name)?;
            match override_status.target {
                GoalOverride::Stopped | GoalOverride::Decommissioning => {
                    debug!(task = %name, target = ?override_status.target, "task held back by override");
                }
                GoalOverride::Paused => {
                    if let Some(task) = effective
                        .pod
                        .tasks
                        .iter_mut()
                        .find(|t| berth_spec::service::task_full_name(
                            &effective.pod.name,
                            effective.instance,
                            &t.name,
                        ) == *name)
                    {
                        task.command = self.config.pause_command.clone();
                    }
                    to_launch.push(name.clone());
                }
                GoalOverride::None => to_launch.push(name.clone()),
            }
        }
        effective.tasks_to_launch = to_launch;
        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_plan::{DeploymentPlanManager, StepStatus};
    use berth_proto::Resource;
    use berth_spec::{
        GoalState, OverrideStatus, PodSpec, ResourceSpec, ServiceSpec, TaskSpec,
    };
    use berth_store::RedbPersister;
    use std::sync::Arc;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "svc".to_string(),
            role: "svc-role".to_string(),
            principal: "svc-principal".to_string(),
            pods: vec![PodSpec {
                name: "p0".to_string(),
                count: 2,
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

    fn state() -> StateStore {
        StateStore::new(Arc::new(RedbPersister::open_in_memory().unwrap()))
    }

    fn offer(id: &str, cpus: f64) -> Offer {
        Offer {
            id: id.to_string(),
            agent_id: "a1".to_string(),
            hostname: "host-1".to_string(),
            domain: None,
            attributes: HashMap::new(),
            resources: vec![Resource::unreserved_scalar("cpus", cpus)],
        }
    }

    fn coordinator() -> PlanCoordinator {
        PlanCoordinator::new(vec![Box::new(DeploymentPlanManager::new(&spec(), "cfg"))])
    }

    #[test]
    fn step_starts_on_matching_offer() {
        let state = state();
        let scheduler = PlanScheduler::new(state, SchedulerConfig::default());
        let mut coordinator = coordinator();
        let mut tracker = OfferOutcomeTracker::new();

        let ids = coordinator.candidates();
        let outcome =
            scheduler.resource_offers(&mut coordinator, &ids, &[offer("o1", 3.0)], &mut tracker);

        assert_eq!(outcome.started_steps, ids);
        assert_eq!(outcome.recommendations.len(), 2); // Reserve + Launch
        let step = coordinator.step(&ids[0]).unwrap();
        assert_eq!(step.status, StepStatus::Starting);
        assert_eq!(step.pending_task_ids.len(), 1);
    }

    #[test]
    fn one_offer_feeds_at_most_one_step() {
        let state = state();
        let scheduler = PlanScheduler::new(state, SchedulerConfig::default());
        let mut coordinator = coordinator();
        let mut tracker = OfferOutcomeTracker::new();

        // Serial deployment yields one candidate; even with a huge offer
        // only that step launches this tick.
        let ids = coordinator.candidates();
        assert_eq!(ids.len(), 1);
        let outcome =
            scheduler.resource_offers(&mut coordinator, &ids, &[offer("o1", 64.0)], &mut tracker);

        let launches = outcome
            .recommendations
            .iter()
            .filter(|r| matches!(r, OfferRecommendation::Launch { .. }))
            .count();
        assert_eq!(launches, 1);
    }

    #[test]
    fn unmatched_offer_produces_nothing() {
        let state = state();
        let scheduler = PlanScheduler::new(state, SchedulerConfig::default());
        let mut coordinator = coordinator();
        let mut tracker = OfferOutcomeTracker::new();

        let ids = coordinator.candidates();
        let outcome =
            scheduler.resource_offers(&mut coordinator, &ids, &[offer("o1", 0.25)], &mut tracker);

        assert!(outcome.recommendations.is_empty());
        assert!(outcome.started_steps.is_empty());
        // Step stays eligible for the next tick.
        assert_eq!(coordinator.step(&ids[0]).unwrap().status, StepStatus::Prepared);
    }

    #[test]
    fn stopped_override_holds_task_back() {
        let state = state();
        state
            .store_tasks(&[berth_proto::TaskInfo {
                name: "p0-0-server".to_string(),
                task_id: "t-1".to_string(),
                agent_id: "a1".to_string(),
                command: berth_proto::CommandInfo::default(),
                executor: None,
                resources: vec![],
                labels: HashMap::new(),
            }])
            .unwrap();
        state
            .store_goal_override("p0-0-server", &OverrideStatus::pending(GoalOverride::Stopped))
            .unwrap();

        let scheduler = PlanScheduler::new(state, SchedulerConfig::default());
        let mut coordinator = coordinator();
        let mut tracker = OfferOutcomeTracker::new();

        let ids = coordinator.candidates();
        let outcome =
            scheduler.resource_offers(&mut coordinator, &ids, &[offer("o1", 4.0)], &mut tracker);
        assert!(outcome.recommendations.is_empty());
    }

    #[test]
    fn paused_override_swaps_command() {
        let state = state();
        state
            .store_tasks(&[berth_proto::TaskInfo {
                name: "p0-0-server".to_string(),
                task_id: "t-1".to_string(),
                agent_id: "a1".to_string(),
                command: berth_proto::CommandInfo::default(),
                executor: None,
                resources: vec![],
                labels: HashMap::new(),
            }])
            .unwrap();
        state
            .store_goal_override("p0-0-server", &OverrideStatus::pending(GoalOverride::Paused))
            .unwrap();

        let scheduler = PlanScheduler::new(state.clone(), SchedulerConfig::default());
        let mut coordinator = coordinator();
        let mut tracker = OfferOutcomeTracker::new();

        let ids = coordinator.candidates();
        let outcome =
            scheduler.resource_offers(&mut coordinator, &ids, &[offer("o1", 4.0)], &mut tracker);

        let launched = outcome
            .recommendations
            .iter()
            .find_map(|r| match r {
                OfferRecommendation::Launch { task, .. } => Some(task.clone()),
                _ => None,
            })
            .expect("launch recommendation");
        assert_eq!(launched.command.value, SchedulerConfig::default().pause_command);
    }
}
