//! The deploy-mode service scheduler.
//!
//! Wires the stores, plan coordinator, plan scheduler, and recorders for
//! normal operation, and implements the event-client contract the offer
//! processor drives. Construction reconciles the declared spec against the
//! stored target configuration: a changed identity hash stores a new
//! version, repoints the target, and generates a fresh deployment plan; a
//! shrunken pod adds a decommission plan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use berth_offer::{OfferOutcomeTracker, PodInstanceRequirement};
use berth_plan::{
    DecommissionPlanManager, DeploymentPlanManager, PlanCoordinator, PlanManager,
    RecoveryPlanManager, StepKind, StepStatus, DEPLOY_PLAN,
};
use berth_proto::{labels, MasterDriver, Offer, TaskInfo, TaskState, TaskStatus};
use berth_spec::{
    GoalOverride, GoalState, OverrideProgress, OverrideStatus, ServiceSpec,
};
use berth_store::{ConfigStore, Persister, StateStore, StoreError};

use crate::client::{EventClient, OfferResources, OfferResponse, UnexpectedResourcesResponse};
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::plan_scheduler::{PlanScheduler, TickOutcome};
use crate::recorder::{CleanupRecorder, LaunchRecorder};
use crate::uninstall::{SecretsClient, UninstallScheduler};

/// Property key for the last IP addresses reported for a task.
const TASK_IP_PROPERTY: &str = "task_ip";

pub struct DeployScheduler {
    spec: ServiceSpec,
    config: SchedulerConfig,
    driver: Arc<dyn MasterDriver>,
    persister: Arc<dyn Persister>,
    state: StateStore,
    configs: ConfigStore,
    target_config: String,
    coordinator: PlanCoordinator,
    plan_scheduler: PlanScheduler,
    outcome_tracker: OfferOutcomeTracker,
    decommission_tasks: Vec<String>,
    secrets: Option<Arc<dyn SecretsClient>>,
}

impl DeployScheduler {
    pub fn new(
        spec: ServiceSpec,
        config: SchedulerConfig,
        driver: Arc<dyn MasterDriver>,
        persister: Arc<dyn Persister>,
        secrets: Option<Arc<dyn SecretsClient>>,
    ) -> SchedulerResult<Self> {
        let state = StateStore::new(Arc::clone(&persister));
        let configs = ConfigStore::new(Arc::clone(&persister));

        let target_config = reconcile_target_config(&spec, &configs, &state)?;

        // Tasks beyond the target spec are decommissioned.
        let stored = state.fetch_tasks()?;
        let wanted: HashSet<String> = spec.task_names().into_iter().collect();
        let departing: Vec<TaskInfo> = stored
            .iter()
            .filter(|t| !wanted.contains(&t.name))
            .cloned()
            .collect();
        for task in &departing {
            mark_decommissioning(&state, &task.name)?;
        }

        let mut managers: Vec<Box<dyn PlanManager>> = Vec::new();
        let deploy_manager = match spec.plans.iter().find(|p| p.name == DEPLOY_PLAN) {
            Some(plan_spec) => {
                DeploymentPlanManager::from_plan_spec(&spec, plan_spec, &target_config)
            }
            None => DeploymentPlanManager::new(&spec, &target_config),
        };
        managers.push(Box::new(deploy_manager));
        managers.push(Box::new(RecoveryPlanManager::new(spec.clone(), &target_config)));

        let mut decommission_tasks = Vec::new();
        if let Some(manager) = DecommissionPlanManager::new(&departing) {
            decommission_tasks = manager.tasks_to_decommission().to_vec();
            managers.push(Box::new(manager));
        }
        for plan_spec in spec.plans.iter().filter(|p| p.name != DEPLOY_PLAN) {
            managers.push(Box::new(DeploymentPlanManager::from_plan_spec(
                &spec,
                plan_spec,
                &target_config,
            )));
        }

        let mut coordinator = PlanCoordinator::new(managers);
        mark_deployed_steps(&mut coordinator, &state, &target_config)?;

        let plan_scheduler = PlanScheduler::new(state.clone(), config.clone());

        info!(service = %spec.name, target = %target_config, "deploy scheduler assembled");
        Ok(Self {
            spec,
            config,
            driver,
            persister,
            state,
            configs,
            target_config,
            coordinator,
            plan_scheduler,
            outcome_tracker: OfferOutcomeTracker::new(),
            decommission_tasks,
            secrets,
        })
    }

    pub fn plans(&self) -> Vec<&berth_plan::Plan> {
        self.coordinator.plans()
    }

    pub fn outcome_tracker(&self) -> &OfferOutcomeTracker {
        &self.outcome_tracker
    }

    pub fn target_config(&self) -> &str {
        &self.target_config
    }

    /// Hand off to uninstall mode in-process, sharing the same stores.
    /// The uninstall plan's first step persists the uninstall bit, so a
    /// restart mid-uninstall re-enters uninstall mode at bootstrap.
    pub fn to_uninstall_scheduler(&self) -> SchedulerResult<UninstallScheduler> {
        UninstallScheduler::new(
            self.spec.clone(),
            self.config.clone(),
            Arc::clone(&self.driver),
            Arc::clone(&self.persister),
            self.secrets.clone(),
        )
    }

    /// Kill/erase side work for candidate steps that need no offers.
    fn execute_side_steps(&mut self, candidate_ids: &[String]) {
        let driver = Arc::clone(&self.driver);
        for id in candidate_ids {
            let Some(step) = self.coordinator.step_mut(id) else {
                continue;
            };
            match &step.kind {
                StepKind::KillTasks { task_ids } => {
                    if step.status == StepStatus::Pending {
                        let ids = task_ids.clone();
                        for task_id in &ids {
                            driver.kill_task(task_id);
                        }
                        step.set_starting(ids);
                    }
                }
                StepKind::ResourceCleanup { .. } => {
                    step.start();
                }
                StepKind::EraseTask { task_name } => {
                    let name = task_name.clone();
                    match self.state.clear_task(&name) {
                        Ok(()) => {
                            if let Some(step) = self.coordinator.step_mut(id) {
                                step.set_complete();
                            }
                        }
                        Err(e) => warn!(task = %name, error = %e, "erase deferred"),
                    }
                }
                _ => {}
            }
        }
    }

    /// Persist the tick's effects; on failure the recommendations are
    /// abandoned and the started steps revert so the next tick retries.
    fn record_tick(&mut self, outcome: &TickOutcome) -> Result<(), StoreError> {
        LaunchRecorder::new(&self.state).record(&outcome.recommendations)?;
        let mut steps = self.coordinator.resource_cleanup_steps_mut();
        CleanupRecorder::record(&outcome.recommendations, &mut steps, &self.state)
    }

    fn revert_started_steps(&mut self, outcome: &TickOutcome) {
        for id in &outcome.started_steps {
            if let Some(step) = self.coordinator.step_mut(id) {
                if step.status == StepStatus::Starting {
                    step.pending_task_ids.clear();
                    step.status = StepStatus::Pending;
                }
            }
        }
    }

    /// Advance the goal-override state machine from a status.
    fn advance_override(&self, name: &str, status: &TaskStatus) {
        let Ok(current) = self.state.fetch_goal_override(name) else {
            return;
        };
        let next = match (current.progress, status.state) {
            // The kill that lets the override take effect was processed.
            (OverrideProgress::Pending, state) if state.is_terminal() => OverrideStatus {
                target: current.target,
                progress: OverrideProgress::InProgress,
            },
            // Relaunched under the override.
            (OverrideProgress::InProgress, TaskState::Running) => OverrideStatus {
                target: current.target,
                progress: OverrideProgress::Complete,
            },
            _ => return,
        };
        if let Err(e) = self.state.store_goal_override(name, &next) {
            warn!(task = name, error = %e, "override progress not advanced");
        }
    }

    /// Mark a failed task permanently failed when its reason says so.
    /// Returns the refreshed TaskInfo.
    fn mark_permanent_failure(
        &self,
        task: TaskInfo,
        status: &TaskStatus,
    ) -> Result<TaskInfo, StoreError> {
        if !status.state.is_failed() {
            return Ok(task);
        }
        let permanent = status
            .reason
            .as_deref()
            .is_some_and(|r| self.config.is_permanent_failure_reason(r));
        if !permanent || task.labels.contains_key(labels::PERMANENTLY_FAILED) {
            return Ok(task);
        }
        let mut updated = task;
        updated
            .labels
            .insert(labels::PERMANENTLY_FAILED.to_string(), "true".to_string());
        self.state.store_tasks(std::slice::from_ref(&updated))?;
        warn!(task = %updated.name, reason = ?status.reason, "task marked permanently failed");
        Ok(updated)
    }
}

impl EventClient for DeployScheduler {
    fn registered(&mut self, reregistration: bool) {
        if reregistration {
            info!(service = %self.spec.name, "re-registered with master");
            return;
        }
        info!(service = %self.spec.name, "registered with master");

        // Active names: everything the plans can launch, plus tasks being
        // decommissioned (their statuses must keep flowing until teardown).
        let mut active: HashSet<String> = self
            .coordinator
            .plans()
            .iter()
            .flat_map(|p| p.steps())
            .filter_map(|s| match &s.kind {
                StepKind::Launch { requirement, .. } => Some(requirement.task_names()),
                _ => None,
            })
            .flatten()
            .collect();
        active.extend(self.decommission_tasks.iter().cloned());

        let stored = match self.state.fetch_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "could not load tasks at registration");
                return;
            }
        };

        for task in &stored {
            if active.contains(&task.name) || task.is_reservation_only() {
                continue;
            }
            // Null the task-id first so future statuses for the old id are
            // dropped, then kill the real task. One task at a time bounds
            // crash damage.
            let old_id = task.task_id.clone();
            let mut cleaned = task.clone();
            cleaned.task_id = String::new();
            let wiped = self
                .state
                .clear_task(&task.name)
                .and_then(|()| self.state.store_tasks(std::slice::from_ref(&cleaned)));
            match wiped {
                Ok(()) => {
                    info!(task = %task.name, task_id = %old_id, "unneeded task killed");
                    self.driver.kill_task(&old_id);
                }
                Err(e) => warn!(task = %task.name, error = %e, "could not clean unneeded task"),
            }
        }

        // Overrides requested but not yet acted on need their kill.
        let stored = match self.state.fetch_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "could not reload tasks for override kills");
                return;
            }
        };
        for task in &stored {
            if task.is_reservation_only() {
                continue;
            }
            match self.state.fetch_goal_override(&task.name) {
                Ok(status) if status.progress == OverrideProgress::Pending => {
                    info!(task = %task.name, target = ?status.target, "killing task for pending override");
                    self.driver.kill_task(&task.task_id);
                }
                Ok(_) => {}
                Err(e) => warn!(task = %task.name, error = %e, "override lookup failed"),
            }
        }
    }

    fn offers(&mut self, offers: &[Offer]) -> OfferResponse {
        let candidates = self.coordinator.candidates();
        self.execute_side_steps(&candidates);

        let outcome = self.plan_scheduler.resource_offers(
            &mut self.coordinator,
            &candidates,
            offers,
            &mut self.outcome_tracker,
        );
        info!(
            offers = offers.len(),
            recommendations = outcome.recommendations.len(),
            service = %self.spec.name,
            "offers processed"
        );

        match self.record_tick(&outcome) {
            Ok(()) => OfferResponse::Processed { recommendations: outcome.recommendations },
            Err(e) => {
                error!(error = %e, "failed to record offer operations, abandoning tick");
                self.revert_started_steps(&outcome);
                OfferResponse::Processed { recommendations: Vec::new() }
            }
        }
    }

    fn unexpected_resources(&mut self, unused: &[Offer]) -> UnexpectedResourcesResponse {
        // Resource-ids to keep: those of tasks neither permanently failed
        // nor being decommissioned.
        let keep: HashSet<String> = match self.state.fetch_tasks() {
            Ok(tasks) => tasks
                .iter()
                .filter(|t| !t.labels.contains_key(labels::PERMANENTLY_FAILED))
                .filter(|t| {
                    self.state
                        .fetch_goal_override(&t.name)
                        .map(|o| o.target != GoalOverride::Decommissioning)
                        .unwrap_or(true)
                })
                .flat_map(|t| t.resource_ids())
                .collect(),
            Err(e) => {
                error!(error = %e, "could not compute expected resources");
                return UnexpectedResourcesResponse::Failed;
            }
        };

        let mut unexpected = Vec::new();
        for offer in unused {
            let resources: Vec<_> = offer
                .resources
                .iter()
                .filter(|r| r.is_reserved())
                .filter(|r| r.resource_id().is_none_or(|id| !keep.contains(id)))
                .cloned()
                .collect();
            if !resources.is_empty() {
                debug!(offer = %offer.id, count = resources.len(), "unexpected resources found");
                unexpected.push(OfferResources {
                    offer_id: offer.id.clone(),
                    agent_id: offer.agent_id.clone(),
                    resources,
                });
            }
        }

        // Cleanup bookkeeping must land before the unreserves go out; on
        // failure hold the resources back and retry on a later pass.
        let mut steps = self.coordinator.resource_cleanup_steps_mut();
        if let Err(e) = CleanupRecorder::record_resources(&unexpected, &mut steps, &self.state) {
            error!(error = %e, "failed to record unexpected resources");
            return UnexpectedResourcesResponse::Failed;
        }
        UnexpectedResourcesResponse::Processed { unexpected }
    }

    fn status(&mut self, status: &TaskStatus) {
        let name = match self.state.task_name_for_status(status) {
            Ok(name) => name,
            Err(e) => {
                warn!(task_id = %status.task_id, error = %e, "dropping status for unknown task");
                return;
            }
        };
        let Ok(Some(task)) = self.state.fetch_task(&name) else {
            warn!(task = %name, "dropping status, task info unavailable");
            return;
        };

        let task = match self.mark_permanent_failure(task, status) {
            Ok(task) => task,
            Err(e) => {
                warn!(task = %name, error = %e, "permanent-failure marking deferred");
                return;
            }
        };

        if let Err(e) = self.state.store_status(&name, status) {
            warn!(task = %name, error = %e, "dropping invalid status update");
            return;
        }

        self.advance_override(&name, status);

        // Track the task's address whenever the master reports one.
        if let Some(container) = &status.container {
            if !container.ip_addresses.is_empty() {
                let joined = container.ip_addresses.join(",");
                if let Err(e) = self.state.store_property(&name, TASK_IP_PROPERTY, joined.as_bytes())
                {
                    warn!(task = %name, error = %e, "could not store task ip");
                }
            }
        }

        self.coordinator.update(&task, status);

        // Old configs may have lost their last reference.
        if status.state.is_terminal() {
            if let Ok(tasks) = self.state.fetch_tasks() {
                let referenced: HashSet<String> = tasks
                    .iter()
                    .filter_map(|t| t.labels.get(labels::CONFIG_ID).cloned())
                    .collect();
                if let Err(e) = self.configs.prune(&referenced) {
                    debug!(error = %e, "config prune skipped");
                }
            }
        }
    }

    fn unregistered(&mut self) {
        // Only the uninstall flow deregisters; reaching this in deploy
        // mode is a driver-side fault.
        error!("unexpected unregistered() in deploy mode");
    }
}

/// Store/repoint the target config to match the declared spec.
fn reconcile_target_config(
    spec: &ServiceSpec,
    configs: &ConfigStore,
    state: &StateStore,
) -> SchedulerResult<String> {
    match configs.target() {
        Ok(target_id) => {
            let stored = configs.fetch(&target_id)?;
            if stored.identity_hash() == spec.identity_hash() {
                return Ok(target_id);
            }
            let new_id = configs.store(spec)?;
            configs.set_target(&new_id)?;
            info!(old = %target_id, new = %new_id, "target configuration updated");

            let referenced: HashSet<String> = state
                .fetch_tasks()?
                .iter()
                .filter_map(|t| t.labels.get(labels::CONFIG_ID).cloned())
                .collect();
            configs.prune(&referenced)?;
            Ok(new_id)
        }
        Err(StoreError::NotFound(_)) => {
            let id = configs.store(spec)?;
            configs.set_target(&id)?;
            info!(config = %id, "initial target configuration stored");
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

/// Steps whose tasks already run at the target config start out Complete.
fn mark_deployed_steps(
    coordinator: &mut PlanCoordinator,
    state: &StateStore,
    target: &str,
) -> SchedulerResult<()> {
    let stored: HashMap<String, TaskInfo> = state
        .fetch_tasks()?
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect();

    let mut deployed_ids = Vec::new();
    for plan in coordinator.plans() {
        for step in plan.steps() {
            let StepKind::Launch { requirement, .. } = &step.kind else {
                continue;
            };
            if step_already_deployed(requirement, &stored, state, target)? {
                deployed_ids.push(step.id.clone());
            }
        }
    }
    for id in &deployed_ids {
        if let Some(step) = coordinator.step_mut(id) {
            debug!(step = %step.name, "already at target configuration");
            step.set_complete();
        }
    }
    Ok(())
}

fn step_already_deployed(
    requirement: &PodInstanceRequirement,
    stored: &HashMap<String, TaskInfo>,
    state: &StateStore,
    target: &str,
) -> SchedulerResult<bool> {
    for name in &requirement.tasks_to_launch {
        let Some(task) = stored.get(name) else {
            return Ok(false);
        };
        if task.labels.get(labels::CONFIG_ID).map(String::as_str) != Some(target) {
            return Ok(false);
        }
        let Some(status) = state.fetch_status(name)? else {
            return Ok(false);
        };
        let satisfied = match requirement.goal_for(name) {
            Some(GoalState::Once) => status.state == TaskState::Finished,
            _ => status.state == TaskState::Running,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Flag a departing task's goal override as Decommissioning.
fn mark_decommissioning(state: &StateStore, name: &str) -> SchedulerResult<()> {
    let current = state.fetch_goal_override(name)?;
    if current.target == GoalOverride::Decommissioning {
        return Ok(());
    }
    let pending = OverrideStatus::pending(GoalOverride::Decommissioning);
    if current.allows(&pending) {
        state.store_goal_override(name, &pending)?;
    } else {
        warn!(task = name, "override busy, decommission marker deferred");
    }
    Ok(())
}
