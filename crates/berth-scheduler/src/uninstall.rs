//! The uninstall-mode service scheduler.
//!
//! Exposes a single plan that releases everything the service holds, in
//! order: persist the uninstall bit, kill every task, unreserve resources
//! and destroy volumes as their offers arrive, delete TLS secrets, delete
//! the service's task/config state, and finally deregister. Once the plan
//! completes, `offers()` answers `Uninstalled`, which makes the offer
//! processor stop the driver and wipe the remaining persisted state.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use berth_offer::OfferRecommendation;
use berth_plan::{Phase, Plan, Step, StepKind, StepStatus, Strategy, UNINSTALL_PLAN};
use berth_proto::{MasterDriver, Offer, TaskStatus};
use berth_spec::ServiceSpec;
use berth_store::{paths, FrameworkStore, Persister, StateStore};

use crate::client::{EventClient, OfferResponse, UnexpectedResourcesResponse};
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::recorder::CleanupRecorder;

/// TLS/secrets subsystem contract; supplied by the embedding process.
pub trait SecretsClient: Send + Sync {
    /// Delete every secret stored for the named service.
    fn delete_all(&self, service: &str) -> Result<(), String>;
}

pub struct UninstallScheduler {
    spec: ServiceSpec,
    driver: Arc<dyn MasterDriver>,
    persister: Arc<dyn Persister>,
    state: StateStore,
    frameworks: FrameworkStore,
    secrets: Option<Arc<dyn SecretsClient>>,
    plan: Plan,
}

impl UninstallScheduler {
    pub fn new(
        spec: ServiceSpec,
        _config: SchedulerConfig,
        driver: Arc<dyn MasterDriver>,
        persister: Arc<dyn Persister>,
        secrets: Option<Arc<dyn SecretsClient>>,
    ) -> SchedulerResult<Self> {
        let state = StateStore::new(Arc::clone(&persister));
        let frameworks = FrameworkStore::new(Arc::clone(&persister));
        let plan = build_uninstall_plan(&state, secrets.is_some())?;
        info!(service = %spec.name, phases = plan.phases.len(), "uninstall plan generated");
        Ok(Self { spec, driver, persister, state, frameworks, secrets, plan })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Run eligible side-effect steps, following completions through the
    /// serial plan so one pass advances as far as it can. Steps parked in
    /// Waiting (a secrets client that was down) get re-driven too.
    fn execute_steps(&mut self) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            let mut ids = self.plan.candidate_ids();
            ids.extend(
                self.plan
                    .steps()
                    .filter(|s| s.status == StepStatus::Waiting)
                    .map(|s| s.id.clone()),
            );
            for id in ids {
                if self.execute_step(&id) {
                    progressed = true;
                }
            }
        }
    }

    /// Returns true when the step completed (unblocking its successor).
    fn execute_step(&mut self, id: &str) -> bool {
        let driver = Arc::clone(&self.driver);
        {
            let Some(step) = self.plan.step_mut(id) else {
                return false;
            };
            match &step.kind {
                StepKind::SetUninstallFlag => match self.state.set_uninstalling() {
                    Ok(()) => step.set_complete(),
                    Err(e) => warn!(error = %e, "uninstall flag write deferred"),
                },
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
                StepKind::DeleteSecrets => {
                    let service = self.spec.name.clone();
                    match &self.secrets {
                        Some(client) => match client.delete_all(&service) {
                            Ok(()) => {
                                info!(service = %service, "tls secrets deleted");
                                step.set_complete();
                            }
                            Err(e) => {
                                warn!(error = %e, "secrets deletion blocked, will retry");
                                step.set_waiting();
                            }
                        },
                        None => step.set_complete(),
                    }
                }
                StepKind::DeleteState => {
                    // Task and config subtrees go now; the uninstall bit
                    // and framework id survive until final teardown so a
                    // crash here still re-enters uninstall mode.
                    let wiped = self
                        .persister
                        .recursive_delete(paths::TASKS)
                        .and_then(|_| self.persister.recursive_delete(&paths::configurations()));
                    match wiped {
                        Ok(_) => {
                            info!("service state deleted");
                            step.set_complete();
                        }
                        Err(e) => warn!(error = %e, "state deletion deferred"),
                    }
                }
                StepKind::DeregisterFramework => match self.frameworks.clear_framework_id() {
                    Ok(()) => {
                        info!("framework deregistered");
                        step.set_complete();
                    }
                    Err(e) => warn!(error = %e, "deregistration deferred"),
                },
                StepKind::Launch { .. } | StepKind::EraseTask { .. } => {}
            }
        }
        self.plan
            .step(id)
            .is_some_and(|s| s.is_complete())
    }
}

impl EventClient for UninstallScheduler {
    fn registered(&mut self, reregistration: bool) {
        info!(reregistration, "uninstall scheduler registered with master");
    }

    fn offers(&mut self, offers: &[Offer]) -> OfferResponse {
        self.execute_steps();

        if self.plan.is_complete() {
            info!(service = %self.spec.name, "uninstall plan complete");
            return OfferResponse::Uninstalled;
        }

        // Unreserve/destroy whatever reserved resources of ours show up.
        let mut recommendations = Vec::new();
        for offer in offers {
            for resource in offer.resources.iter().filter(|r| r.resource_id().is_some()) {
                if resource.disk.as_ref().is_some_and(|d| d.persistence_id.is_some()) {
                    recommendations.push(OfferRecommendation::DestroyVolume {
                        offer_id: offer.id.clone(),
                        agent_id: offer.agent_id.clone(),
                        volume: resource.clone(),
                    });
                    // The disk reservation itself is released as well.
                    let mut bare = resource.clone();
                    bare.disk = None;
                    recommendations.push(OfferRecommendation::Unreserve {
                        offer_id: offer.id.clone(),
                        agent_id: offer.agent_id.clone(),
                        resource: bare,
                    });
                } else {
                    recommendations.push(OfferRecommendation::Unreserve {
                        offer_id: offer.id.clone(),
                        agent_id: offer.agent_id.clone(),
                        resource: resource.clone(),
                    });
                }
            }
        }

        let mut steps: Vec<&mut Step> = self
            .plan
            .steps_mut()
            .filter(|s| matches!(s.kind, StepKind::ResourceCleanup { .. }))
            .collect();
        if let Err(e) = CleanupRecorder::record(&recommendations, &mut steps, &self.state) {
            error!(error = %e, "failed to record resource cleanup, holding back unreserves");
            return OfferResponse::NotReady { recommendations: Vec::new() };
        }

        // Unrelated offers decline long; freed resources come back as
        // fresh offers once the kills land.
        OfferResponse::Processed { recommendations }
    }

    fn unexpected_resources(&mut self, _unused: &[Offer]) -> UnexpectedResourcesResponse {
        // Everything reserved is torn down through offers(); there is no
        // separate expected set during uninstall.
        UnexpectedResourcesResponse::Processed { unexpected: Vec::new() }
    }

    fn status(&mut self, status: &TaskStatus) {
        match self.state.task_name_for_status(status) {
            Ok(name) => {
                if let Err(e) = self.state.store_status(&name, status) {
                    warn!(task = %name, error = %e, "dropping status during uninstall");
                    return;
                }
                for step in self.plan.steps_mut() {
                    step.update_status(&name, status);
                }
            }
            Err(e) => {
                warn!(task_id = %status.task_id, error = %e, "dropping status for unknown task");
            }
        }
    }

    fn unregistered(&mut self) {
        info!(service = %self.spec.name, "service uninstalled");
    }
}

/// Assemble the ordered teardown plan from current state.
fn build_uninstall_plan(state: &StateStore, has_secrets: bool) -> SchedulerResult<Plan> {
    let tasks = state.fetch_tasks()?;

    let task_ids: Vec<String> = tasks
        .iter()
        .filter(|t| !t.is_reservation_only())
        .map(|t| t.task_id.clone())
        .collect();

    let mut reservation_ids: BTreeSet<String> = BTreeSet::new();
    let mut volume_ids: BTreeSet<String> = BTreeSet::new();
    for task in &tasks {
        for resource in &task.resources {
            let Some(rid) = resource.resource_id() else { continue };
            if resource.disk.as_ref().is_some_and(|d| d.persistence_id.is_some()) {
                volume_ids.insert(rid.to_string());
            } else {
                reservation_ids.insert(rid.to_string());
            }
        }
    }

    let mut phases = vec![Phase::new(
        "flag",
        Strategy::Serial,
        vec![Step::new("set-uninstall-flag", None, StepKind::SetUninstallFlag)],
    )];
    if !task_ids.is_empty() {
        phases.push(Phase::new(
            "kill",
            Strategy::Serial,
            vec![Step::new("kill-all-tasks", None, StepKind::KillTasks { task_ids })],
        ));
    }
    if !reservation_ids.is_empty() {
        phases.push(Phase::new(
            "unreserve",
            Strategy::Serial,
            vec![Step::new(
                "unreserve-resources",
                None,
                StepKind::ResourceCleanup { remaining: reservation_ids },
            )],
        ));
    }
    if !volume_ids.is_empty() {
        phases.push(Phase::new(
            "volumes",
            Strategy::Serial,
            vec![Step::new(
                "destroy-volumes",
                None,
                StepKind::ResourceCleanup { remaining: volume_ids },
            )],
        ));
    }
    if has_secrets {
        phases.push(Phase::new(
            "tls",
            Strategy::Serial,
            vec![Step::new("delete-secrets", None, StepKind::DeleteSecrets)],
        ));
    }
    phases.push(Phase::new(
        "cleanup",
        Strategy::Serial,
        vec![Step::new("delete-state", None, StepKind::DeleteState)],
    ));
    phases.push(Phase::new(
        "deregister",
        Strategy::Serial,
        vec![Step::new("deregister-framework", None, StepKind::DeregisterFramework)],
    ));

    Ok(Plan::new(UNINSTALL_PLAN, Strategy::Serial, phases))
}
