//! Recorders — persist a tick's effects before anything reaches the master.
//!
//! The launch recorder writes TaskInfos one at a time, so a crash mid-tick
//! leaves at most one inconsistent record; reconciliation and resource-id
//! reuse repair the rest. The cleanup recorder routes released resource-ids
//! into the active resource-cleanup steps and strips them from stored
//! TaskInfos.

use tracing::{debug, info};

use berth_offer::OfferRecommendation;
use berth_plan::Step;
use berth_proto::Resource;
use berth_store::{StateStore, StoreResult};

use crate::client::OfferResources;

/// Persists launch effects into the StateStore.
pub struct LaunchRecorder<'a> {
    state: &'a StateStore,
}

impl<'a> LaunchRecorder<'a> {
    pub fn new(state: &'a StateStore) -> Self {
        Self { state }
    }

    /// Record every launch in the batch. The evaluator already folded new
    /// reservations and volumes into each launch's TaskInfo, so the
    /// Reserve/CreateVolume recommendations need no writes of their own.
    pub fn record(&self, recommendations: &[OfferRecommendation]) -> StoreResult<()> {
        for rec in recommendations {
            let OfferRecommendation::Launch { task, should_launch: true, .. } = rec else {
                continue;
            };
            // Stale terminal statuses would shadow the fresh incarnation.
            self.state.clear_status(&task.name)?;
            self.state.store_tasks(std::slice::from_ref(task))?;
            info!(task = %task.name, task_id = %task.task_id, "launch recorded");
        }
        Ok(())
    }
}

/// Advances resource-cleanup steps as reservations are released.
pub struct CleanupRecorder;

impl CleanupRecorder {
    /// Route Unreserve/DestroyVolume recommendations into cleanup steps
    /// and drop the released resources from stored TaskInfos.
    pub fn record(
        recommendations: &[OfferRecommendation],
        steps: &mut [&mut Step],
        state: &StateStore,
    ) -> StoreResult<()> {
        let released: Vec<&Resource> = recommendations
            .iter()
            .filter_map(|rec| match rec {
                OfferRecommendation::Unreserve { resource, .. } => Some(resource),
                OfferRecommendation::DestroyVolume { volume, .. } => Some(volume),
                _ => None,
            })
            .collect();
        Self::release(&released, steps, state)
    }

    /// As `record`, for resources surfaced by the unexpected-resources
    /// path rather than evaluation.
    pub fn record_resources(
        unexpected: &[OfferResources],
        steps: &mut [&mut Step],
        state: &StateStore,
    ) -> StoreResult<()> {
        let released: Vec<&Resource> = unexpected
            .iter()
            .flat_map(|o| o.resources.iter())
            .collect();
        Self::release(&released, steps, state)
    }

    fn release(
        released: &[&Resource],
        steps: &mut [&mut Step],
        state: &StateStore,
    ) -> StoreResult<()> {
        for resource in released {
            let Some(resource_id) = resource.resource_id() else {
                continue;
            };
            for step in steps.iter_mut() {
                if step.resource_cleaned(resource_id) {
                    debug!(resource_id, step = %step.name, "cleanup step advanced");
                }
            }
            Self::strip_from_tasks(resource_id, state)?;
        }
        Ok(())
    }

    /// Remove the released resource from whichever TaskInfo held it.
    fn strip_from_tasks(resource_id: &str, state: &StateStore) -> StoreResult<()> {
        for mut task in state.fetch_tasks()? {
            if !task.resources.iter().any(|r| r.resource_id() == Some(resource_id)) {
                continue;
            }
            task.resources.retain(|r| r.resource_id() != Some(resource_id));
            state.store_tasks(std::slice::from_ref(&task))?;
            debug!(resource_id, task = %task.name, "resource stripped from task");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_plan::StepKind;
    use berth_proto::{CommandInfo, TaskInfo, TaskState, TaskStatus};
    use berth_store::RedbPersister;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    fn state() -> StateStore {
        StateStore::new(Arc::new(RedbPersister::open_in_memory().unwrap()))
    }

    fn task(name: &str, task_id: &str, rid: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            task_id: task_id.to_string(),
            agent_id: "a1".to_string(),
            command: CommandInfo::default(),
            executor: None,
            resources: vec![Resource::reserved_scalar("cpus", 1.0, "role", "p", rid)],
            labels: HashMap::new(),
        }
    }

    fn launch_rec(task: TaskInfo, should_launch: bool) -> OfferRecommendation {
        OfferRecommendation::Launch {
            offer_id: "o1".to_string(),
            agent_id: "a1".to_string(),
            task,
            should_launch,
        }
    }

    #[test]
    fn launch_recorded_with_stale_status_cleared() {
        let state = state();
        state.store_tasks(&[task("p0-0-server", "t-1", "rid-1")]).unwrap();
        state
            .store_status("p0-0-server", &TaskStatus::new("t-1", TaskState::Failed))
            .unwrap();

        let relaunched = task("p0-0-server", "t-2", "rid-1");
        LaunchRecorder::new(&state)
            .record(&[launch_rec(relaunched, true)])
            .unwrap();

        let stored = state.fetch_task("p0-0-server").unwrap().unwrap();
        assert_eq!(stored.task_id, "t-2");
        assert!(state.fetch_status("p0-0-server").unwrap().is_none());
    }

    #[test]
    fn transient_launches_not_recorded() {
        let state = state();
        LaunchRecorder::new(&state)
            .record(&[launch_rec(task("p0-0-server", "t-1", "rid-1"), false)])
            .unwrap();
        assert!(state.fetch_task("p0-0-server").unwrap().is_none());
    }

    #[test]
    fn unreserve_advances_steps_and_strips_task() {
        let state = state();
        state.store_tasks(&[task("p1-0-server", "t-1", "rid-1")]).unwrap();

        let mut step = Step::new(
            "unreserve-p1-0",
            Some("p1-0".to_string()),
            StepKind::ResourceCleanup { remaining: BTreeSet::from(["rid-1".to_string()]) },
        );
        let rec = OfferRecommendation::Unreserve {
            offer_id: "o1".to_string(),
            agent_id: "a1".to_string(),
            resource: Resource::reserved_scalar("cpus", 1.0, "role", "p", "rid-1"),
        };

        let mut steps = [&mut step];
        CleanupRecorder::record(&[rec], &mut steps, &state).unwrap();

        assert!(step.is_complete());
        let stored = state.fetch_task("p1-0-server").unwrap().unwrap();
        assert!(stored.resources.is_empty());
    }

    #[test]
    fn unexpected_resources_follow_same_path() {
        let state = state();
        state.store_tasks(&[task("p1-0-server", "t-1", "rid-9")]).unwrap();

        let mut step = Step::new(
            "unreserve-p1-0",
            Some("p1-0".to_string()),
            StepKind::ResourceCleanup { remaining: BTreeSet::from(["rid-9".to_string()]) },
        );
        let unexpected = OfferResources {
            offer_id: "o1".to_string(),
            agent_id: "a1".to_string(),
            resources: vec![Resource::reserved_scalar("cpus", 1.0, "role", "p", "rid-9")],
        };

        let mut steps = [&mut step];
        CleanupRecorder::record_resources(&[unexpected], &mut steps, &state).unwrap();
        assert!(step.is_complete());
    }
}
