//! ImplicitReconciler — periodic task reconciliation with the master.
//!
//! After each (re-)registration the scheduler cannot trust its own view of
//! task states until the master has confirmed them. The reconciler asks
//! the master to re-send status for every known task, backing off
//! exponentially, and stops once every task has been heard from.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use berth_proto::{MasterDriver, TaskStatus};
use berth_store::StateStore;

use crate::config::SchedulerConfig;

struct ReconcileState {
    /// Task-ids we have not heard from since the last registration.
    pending: HashSet<String>,
    /// Statuses to replay in explicit reconcile requests.
    statuses: Vec<TaskStatus>,
    /// Generation counter; a re-registration invalidates older loops.
    generation: u64,
}

#[derive(Clone)]
pub struct ImplicitReconciler {
    driver: Arc<dyn MasterDriver>,
    state_store: StateStore,
    config: SchedulerConfig,
    state: Arc<Mutex<ReconcileState>>,
}

impl ImplicitReconciler {
    pub fn new(
        driver: Arc<dyn MasterDriver>,
        state_store: StateStore,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            driver,
            state_store,
            config,
            state: Arc::new(Mutex::new(ReconcileState {
                pending: HashSet::new(),
                statuses: Vec::new(),
                generation: 0,
            })),
        }
    }

    /// Seed the pending set from stored statuses and kick off the backoff
    /// loop (or leave driving to `reconcile_now` when threading is off).
    pub fn start(&self) {
        let statuses = self.state_store.fetch_statuses().unwrap_or_default();
        let generation;
        {
            let mut state = lock(&self.state);
            state.pending = statuses
                .iter()
                .filter(|s| !s.task_id.is_empty())
                .map(|s| s.task_id.clone())
                .collect();
            state.statuses = statuses;
            state.generation += 1;
            generation = state.generation;
            info!(tasks = state.pending.len(), "reconciliation started");
        }

        if !self.config.multithreaded {
            self.reconcile_now();
            return;
        }

        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(reconciler.config.reconcile_base_secs.max(1));
            let max = Duration::from_secs(reconciler.config.reconcile_max_secs.max(1));
            loop {
                if !reconciler.reconcile_pass(generation) {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max);
            }
        });
    }

    /// One reconcile pass; used directly when threading is disabled.
    pub fn reconcile_now(&self) {
        let generation = lock(&self.state).generation;
        self.reconcile_pass(generation);
    }

    /// A task's status was received; it no longer needs reconfirmation.
    pub fn status_received(&self, task_id: &str) {
        let mut state = lock(&self.state);
        if state.pending.remove(task_id) {
            debug!(task_id, remaining = state.pending.len(), "task reconciled");
        }
    }

    /// Whether any task still awaits reconfirmation.
    pub fn is_reconciling(&self) -> bool {
        !lock(&self.state).pending.is_empty()
    }

    /// Issue reconcile requests for the still-pending tasks. Returns
    /// false once this loop should stop.
    fn reconcile_pass(&self, generation: u64) -> bool {
        let explicit: Vec<TaskStatus> = {
            let state = lock(&self.state);
            if state.generation != generation || state.pending.is_empty() {
                return false;
            }
            state
                .statuses
                .iter()
                .filter(|s| state.pending.contains(&s.task_id))
                .cloned()
                .collect()
        };

        debug!(tasks = explicit.len(), "reconcile pass");
        // Explicit pass for what we know; implicit pass so the master
        // also replays anything we have forgotten entirely.
        self.driver.reconcile_tasks(&explicit);
        self.driver.reconcile_tasks(&[]);
        true
    }
}

fn lock(state: &Mutex<ReconcileState>) -> MutexGuard<'_, ReconcileState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
