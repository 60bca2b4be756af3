//! The outbound driver contract, and a recording double for tests.
//!
//! The scheduler core never talks to the master directly; it calls through
//! [`MasterDriver`], implemented by the embedding process on top of its RPC
//! library. Calls are best-effort: the master acknowledges asynchronously
//! through status updates and fresh offers, so the contract has no return
//! values.

use std::sync::Mutex;

use crate::offer::Domain;
use crate::op::{Filters, Operation};
use crate::task::TaskStatus;
use crate::{OfferId, TaskId};

/// Master metadata delivered with (re-)registration callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterInfo {
    pub hostname: String,
    /// Fault domain of the master, when the cluster reports one.
    pub domain: Option<Domain>,
}

/// Outbound calls the scheduler core makes against the master.
pub trait MasterDriver: Send + Sync {
    /// Accept offers, applying the given operations to their resources.
    fn accept_offers(&self, offer_ids: &[OfferId], operations: &[Operation], filters: &Filters);

    /// Decline a single offer for the filter's refuse duration.
    fn decline_offer(&self, offer_id: &OfferId, filters: &Filters);

    /// Ask the master to kill a task.
    fn kill_task(&self, task_id: &TaskId);

    /// Ask the master to re-send status for the given tasks; an empty list
    /// requests implicit reconciliation of every known task.
    fn reconcile_tasks(&self, statuses: &[TaskStatus]);

    /// Stop the driver. `failover = false` tears the framework down.
    fn stop(&self, failover: bool);
}

// ── Recording double ──────────────────────────────────────────────

/// One recorded driver call, in the order issued.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Accept {
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        refuse_seconds: f64,
    },
    Decline {
        offer_id: OfferId,
        refuse_seconds: f64,
    },
    Kill {
        task_id: TaskId,
    },
    Reconcile {
        statuses: Vec<TaskStatus>,
    },
    Stop {
        failover: bool,
    },
}

/// A [`MasterDriver`] that records every call for later inspection. Used by
/// the test suites and by embedders running the core against a simulated
/// master.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all calls issued so far, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().clone()
    }

    /// Drop all recorded calls.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Offer-ids of every Accept call issued so far.
    pub fn accepted_offer_ids(&self) -> Vec<OfferId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Accept { offer_ids, .. } => Some(offer_ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Task-ids of every Kill call issued so far.
    pub fn killed_task_ids(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Kill { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: DriverCall) {
        self.lock().push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DriverCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MasterDriver for RecordingDriver {
    fn accept_offers(&self, offer_ids: &[OfferId], operations: &[Operation], filters: &Filters) {
        self.push(DriverCall::Accept {
            offer_ids: offer_ids.to_vec(),
            operations: operations.to_vec(),
            refuse_seconds: filters.refuse_seconds,
        });
    }

    fn decline_offer(&self, offer_id: &OfferId, filters: &Filters) {
        self.push(DriverCall::Decline {
            offer_id: offer_id.clone(),
            refuse_seconds: filters.refuse_seconds,
        });
    }

    fn kill_task(&self, task_id: &TaskId) {
        self.push(DriverCall::Kill { task_id: task_id.clone() });
    }

    fn reconcile_tasks(&self, statuses: &[TaskStatus]) {
        self.push(DriverCall::Reconcile { statuses: statuses.to_vec() });
    }

    fn stop(&self, failover: bool) {
        self.push(DriverCall::Stop { failover });
    }
}
