//! FrameworkScheduler — the master-facing callback adapter.
//!
//! One of these exists per scheduler process. It is invoked on the driver's
//! thread and must return quickly: offers are filtered and queued into the
//! offer processor, statuses take the event-client mutex, and everything
//! heavy happens on the processor's worker. Master disconnects and driver
//! errors are fatal by design; the supervisor restarts the process and the
//! scheduler resumes from persistent state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use berth_proto::{
    Filters, FrameworkId, MasterDriver, MasterInfo, Offer, OfferId, Resource, TaskStatus,
};
use berth_store::FrameworkStore;

use crate::client::EventClient;
use crate::exit::{exit, ExitCode};
use crate::processor::{decline_all, OfferProcessor};
use crate::reconciler::ImplicitReconciler;

pub struct FrameworkScheduler {
    /// Roles our reservations may carry; dynamic reservations outside this
    /// set are scrubbed from offers before processing.
    role_whitelist: HashSet<String>,
    framework_store: FrameworkStore,
    client: Arc<Mutex<dyn EventClient>>,
    processor: OfferProcessor,
    reconciler: ImplicitReconciler,
    driver: Arc<dyn MasterDriver>,
    /// The master may call `registered` again on re-election; initialization
    /// must run only once or the queues would wedge.
    register_called: AtomicBool,
    /// Offers decline short until the API server is up, since launching
    /// tasks needs the artifact endpoints it serves.
    api_server_started: AtomicBool,
}

impl FrameworkScheduler {
    pub fn new(
        role_whitelist: HashSet<String>,
        framework_store: FrameworkStore,
        client: Arc<Mutex<dyn EventClient>>,
        processor: OfferProcessor,
        reconciler: ImplicitReconciler,
        driver: Arc<dyn MasterDriver>,
    ) -> Self {
        Self {
            role_whitelist,
            framework_store,
            client,
            processor,
            reconciler,
            driver,
            register_called: AtomicBool::new(false),
            api_server_started: AtomicBool::new(false),
        }
    }

    /// Notify that the API server is serving; offers flow from here on.
    pub fn set_api_server_started(&self) {
        self.api_server_started.store(true, Ordering::SeqCst);
    }

    // ── Master callbacks ───────────────────────────────────────────

    pub fn registered(&self, framework_id: &FrameworkId, master_info: &MasterInfo) {
        if self.register_called.swap(true, Ordering::SeqCst) {
            // Master re-election.
            info!("already registered, treating as re-registration");
            self.reregistered(master_info);
            return;
        }
        info!(framework_id = %framework_id, master = %master_info.hostname, "registered with master");

        if let Err(e) = self.framework_store.store_framework_id(framework_id) {
            exit(
                ExitCode::RegistrationFailure,
                &format!("unable to store framework id {framework_id}: {e}"),
            );
        }

        lock_client(&self.client).registered(false);
        self.processor.start();
        self.reconciler.start();
    }

    pub fn reregistered(&self, master_info: &MasterInfo) {
        info!(master = %master_info.hostname, "re-registered with master");
        lock_client(&self.client).registered(true);
        self.reconciler.start();
    }

    pub fn resource_offers(&self, offers: Vec<Offer>) {
        if !self.api_server_started.load(Ordering::SeqCst) {
            info!(count = offers.len(), "declining offers, waiting for api server");
            decline_all(self.driver.as_ref(), &offers, &Filters::short());
            return;
        }
        let filtered = offers
            .into_iter()
            .map(|o| self.scrub_foreign_resources(o))
            .collect();
        self.processor.enqueue(filtered);
    }

    pub fn offer_rescinded(&self, offer_id: &OfferId) {
        info!(offer = %offer_id, "offer rescinded");
        self.processor.dequeue(offer_id);
    }

    pub fn status_update(&self, status: TaskStatus) {
        info!(
            task_id = %status.task_id,
            state = ?status.state,
            reason = ?status.reason,
            "status update"
        );
        lock_client(&self.client).status(&status);
        self.reconciler.status_received(&status.task_id);
    }

    pub fn framework_message(&self, executor: &str, agent_id: &str, data: &[u8]) {
        error!(
            bytes = data.len(),
            executor,
            agent = agent_id,
            "unsupported framework message received"
        );
    }

    pub fn disconnected(&self) -> ! {
        exit(ExitCode::Disconnected, "disconnected from master");
    }

    pub fn agent_lost(&self, agent_id: &str) {
        warn!(agent = agent_id, "agent lost");
    }

    pub fn executor_lost(&self, executor: &str, agent_id: &str) {
        warn!(executor, agent = agent_id, "executor lost");
    }

    pub fn error(&self, message: &str) -> ! {
        exit(ExitCode::DriverError, &format!("driver error: {message}"));
    }

    // ── Offer filtering ────────────────────────────────────────────

    /// Drop resources that cannot belong to us: dynamic reservations whose
    /// role is outside the whitelist, or which lack a resource-id label
    /// (both are quirks of sharing a cluster with other frameworks).
    fn scrub_foreign_resources(&self, mut offer: Offer) -> Offer {
        let before = offer.resources.len();
        offer.resources.retain(|r| self.is_processable(r));
        if offer.resources.len() != before {
            info!(
                offer = %offer.id,
                dropped = before - offer.resources.len(),
                "filtered foreign resources from offer"
            );
        }
        offer
    }

    fn is_processable(&self, resource: &Resource) -> bool {
        match &resource.reservation {
            None => true,
            Some(reservation) => {
                reservation.resource_id.is_some() && self.role_whitelist.contains(&resource.role)
            }
        }
    }
}

fn lock_client(client: &Arc<Mutex<dyn EventClient>>) -> std::sync::MutexGuard<'_, dyn EventClient + 'static> {
    match client.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
