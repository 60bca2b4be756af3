//! berth-scheduler — offer processing and plan execution.
//!
//! Assembles the stores, plans, evaluator, and pumps into a running
//! scheduler core. The embedding process supplies the master driver (RPC),
//! an HTTP surface, and optionally a secrets client; everything else lives
//! here.
//!
//! # Wiring
//!
//! ```text
//! master ─▶ FrameworkScheduler ─▶ OfferProcessor ─▶ ServiceMode (deploy | uninstall)
//!                │                                      │
//!                └── statuses ──────────────────────────┤
//!                                                       ▼
//!                              PlanCoordinator ─▶ PlanScheduler ─▶ OfferEvaluator
//!                                                       │
//!                                      LaunchRecorder / CleanupRecorder ─▶ stores
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod exit;
pub mod framework;
pub mod plan_scheduler;
pub mod processor;
pub mod reconciler;
pub mod recorder;
pub mod service;
pub mod uninstall;

use std::sync::Arc;

use tracing::info;

use berth_proto::{MasterDriver, Offer, TaskStatus};
use berth_spec::ServiceSpec;
use berth_store::{Persister, StateStore};

pub use client::{EventClient, OfferResources, OfferResponse, UnexpectedResourcesResponse};
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use framework::FrameworkScheduler;
pub use plan_scheduler::PlanScheduler;
pub use processor::OfferProcessor;
pub use reconciler::ImplicitReconciler;
pub use service::DeployScheduler;
pub use uninstall::{SecretsClient, UninstallScheduler};

/// The active scheduler: deploying toward the target config, or tearing
/// the service down. The uninstall bit, once set, is absorbing — a process
/// restart re-enters uninstall mode here, and `begin_uninstall` only ever
/// converts deploy → uninstall.
pub enum ServiceMode {
    Deploy(DeployScheduler),
    Uninstall(UninstallScheduler),
}

impl ServiceMode {
    /// Build the mode matching persisted state: uninstall when the bit is
    /// set, deploy otherwise.
    pub fn bootstrap(
        spec: ServiceSpec,
        config: SchedulerConfig,
        driver: Arc<dyn MasterDriver>,
        persister: Arc<dyn Persister>,
        secrets: Option<Arc<dyn SecretsClient>>,
    ) -> SchedulerResult<Self> {
        let state = StateStore::new(Arc::clone(&persister));
        if state.is_uninstalling()? {
            info!(service = %spec.name, "uninstall bit set, bootstrapping in uninstall mode");
            Ok(ServiceMode::Uninstall(UninstallScheduler::new(
                spec, config, driver, persister, secrets,
            )?))
        } else {
            Ok(ServiceMode::Deploy(DeployScheduler::new(
                spec, config, driver, persister, secrets,
            )?))
        }
    }

    /// Convert deploy mode to uninstall mode in place, sharing the stores.
    /// A no-op when already uninstalling.
    pub fn begin_uninstall(&mut self) -> SchedulerResult<()> {
        if let ServiceMode::Deploy(deploy) = self {
            let uninstall = deploy.to_uninstall_scheduler()?;
            info!("switching to uninstall mode");
            *self = ServiceMode::Uninstall(uninstall);
        }
        Ok(())
    }

    pub fn is_uninstalling(&self) -> bool {
        matches!(self, ServiceMode::Uninstall(_))
    }
}

impl EventClient for ServiceMode {
    fn registered(&mut self, reregistration: bool) {
        match self {
            ServiceMode::Deploy(s) => s.registered(reregistration),
            ServiceMode::Uninstall(s) => s.registered(reregistration),
        }
    }

    fn offers(&mut self, offers: &[Offer]) -> OfferResponse {
        match self {
            ServiceMode::Deploy(s) => s.offers(offers),
            ServiceMode::Uninstall(s) => s.offers(offers),
        }
    }

    fn unexpected_resources(&mut self, unused: &[Offer]) -> UnexpectedResourcesResponse {
        match self {
            ServiceMode::Deploy(s) => s.unexpected_resources(unused),
            ServiceMode::Uninstall(s) => s.unexpected_resources(unused),
        }
    }

    fn status(&mut self, status: &TaskStatus) {
        match self {
            ServiceMode::Deploy(s) => s.status(status),
            ServiceMode::Uninstall(s) => s.status(status),
        }
    }

    fn unregistered(&mut self) {
        match self {
            ServiceMode::Deploy(s) => s.unregistered(),
            ServiceMode::Uninstall(s) => s.unregistered(),
        }
    }
}
