//! berth-plan — deployment progress as a plan/phase/step state machine.
//!
//! A [`Plan`] is an ordered sequence of [`Phase`]s, each an ordered
//! sequence of [`Step`]s. Steps are the leaves that map to concrete work:
//! launch a pod instance, kill tasks, wait for resource cleanup, or run a
//! one-shot teardown action. [`PlanManager`]s own one plan each and react
//! to status updates; the [`PlanCoordinator`] yields each tick's eligible
//! steps across all plans, keeping two plans off the same pod instance via
//! the dirty-asset rule.

pub mod coordinator;
pub mod decommission;
pub mod manager;
pub mod plan;
pub mod recovery;
pub mod step;

pub use coordinator::PlanCoordinator;
pub use decommission::DecommissionPlanManager;
pub use manager::{DeploymentPlanManager, PlanManager};
pub use plan::{Phase, Plan, PlanStatus, Strategy};
pub use recovery::RecoveryPlanManager;
pub use step::{RecoveryType, Step, StepKind, StepStatus};

/// Name of the default deployment plan.
pub const DEPLOY_PLAN: &str = "deploy";
/// Name of the recovery plan.
pub const RECOVERY_PLAN: &str = "recovery";
/// Name of the decommission plan.
pub const DECOMMISSION_PLAN: &str = "decommission";
/// Name of the uninstall plan.
pub const UNINSTALL_PLAN: &str = "uninstall";
