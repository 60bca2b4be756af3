//! berth-proto — master wire model for the Berth scheduler.
//!
//! Defines the data the master exchanges with the scheduler (offers,
//! resources, reservations, task descriptions, status updates, operations)
//! and the [`MasterDriver`] trait through which the scheduler core calls
//! back out. The actual RPC transport is supplied by the embedding process;
//! everything in this crate is plain data plus a [`RecordingDriver`] double
//! for tests and simulations.

pub mod driver;
pub mod offer;
pub mod op;
pub mod task;

pub use driver::{DriverCall, MasterDriver, MasterInfo, RecordingDriver};
pub use offer::{Domain, Offer, Range, Reservation, Resource, Value, VolumeInfo};
pub use op::{Filters, Operation, LONG_DECLINE_SECONDS, SHORT_DECLINE_SECONDS};
pub use task::{
    CommandInfo, ContainerStatus, ExecutorInfo, TaskInfo, TaskState, TaskStatus,
};

/// Opaque offer identifier assigned by the master.
pub type OfferId = String;

/// Opaque agent identifier assigned by the master.
pub type AgentId = String;

/// Task identifier. An empty value on a stored `TaskInfo` marks a
/// reservation-only record (resources held, no task running).
pub type TaskId = String;

/// Framework identifier assigned by the master on first registration.
pub type FrameworkId = String;

/// Generated resource-id label; the durable handle that ties a reserved
/// resource to a task across restarts.
pub type ResourceId = String;

/// Label keys carried on stored `TaskInfo`s.
pub mod labels {
    /// Target configuration version the task was launched against.
    pub const CONFIG_ID: &str = "config_id";
    /// Present when the task has been marked permanently failed; its
    /// reservations are then eligible for cleanup.
    pub const PERMANENTLY_FAILED: &str = "permanently_failed";
    /// Pod the task belongs to.
    pub const POD: &str = "pod";
    /// Pod instance (`{pod}-{index}`) the task belongs to.
    pub const POD_INSTANCE: &str = "pod_instance";
    /// Hostname of the agent the task was launched on.
    pub const HOSTNAME: &str = "hostname";
    /// Fault-domain region of the agent, when reported.
    pub const REGION: &str = "region";
    /// Fault-domain zone of the agent, when reported.
    pub const ZONE: &str = "zone";
}
