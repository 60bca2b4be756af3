//! berth-spec — declarative service descriptions.
//!
//! A [`ServiceSpec`] declares pods × tasks, their resources and placement
//! rules, and named deployment plans. Specs are plain serializable data with
//! a stable identity hash; a hash change is what drives a new target
//! configuration and a fresh deployment plan.

pub mod goal;
pub mod placement;
pub mod service;

pub use goal::{GoalOverride, GoalState, OverrideProgress, OverrideStatus};
pub use placement::PlacementRule;
pub use service::{
    PhaseSpec, PlanSpec, PodSpec, ResourceSpec, ServiceSpec, TaskSpec, VolumeSpec,
};
