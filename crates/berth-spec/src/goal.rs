//! Goal states and per-task goal overrides.
//!
//! A task's default goal comes from its spec; an override layers an
//! operator directive (pause, stop, decommission) on top. The
//! (override, progress) pairs form a small product type whose legal
//! transitions are enumerated in one table rather than scattered as
//! boolean checks.

use serde::{Deserialize, Serialize};

/// The spec-declared goal of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalState {
    /// Keep the task running; relaunch on failure.
    Running,
    /// Run to completion once; a FINISHED status completes the step.
    Once,
}

/// Operator directive layered over the spec goal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalOverride {
    None,
    /// Relaunch the task with an idle command so it stays resident but
    /// does no work.
    Paused,
    /// Keep the task stopped; do not relaunch.
    Stopped,
    /// The pod instance is being decommissioned along with its resources.
    Decommissioning,
}

/// How far along an override (or its removal) is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideProgress {
    /// Requested; the task has not yet been killed to take effect.
    Pending,
    /// The kill was processed; waiting on relaunch under the override.
    InProgress,
    /// The override is fully in effect.
    Complete,
}

/// A task's current override and its progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideStatus {
    pub target: GoalOverride,
    pub progress: OverrideProgress,
}

impl OverrideStatus {
    /// The inactive status: no override, nothing in flight.
    pub fn inactive() -> Self {
        Self { target: GoalOverride::None, progress: OverrideProgress::Complete }
    }

    /// A freshly requested override, not yet acted on.
    pub fn pending(target: GoalOverride) -> Self {
        Self { target, progress: OverrideProgress::Pending }
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Progress only moves forward within one target
    /// (Pending → InProgress → Complete); switching targets is only legal
    /// from a Complete state (a new directive replaces a settled one), and
    /// Decommissioning is absorbing.
    pub fn allows(&self, next: &OverrideStatus) -> bool {
        use OverrideProgress::{Complete, InProgress, Pending};
        if self.target == GoalOverride::Decommissioning
            && next.target != GoalOverride::Decommissioning
        {
            return false;
        }
        if self.target == next.target {
            matches!(
                (self.progress, next.progress),
                (Pending, Pending)
                    | (Pending, InProgress)
                    | (InProgress, InProgress)
                    | (InProgress, Complete)
                    | (Complete, Complete)
            )
        } else {
            // A new directive starts from Pending, once the previous one
            // has settled.
            self.progress == Complete && next.progress == Pending
        }
    }
}

impl Default for OverrideStatus {
    fn default() -> Self {
        Self::inactive()
    }
}
