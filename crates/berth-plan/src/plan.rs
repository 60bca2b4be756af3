//! Plans and phases — ordered containers over steps.

use tracing::debug;

use crate::step::{Step, StepStatus};

/// How a container walks its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One child at a time, in order.
    Serial,
    /// All incomplete children at once.
    Parallel,
}

/// Rolled-up status of a plan or phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

/// An ordered group of steps, usually covering one pod.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub strategy: Strategy,
    pub steps: Vec<Step>,
}

impl Phase {
    pub fn new(name: &str, strategy: Strategy, steps: Vec<Step>) -> Self {
        Self { name: name.to_string(), strategy, steps }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(Step::is_complete)
    }

    pub fn has_error(&self) -> bool {
        self.steps.iter().any(|s| matches!(s.status, StepStatus::Error(_)))
    }

    /// Steps eligible to work this tick, honoring the walk strategy.
    fn candidate_ids(&self) -> Vec<String> {
        match self.strategy {
            Strategy::Serial => self
                .steps
                .iter()
                .find(|s| !s.is_complete())
                .filter(|s| s.is_eligible())
                .map(|s| vec![s.id.clone()])
                .unwrap_or_default(),
            Strategy::Parallel => self
                .steps
                .iter()
                .filter(|s| s.is_eligible())
                .map(|s| s.id.clone())
                .collect(),
        }
    }
}

/// An ordered sequence of phases driving toward a goal.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub strategy: Strategy,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn new(name: &str, strategy: Strategy, phases: Vec<Phase>) -> Self {
        Self { name: name.to_string(), strategy, phases }
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(Phase::is_complete)
    }

    pub fn status(&self) -> PlanStatus {
        if self.phases.iter().any(Phase::has_error) {
            PlanStatus::Error
        } else if self.is_complete() {
            PlanStatus::Complete
        } else if self
            .phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .all(|s| s.status == StepStatus::Pending)
        {
            PlanStatus::Pending
        } else {
            PlanStatus::InProgress
        }
    }

    /// Eligible step ids this tick: serial plans only look at the first
    /// incomplete phase.
    pub fn candidate_ids(&self) -> Vec<String> {
        match self.strategy {
            Strategy::Serial => self
                .phases
                .iter()
                .find(|p| !p.is_complete())
                .map(|p| p.candidate_ids())
                .unwrap_or_default(),
            Strategy::Parallel => self
                .phases
                .iter()
                .filter(|p| !p.is_complete())
                .flat_map(|p| p.candidate_ids())
                .collect(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.steps.iter_mut())
            .find(|s| s.id == id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.phases.iter_mut().flat_map(|p| p.steps.iter_mut())
    }

    /// Pod instances held by in-progress steps.
    pub fn dirty_assets(&self) -> Vec<String> {
        let assets: Vec<String> = self
            .steps()
            .filter(|s| s.status.is_in_progress())
            .filter_map(|s| s.asset.clone())
            .collect();
        if !assets.is_empty() {
            debug!(plan = %self.name, ?assets, "dirty assets");
        }
        assets
    }
}
