//! Service, pod, and task specifications.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use berth_proto::Value;

use crate::goal::GoalState;
use crate::placement::PlacementRule;

/// A complete declarative service description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    /// Resource role all reservations are made under.
    pub role: String,
    /// Principal attached to every reservation.
    pub principal: String,
    pub pods: Vec<PodSpec>,
    /// Named plans beyond the default deployment plan.
    pub plans: Vec<PlanSpec>,
}

impl ServiceSpec {
    /// Stable identity hash over the canonical JSON form. Two specs with
    /// the same hash deploy identically; a hash change triggers a new
    /// target configuration.
    pub fn identity_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&json);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn pod(&self, name: &str) -> Option<&PodSpec> {
        self.pods.iter().find(|p| p.name == name)
    }

    /// Every task name this spec can launch, across all pods and instances.
    pub fn task_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for pod in &self.pods {
            for index in 0..pod.count {
                for task in &pod.tasks {
                    names.push(task_full_name(&pod.name, index, &task.name));
                }
            }
        }
        names
    }
}

/// A colocated group of tasks sharing an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodSpec {
    pub name: String,
    /// Number of pod instances to run.
    pub count: u32,
    pub placement: Vec<PlacementRule>,
    pub tasks: Vec<TaskSpec>,
}

/// A single task within a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub goal: GoalState,
    pub command: String,
    pub environment: HashMap<String, String>,
    /// Resources in declaration order; matching walks this order.
    pub resources: Vec<ResourceSpec>,
    pub volumes: Vec<VolumeSpec>,
}

/// One required resource of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Resource kind: `cpus`, `mem`, `ports`.
    pub name: String,
    pub value: Value,
}

impl ResourceSpec {
    pub fn scalar(name: &str, amount: f64) -> Self {
        Self { name: name.to_string(), value: Value::Scalar(amount) }
    }
}

/// A persistent volume a task needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    pub container_path: String,
    pub size_mb: f64,
}

/// A named plan: ordered phases, each phase covering one pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSpec {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

/// One phase of a declared plan. Steps are derived from the pod's
/// instance count, in index order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    pub name: String,
    pub pod: String,
}

/// Name of pod instance `index` of `pod`.
pub fn pod_instance_name(pod: &str, index: u32) -> String {
    format!("{pod}-{index}")
}

/// Full task name: `{pod}-{index}-{task}`.
pub fn task_full_name(pod: &str, index: u32, task: &str) -> String {
    format!("{pod}-{index}-{task}")
}
