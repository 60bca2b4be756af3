//! Offers and resources as presented by the master.
//!
//! An offer is a time-limited bundle of resources on one agent. Resources
//! are typed by name (`cpus`, `mem`, `disk`, `ports`), carry a role, and may
//! carry a reservation and a persistent-volume record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AgentId, OfferId, ResourceId};

/// Role wildcard used by unreserved resources.
pub const ANY_ROLE: &str = "*";

// ── Offer ─────────────────────────────────────────────────────────

/// A resource offer from the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    /// Fault domain of the agent, when the cluster reports one.
    pub domain: Option<Domain>,
    /// Agent attributes, used by placement rules.
    pub attributes: HashMap<String, String>,
    pub resources: Vec<Resource>,
}

impl Offer {
    /// All resource-ids of reserved resources in this offer.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter_map(|r| r.resource_id().map(str::to_string))
            .collect()
    }
}

/// Region/zone pair describing an agent's fault domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub region: String,
    pub zone: String,
}

// ── Resource ──────────────────────────────────────────────────────

/// A single typed resource within an offer or task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Resource kind: `cpus`, `mem`, `disk`, `ports`.
    pub name: String,
    pub value: Value,
    pub role: String,
    pub reservation: Option<Reservation>,
    /// Persistent-volume record, present on volume-backed disk resources.
    pub disk: Option<VolumeInfo>,
}

impl Resource {
    /// Build an unreserved scalar resource (role `*`).
    pub fn unreserved_scalar(name: &str, amount: f64) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Scalar(amount),
            role: ANY_ROLE.to_string(),
            reservation: None,
            disk: None,
        }
    }

    /// Build a dynamically reserved scalar resource.
    pub fn reserved_scalar(
        name: &str,
        amount: f64,
        role: &str,
        principal: &str,
        resource_id: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Scalar(amount),
            role: role.to_string(),
            reservation: Some(Reservation {
                principal: principal.to_string(),
                resource_id: Some(resource_id.to_string()),
            }),
            disk: None,
        }
    }

    /// Whether this resource carries a reservation.
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    /// The resource-id label, when reserved by us.
    pub fn resource_id(&self) -> Option<&str> {
        self.reservation
            .as_ref()
            .and_then(|r| r.resource_id.as_deref())
    }

    /// The scalar amount, when this is a scalar resource.
    pub fn scalar(&self) -> Option<f64> {
        match self.value {
            Value::Scalar(v) => Some(v),
            Value::Ranges(_) => None,
        }
    }
}

/// Resource quantity: a scalar amount or a set of ranges (ports).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Ranges(Vec<Range>),
}

impl Value {
    /// Total quantity covered by this value (range widths are inclusive).
    pub fn quantity(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Ranges(ranges) => ranges
                .iter()
                .map(|r| (r.end - r.begin + 1) as f64)
                .sum(),
        }
    }
}

/// Inclusive range of integers, used for port resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

/// A reservation claim over a resource: who reserved it and the generated
/// resource-id that ties it to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub principal: String,
    pub resource_id: Option<ResourceId>,
}

/// Persistent-volume record on a disk resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Path the volume is mounted at inside the container.
    pub container_path: String,
    /// Volume identifier; assigned when the volume is created.
    pub persistence_id: Option<String>,
}
