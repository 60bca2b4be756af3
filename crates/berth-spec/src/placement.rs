//! Placement rules declared on pods.
//!
//! Rules are declarative data here; the offer evaluator turns each one into
//! a predicate over (offer, currently placed tasks).

use serde::{Deserialize, Serialize};

/// A placement constraint on a pod's instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PlacementRule {
    /// No two instances of this pod on the same hostname.
    HostnameUnique,
    /// No two instances of this pod in the same zone.
    ZoneUnique,
    /// The agent must be in the given region.
    RegionIs { region: String },
    /// The agent must carry the given attribute value.
    AttributeEquals { key: String, value: String },
    /// At most `limit` instances of this pod per hostname.
    MaxPerHostname { limit: u32 },
    /// The instance must land on an agent already running an instance of
    /// the named pod.
    ColocateWith { pod: String },
}
