//! Operations and decline filters sent to the master.

use serde::{Deserialize, Serialize};

use crate::offer::Resource;
use crate::task::TaskInfo;

/// Refuse interval for offers the scheduler wants to see again soon.
pub const SHORT_DECLINE_SECONDS: f64 = 5.0;

/// Refuse interval for offers the scheduler has no use for (two weeks).
pub const LONG_DECLINE_SECONDS: f64 = 14.0 * 24.0 * 3600.0;

/// An operation applied to offered resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Launch a task on previously reserved resources.
    Launch { tasks: Vec<TaskInfo> },
    /// Launch a task group under a dedicated executor.
    LaunchGroup { tasks: Vec<TaskInfo> },
    /// Reserve resources, tagging them with generated resource-ids.
    Reserve { resources: Vec<Resource> },
    /// Release previously reserved resources.
    Unreserve { resources: Vec<Resource> },
    /// Create a persistent volume on reserved disk.
    Create { volumes: Vec<Resource> },
    /// Destroy a persistent volume.
    Destroy { volumes: Vec<Resource> },
}

/// Decline filters: how long the master should withhold the offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Filters {
    pub refuse_seconds: f64,
}

impl Filters {
    /// Short refusal; the scheduler wants these resources back soon.
    pub fn short() -> Self {
        Self { refuse_seconds: SHORT_DECLINE_SECONDS }
    }

    /// Long refusal; the scheduler has no use for these resources.
    pub fn long() -> Self {
        Self { refuse_seconds: LONG_DECLINE_SECONDS }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_intervals() {
        assert_eq!(Filters::short().refuse_seconds, 5.0);
        assert!(Filters::long().refuse_seconds > 1_000_000.0);
    }

    #[test]
    fn operation_tag_serialization() {
        let op = Operation::Reserve { resources: vec![] };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"RESERVE\""), "{json}");
    }
}
