//! Offer recommendations — the evaluator's output.
//!
//! A recommendation is a tagged variant; the consumers (launch recorder,
//! cleanup recorder, driver-operation builder) are total functions over it.

use berth_proto::{AgentId, OfferId, Operation, Resource, TaskInfo};

/// One recommended action against an offer's resources.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferRecommendation {
    /// Reserve resources from the offer, tagged with a fresh resource-id.
    Reserve {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    /// Release a previously reserved resource.
    Unreserve {
        offer_id: OfferId,
        agent_id: AgentId,
        resource: Resource,
    },
    /// Create a persistent volume on reserved disk.
    CreateVolume {
        offer_id: OfferId,
        agent_id: AgentId,
        volume: Resource,
    },
    /// Destroy a persistent volume.
    DestroyVolume {
        offer_id: OfferId,
        agent_id: AgentId,
        volume: Resource,
    },
    /// Launch a task on reserved resources. `should_launch = false` marks a
    /// transient placeholder that satisfies the evaluator's bookkeeping but
    /// must never reach the driver.
    Launch {
        offer_id: OfferId,
        agent_id: AgentId,
        task: TaskInfo,
        should_launch: bool,
    },
}

impl OfferRecommendation {
    pub fn offer_id(&self) -> &OfferId {
        match self {
            OfferRecommendation::Reserve { offer_id, .. }
            | OfferRecommendation::Unreserve { offer_id, .. }
            | OfferRecommendation::CreateVolume { offer_id, .. }
            | OfferRecommendation::DestroyVolume { offer_id, .. }
            | OfferRecommendation::Launch { offer_id, .. } => offer_id,
        }
    }

    /// The driver operation this recommendation maps to. Transient
    /// launches map to none.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            OfferRecommendation::Reserve { resource, .. } => Some(Operation::Reserve {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::Unreserve { resource, .. } => Some(Operation::Unreserve {
                resources: vec![resource.clone()],
            }),
            OfferRecommendation::CreateVolume { volume, .. } => Some(Operation::Create {
                volumes: vec![volume.clone()],
            }),
            OfferRecommendation::DestroyVolume { volume, .. } => Some(Operation::Destroy {
                volumes: vec![volume.clone()],
            }),
            OfferRecommendation::Launch { task, should_launch, .. } => {
                if !should_launch {
                    return None;
                }
                if task.executor.is_some() {
                    Some(Operation::LaunchGroup { tasks: vec![task.clone()] })
                } else {
                    Some(Operation::Launch { tasks: vec![task.clone()] })
                }
            }
        }
    }
}

/// Distinct offer-ids across recommendations, in first-seen order.
pub fn offer_ids(recommendations: &[OfferRecommendation]) -> Vec<OfferId> {
    let mut ids: Vec<OfferId> = Vec::new();
    for rec in recommendations {
        if !ids.contains(rec.offer_id()) {
            ids.push(rec.offer_id().clone());
        }
    }
    ids
}

/// Driver operations for the recommendations, in recommendation order,
/// omitting transient launches.
pub fn operations(recommendations: &[OfferRecommendation]) -> Vec<Operation> {
    recommendations.iter().filter_map(|r| r.operation()).collect()
}
