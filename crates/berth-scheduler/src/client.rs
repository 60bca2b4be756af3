//! The event-client contract between the offer processor and the service
//! schedulers.
//!
//! The processor's worker drives whichever client is installed — the
//! deploy scheduler in normal operation, the uninstall scheduler during
//! teardown — through this interface. All calls happen under one mutex:
//! the worker and the master-callback thread are the only two places
//! client state is touched.

use berth_offer::OfferRecommendation;
use berth_proto::{AgentId, Offer, OfferId, Resource, TaskStatus};

/// Response to an offer batch.
#[derive(Debug)]
pub enum OfferResponse {
    /// Recommendations to accept; the remainder declines long.
    Processed { recommendations: Vec<OfferRecommendation> },
    /// As `Processed`, but the client wants the declined offers back soon.
    NotReady { recommendations: Vec<OfferRecommendation> },
    /// The client has no further use for offers.
    Finished,
    /// Uninstall ran to completion: tear the framework down.
    Uninstalled,
}

/// Reserved resources the service no longer expects, grouped by offer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferResources {
    pub offer_id: OfferId,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
}

/// Response to an unexpected-resources query.
#[derive(Debug)]
pub enum UnexpectedResourcesResponse {
    Processed { unexpected: Vec<OfferResources> },
    /// Bookkeeping failed; leave the resources alone and retry later.
    Failed,
}

/// The contract the offer processor drives.
pub trait EventClient: Send {
    /// (Re-)registration with the master completed.
    fn registered(&mut self, reregistration: bool);

    /// Process an offer batch and recommend operations.
    fn offers(&mut self, offers: &[Offer]) -> OfferResponse;

    /// Reserved resources in the unused offers that no live task claims.
    fn unexpected_resources(&mut self, unused: &[Offer]) -> UnexpectedResourcesResponse;

    /// A status update for a task (already role-filtered upstream).
    fn status(&mut self, status: &TaskStatus);

    /// The framework was torn down at the master.
    fn unregistered(&mut self);
}
