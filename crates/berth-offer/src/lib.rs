//! berth-offer — matching pending work against resource offers.
//!
//! The [`OfferEvaluator`] is a pure function from (one pod-instance
//! requirement, a batch of offers) to a list of [`OfferRecommendation`]s.
//! It holds no stores and makes no calls; reservation reuse works off the
//! resource-ids carried in the requirement, and every accept/reject
//! decision is recorded in the [`OfferOutcomeTracker`] for diagnostics.

pub mod evaluate;
pub mod outcome;
pub mod placement;
pub mod recommendation;
pub mod requirement;

pub use evaluate::OfferEvaluator;
pub use outcome::{OfferOutcome, OfferOutcomeTracker};
pub use recommendation::OfferRecommendation;
pub use requirement::PodInstanceRequirement;
