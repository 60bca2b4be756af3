//! Offer outcome tracking — a bounded history of evaluation decisions.

use std::collections::VecDeque;

use serde::Serialize;

/// Default number of outcomes retained.
const DEFAULT_CAPACITY: usize = 100;

/// One recorded evaluation decision.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OfferOutcome {
    pub offer_id: String,
    pub hostname: String,
    /// Pod instance the offer was evaluated for.
    pub pod_instance: String,
    pub accepted: bool,
    /// Why the offer passed or failed, e.g. `insufficient cpus: want 1 have 0.5`.
    pub reason: String,
}

/// Ring buffer of recent offer outcomes, oldest first.
#[derive(Debug)]
pub struct OfferOutcomeTracker {
    capacity: usize,
    outcomes: VecDeque<OfferOutcome>,
}

impl OfferOutcomeTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Record an outcome, evicting the oldest once at capacity.
    pub fn record(&mut self, outcome: OfferOutcome) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);
    }

    pub fn record_pass(&mut self, offer_id: &str, hostname: &str, pod_instance: &str) {
        self.record(OfferOutcome {
            offer_id: offer_id.to_string(),
            hostname: hostname.to_string(),
            pod_instance: pod_instance.to_string(),
            accepted: true,
            reason: "all requirements satisfied".to_string(),
        });
    }

    pub fn record_fail(&mut self, offer_id: &str, hostname: &str, pod_instance: &str, reason: &str) {
        self.record(OfferOutcome {
            offer_id: offer_id.to_string(),
            hostname: hostname.to_string(),
            pod_instance: pod_instance.to_string(),
            accepted: false,
            reason: reason.to_string(),
        });
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &OfferOutcome> {
        self.outcomes.iter()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl Default for OfferOutcomeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut tracker = OfferOutcomeTracker::new();
        tracker.record_fail("o1", "h1", "p0-0", "insufficient cpus: want 1 have 0.5");
        tracker.record_pass("o2", "h2", "p0-0");

        let outcomes: Vec<_> = tracker.outcomes().collect();
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].accepted);
        assert!(outcomes[0].reason.contains("insufficient cpus"));
        assert!(outcomes[1].accepted);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut tracker = OfferOutcomeTracker::with_capacity(2);
        tracker.record_pass("o1", "h", "p");
        tracker.record_pass("o2", "h", "p");
        tracker.record_pass("o3", "h", "p");

        let ids: Vec<_> = tracker.outcomes().map(|o| o.offer_id.as_str()).collect();
        assert_eq!(ids, vec!["o2", "o3"]);
        assert_eq!(tracker.len(), 2);
    }
}
