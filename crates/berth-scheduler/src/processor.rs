//! OfferProcessor — the queued pump between the master and the event client.
//!
//! Offer batches enqueue from the driver callback thread and drain on one
//! worker task, so all plan and store state is touched single-threaded.
//! When threading is disabled (tests), the caller's thread drains
//! immediately and the flow is fully deterministic.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use berth_offer::recommendation;
use berth_proto::{Filters, MasterDriver, Offer, OfferId, Operation, Resource};
use berth_store::Persister;

use crate::client::{EventClient, OfferResponse, UnexpectedResourcesResponse};

/// Rescind bookkeeping bound; beyond this the set is cleared (the worker
/// filter is best-effort anyway).
const RESCIND_SET_LIMIT: usize = 1024;

/// Shared internals between the handle and the worker.
struct Pump {
    client: Arc<Mutex<dyn EventClient>>,
    driver: Arc<dyn MasterDriver>,
    persister: Arc<dyn Persister>,
    queue: Mutex<VecDeque<Vec<Offer>>>,
    rescinded: Mutex<HashSet<OfferId>>,
    /// Set once teardown ran; everything after that declines short.
    destroyed: AtomicBool,
}

pub struct OfferProcessor {
    pump: Arc<Pump>,
    notify: Arc<Notify>,
    /// Queue bound; 0 = unbounded.
    queue_size: usize,
    multithreaded: bool,
}

impl OfferProcessor {
    pub fn new(
        client: Arc<Mutex<dyn EventClient>>,
        driver: Arc<dyn MasterDriver>,
        persister: Arc<dyn Persister>,
        queue_size: usize,
        multithreaded: bool,
    ) -> Self {
        Self {
            pump: Arc::new(Pump {
                client,
                driver,
                persister,
                queue: Mutex::new(VecDeque::new()),
                rescinded: Mutex::new(HashSet::new()),
                destroyed: AtomicBool::new(false),
            }),
            notify: Arc::new(Notify::new()),
            queue_size,
            multithreaded,
        }
    }

    /// Spawn the worker. No-op with threading disabled.
    pub fn start(&self) {
        if !self.multithreaded {
            return;
        }
        let pump = Arc::clone(&self.pump);
        let notify = Arc::clone(&self.notify);
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                while let Some(batch) = pump.pop() {
                    pump.process_batch(batch);
                }
            }
        });
        info!("offer processor worker started");
    }

    /// Queue a batch; called from the driver callback thread and never
    /// blocks. Excess batches decline short rather than waiting.
    pub fn enqueue(&self, offers: Vec<Offer>) {
        if offers.is_empty() {
            return;
        }
        if self.pump.destroyed.load(Ordering::SeqCst) {
            decline_all(self.pump.driver.as_ref(), &offers, &Filters::short());
            return;
        }
        if !self.multithreaded {
            self.pump.process_batch(offers);
            return;
        }

        {
            let mut queue = lock(&self.pump.queue);
            if self.queue_size > 0 && queue.len() >= self.queue_size {
                drop(queue);
                warn!(count = offers.len(), "offer queue full, declining batch");
                decline_all(self.pump.driver.as_ref(), &offers, &Filters::short());
                return;
            }
            queue.push_back(offers);
        }
        self.notify.notify_one();
    }

    /// Drop a rescinded offer from the queue; the worker also filters it
    /// if the batch was already popped.
    pub fn dequeue(&self, offer_id: &OfferId) {
        let mut found = false;
        {
            let mut queue = lock(&self.pump.queue);
            for batch in queue.iter_mut() {
                let before = batch.len();
                batch.retain(|o| &o.id != offer_id);
                found |= batch.len() != before;
            }
        }
        if !found {
            let mut rescinded = lock(&self.pump.rescinded);
            if rescinded.len() >= RESCIND_SET_LIMIT {
                rescinded.clear();
            }
            rescinded.insert(offer_id.clone());
        }
        debug!(offer = %offer_id, found_in_queue = found, "offer rescinded");
    }

    /// Number of batches waiting; used by tests.
    pub fn queued_batches(&self) -> usize {
        lock(&self.pump.queue).len()
    }

    /// Whether the uninstall teardown has run.
    pub fn is_destroyed(&self) -> bool {
        self.pump.destroyed.load(Ordering::SeqCst)
    }
}

impl Pump {
    fn pop(&self) -> Option<Vec<Offer>> {
        lock(&self.queue).pop_front()
    }

    fn process_batch(&self, mut offers: Vec<Offer>) {
        {
            let mut rescinded = lock(&self.rescinded);
            offers.retain(|o| !rescinded.remove(&o.id));
        }
        if offers.is_empty() {
            return;
        }

        let response = lock(&self.client).offers(&offers);
        match response {
            OfferResponse::Finished => {
                debug!("client finished, declining batch short");
                decline_all(self.driver.as_ref(), &offers, &Filters::short());
            }
            OfferResponse::Uninstalled => {
                info!("client uninstalled, tearing down framework");
                decline_all(self.driver.as_ref(), &offers, &Filters::short());
                self.driver.stop(false);
                lock(&self.client).unregistered();
                if let Err(e) = self.persister.recursive_delete("/") {
                    warn!(error = %e, "final state wipe failed");
                }
                self.destroyed.store(true, Ordering::SeqCst);
            }
            OfferResponse::Processed { recommendations } => {
                self.accept_and_clean(&offers, recommendations, &Filters::long());
            }
            OfferResponse::NotReady { recommendations } => {
                self.accept_and_clean(&offers, recommendations, &Filters::short());
            }
        }
    }

    /// Accept the recommendations, run the unexpected-resources pass over
    /// the unused offers, and decline what is left.
    fn accept_and_clean(
        &self,
        offers: &[Offer],
        recommendations: Vec<berth_offer::OfferRecommendation>,
        remainder: &Filters,
    ) {
        let used = recommendation::offer_ids(&recommendations);
        if !recommendations.is_empty() {
            let operations = recommendation::operations(&recommendations);
            self.driver
                .accept_offers(&used, &operations, &Filters::long());
        }

        let mut unused: Vec<Offer> = offers
            .iter()
            .filter(|o| !used.contains(&o.id))
            .cloned()
            .collect();

        match lock(&self.client).unexpected_resources(&unused) {
            UnexpectedResourcesResponse::Processed { unexpected } => {
                for group in &unexpected {
                    let operations = cleanup_operations(&group.resources);
                    if operations.is_empty() {
                        continue;
                    }
                    self.driver.accept_offers(
                        std::slice::from_ref(&group.offer_id),
                        &operations,
                        &Filters::long(),
                    );
                    unused.retain(|o| o.id != group.offer_id);
                }
            }
            UnexpectedResourcesResponse::Failed => {
                debug!("unexpected-resource bookkeeping failed, skipping cleanup this batch");
            }
        }

        decline_all(self.driver.as_ref(), &unused, remainder);
    }
}

/// Destroy volumes first, then unreserve everything released.
fn cleanup_operations(resources: &[Resource]) -> Vec<Operation> {
    let mut operations = Vec::new();
    let volumes: Vec<Resource> = resources
        .iter()
        .filter(|r| r.disk.as_ref().is_some_and(|d| d.persistence_id.is_some()))
        .cloned()
        .collect();
    if !volumes.is_empty() {
        operations.push(Operation::Destroy { volumes });
    }
    let unreserved: Vec<Resource> = resources
        .iter()
        .cloned()
        .map(|mut r| {
            r.disk = None;
            r
        })
        .collect();
    if !unreserved.is_empty() {
        operations.push(Operation::Unreserve { resources: unreserved });
    }
    operations
}

/// Decline every offer in the batch with the given refuse interval.
pub fn decline_all(driver: &dyn MasterDriver, offers: &[Offer], filters: &Filters) {
    for offer in offers {
        driver.decline_offer(&offer.id, filters);
    }
}

/// Lock that survives a poisoned mutex; the worker never holds state that
/// is unsafe to observe after a panic.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::OfferResources;
    use berth_offer::OfferRecommendation;
    use berth_proto::{DriverCall, RecordingDriver, Resource, TaskStatus};
    use berth_store::RedbPersister;
    use std::collections::HashMap;

    /// Scripted event client covering the response matrix.
    struct ScriptedClient {
        response: fn(&[Offer]) -> OfferResponse,
        unexpected: fn(&[Offer]) -> UnexpectedResourcesResponse,
        unexpected_calls: usize,
        unregistered_calls: usize,
    }

    impl ScriptedClient {
        fn new(
            response: fn(&[Offer]) -> OfferResponse,
            unexpected: fn(&[Offer]) -> UnexpectedResourcesResponse,
        ) -> Arc<Mutex<Self>> {
            Arc::new(Mutex::new(Self {
                response,
                unexpected,
                unexpected_calls: 0,
                unregistered_calls: 0,
            }))
        }
    }

    impl EventClient for ScriptedClient {
        fn registered(&mut self, _reregistration: bool) {}
        fn offers(&mut self, offers: &[Offer]) -> OfferResponse {
            (self.response)(offers)
        }
        fn unexpected_resources(&mut self, unused: &[Offer]) -> UnexpectedResourcesResponse {
            self.unexpected_calls += 1;
            (self.unexpected)(unused)
        }
        fn status(&mut self, _status: &TaskStatus) {}
        fn unregistered(&mut self) {
            self.unregistered_calls += 1;
        }
    }

    fn offer(id: &str) -> Offer {
        Offer {
            id: id.to_string(),
            agent_id: "a1".to_string(),
            hostname: "host-1".to_string(),
            domain: None,
            attributes: HashMap::new(),
            resources: vec![Resource::unreserved_scalar("cpus", 3.0)],
        }
    }

    fn none_unexpected(_: &[Offer]) -> UnexpectedResourcesResponse {
        UnexpectedResourcesResponse::Processed { unexpected: vec![] }
    }

    fn processor(
        client: Arc<Mutex<dyn EventClient>>,
        driver: Arc<RecordingDriver>,
    ) -> (OfferProcessor, Arc<dyn Persister>) {
        let persister: Arc<dyn Persister> =
            Arc::new(RedbPersister::open_in_memory().unwrap());
        let p = OfferProcessor::new(
            client,
            driver,
            Arc::clone(&persister),
            0,
            false, // threading disabled: caller drains inline
        );
        (p, persister)
    }

    #[test]
    fn unused_offers_declined_long() {
        let client = ScriptedClient::new(
            |_| OfferResponse::Processed { recommendations: vec![] },
            none_unexpected,
        );
        let driver = Arc::new(RecordingDriver::new());
        let (processor, _) = processor(client, Arc::clone(&driver));

        processor.enqueue(vec![offer("o1"), offer("o2")]);

        let declines: Vec<_> = driver
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline { refuse_seconds, .. } => Some(refuse_seconds),
                _ => None,
            })
            .collect();
        assert_eq!(declines.len(), 2);
        assert!(declines.iter().all(|&s| s > 1_000_000.0));
    }

    #[test]
    fn not_ready_declines_short() {
        let client = ScriptedClient::new(
            |_| OfferResponse::NotReady { recommendations: vec![] },
            none_unexpected,
        );
        let driver = Arc::new(RecordingDriver::new());
        let (processor, _) = processor(client, Arc::clone(&driver));

        processor.enqueue(vec![offer("o1")]);

        let calls = driver.calls();
        assert!(matches!(
            calls[0],
            DriverCall::Decline { refuse_seconds, .. } if refuse_seconds == 5.0
        ));
    }

    #[test]
    fn accepted_and_unexpected_resources() {
        fn consume_first(offers: &[Offer]) -> OfferResponse {
            let first = &offers[0];
            OfferResponse::Processed {
                recommendations: vec![OfferRecommendation::Reserve {
                    offer_id: first.id.clone(),
                    agent_id: first.agent_id.clone(),
                    resource: Resource::reserved_scalar("cpus", 3.0, "role", "p", "rid-1"),
                }],
            }
        }
        fn unexpected_first(unused: &[Offer]) -> UnexpectedResourcesResponse {
            if unused.is_empty() {
                return UnexpectedResourcesResponse::Processed { unexpected: vec![] };
            }
            UnexpectedResourcesResponse::Processed {
                unexpected: vec![OfferResources {
                    offer_id: unused[0].id.clone(),
                    agent_id: unused[0].agent_id.clone(),
                    resources: vec![Resource::reserved_scalar("cpus", 1.0, "role", "p", "rid-2")],
                }],
            }
        }

        let client = ScriptedClient::new(consume_first, unexpected_first);
        let driver = Arc::new(RecordingDriver::new());
        let (processor, _) = processor(client, Arc::clone(&driver));

        processor.enqueue(vec![offer("o1"), offer("o2"), offer("o3")]);

        let calls = driver.calls();
        // One accept for the reserve, one accept for the unreserve, one
        // long decline for the leftover offer.
        let accepts: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, DriverCall::Accept { .. }))
            .collect();
        assert_eq!(accepts.len(), 2);
        let DriverCall::Accept { operations, .. } = accepts[0] else { unreachable!() };
        assert!(matches!(operations[0], Operation::Reserve { .. }));
        let DriverCall::Accept { operations, .. } = accepts[1] else { unreachable!() };
        assert!(matches!(operations[0], Operation::Unreserve { .. }));

        let declines = calls
            .iter()
            .filter(|c| matches!(c, DriverCall::Decline { .. }))
            .count();
        assert_eq!(declines, 1);
    }

    #[test]
    fn finished_declines_short_without_cleanup_pass() {
        let client = ScriptedClient::new(|_| OfferResponse::Finished, none_unexpected);
        let driver = Arc::new(RecordingDriver::new());
        let scripted: Arc<Mutex<dyn EventClient>> = client.clone();
        let (processor, _) = processor(scripted, Arc::clone(&driver));

        processor.enqueue(vec![offer("o1"), offer("o2")]);

        let declines = driver
            .calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::Decline { refuse_seconds, .. } if *refuse_seconds == 5.0))
            .count();
        assert_eq!(declines, 2);
        assert_eq!(client.lock().unwrap().unexpected_calls, 0);
    }

    #[test]
    fn uninstalled_tears_down() {
        let client = ScriptedClient::new(|_| OfferResponse::Uninstalled, none_unexpected);
        let driver = Arc::new(RecordingDriver::new());
        let persister: Arc<dyn Persister> = Arc::new(RedbPersister::open_in_memory().unwrap());
        persister.set("/FrameworkID", b"fw").unwrap();

        let scripted: Arc<Mutex<dyn EventClient>> = client.clone();
        let processor = OfferProcessor::new(
            scripted,
            driver.clone(),
            Arc::clone(&persister),
            0,
            false,
        );
        processor.enqueue(vec![offer("o1")]);

        assert!(processor.is_destroyed());
        assert!(driver.calls().contains(&DriverCall::Stop { failover: false }));
        assert_eq!(client.lock().unwrap().unregistered_calls, 1);
        assert!(persister.get("/FrameworkID").is_err());
        assert_eq!(client.lock().unwrap().unexpected_calls, 0);

        // Batches after teardown decline short immediately.
        driver.clear();
        processor.enqueue(vec![offer("o2")]);
        assert!(matches!(
            driver.calls()[0],
            DriverCall::Decline { refuse_seconds, .. } if refuse_seconds == 5.0
        ));
    }

    #[tokio::test]
    async fn bounded_queue_declines_excess() {
        let client = ScriptedClient::new(
            |_| OfferResponse::Processed { recommendations: vec![] },
            none_unexpected,
        );
        let driver = Arc::new(RecordingDriver::new());
        let persister: Arc<dyn Persister> = Arc::new(RedbPersister::open_in_memory().unwrap());
        // Multithreaded but never started: batches pile up in the queue.
        let processor = OfferProcessor::new(
            client,
            Arc::clone(&driver) as _,
            persister,
            2,
            true,
        );

        processor.enqueue(vec![offer("o1")]);
        processor.enqueue(vec![offer("o2")]);
        processor.enqueue(vec![offer("o3")]); // over the bound

        assert_eq!(processor.queued_batches(), 2);
        let declines = driver
            .calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::Decline { refuse_seconds, .. } if *refuse_seconds == 5.0))
            .count();
        assert_eq!(declines, 1);
    }

    #[test]
    fn rescinded_offer_filtered_from_queue_and_batch() {
        let client = ScriptedClient::new(
            |offers| {
                // The rescinded offer must not reach the client.
                assert!(offers.iter().all(|o| o.id != "gone"));
                OfferResponse::Processed { recommendations: vec![] }
            },
            none_unexpected,
        );
        let driver = Arc::new(RecordingDriver::new());
        let (processor, _) = processor(client, Arc::clone(&driver));

        // Not in the queue yet: lands in the rescind set and is filtered
        // when its batch is processed.
        processor.dequeue(&"gone".to_string());
        processor.enqueue(vec![offer("gone"), offer("kept")]);

        // Only the kept offer was declined.
        let declines: Vec<_> = driver
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id, .. } => Some(offer_id),
                _ => None,
            })
            .collect();
        assert_eq!(declines, vec!["kept".to_string()]);
    }
}
