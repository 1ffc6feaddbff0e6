//! In-memory delivery queue drained by a single sequential worker.
//!
//! Items are attempted strictly in enqueue order. A failing head item is
//! retried with backoff and blocks everything behind it until it is either
//! delivered or dropped. Nothing is persisted: the queue lives as long as the
//! pipeline instance that owns it.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use watch_common::event::CandidateEvent;
use watch_common::retry::RetryPolicy;

use crate::sink::TransportSink;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting for its turn, or for its backoff to elapse.
    Pending,
    /// A delivery attempt is running.
    InFlight,
}

/// Terminal state of a queue item. Emitted once per item, when it leaves the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        id: u64,
        subject_id: String,
        attempts: u32,
    },
    Dropped {
        id: u64,
        subject_id: String,
        attempts: u32,
    },
}

impl DeliveryOutcome {
    pub fn id(&self) -> u64 {
        match self {
            DeliveryOutcome::Delivered { id, .. } | DeliveryOutcome::Dropped { id, .. } => *id,
        }
    }
}

/// A point-in-time view of one queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItemView {
    pub id: u64,
    pub subject_id: String,
    pub attempt_count: u32,
    pub state: ItemState,
}

struct QueueItem {
    id: u64,
    event: CandidateEvent,
    /// Failed delivery attempts so far.
    attempt_count: u32,
    state: ItemState,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Set while a worker task is draining the queue.
    busy: bool,
    next_id: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    sink: Arc<dyn TransportSink + Send + Sync>,
    retry_policy: RetryPolicy,
    outcomes: broadcast::Sender<DeliveryOutcome>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the head item in flight and hand out its event, or release the
    /// busy flag when there is nothing left. Both happen under the same lock
    /// as `enqueue`, so an enqueue can never observe a busy worker that is
    /// about to exit.
    fn begin_head(&self) -> Option<(u64, CandidateEvent)> {
        let mut state = self.lock();
        match state.items.front_mut() {
            Some(item) => {
                item.state = ItemState::InFlight;
                Some((item.id, item.event.clone()))
            }
            None => {
                state.busy = false;
                None
            }
        }
    }

    fn complete_head(&self) -> Option<QueueItem> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        metrics::gauge!("watch_queue_depth").set(state.items.len() as f64);
        item
    }

    /// Record a failed attempt on the head item and return its failure count.
    fn fail_head(&self) -> u32 {
        let mut state = self.lock();
        match state.items.front_mut() {
            Some(item) => {
                item.attempt_count += 1;
                item.state = ItemState::Pending;
                item.attempt_count
            }
            None => 0,
        }
    }

    fn publish(&self, outcome: DeliveryOutcome) {
        if self.outcomes.send(outcome).is_err() {
            debug!("no outcome subscribers");
        }
    }
}

/// Single-consumer FIFO queue of accepted events.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    pub fn new(sink: Arc<dyn TransportSink + Send + Sync>, retry_policy: RetryPolicy) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                sink,
                retry_policy,
                outcomes,
            }),
        }
    }

    /// Append an event to the tail of the queue and start the worker if it is idle.
    /// Returns the id of the new queue item.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, event: CandidateEvent) -> u64 {
        let (id, start_worker) = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.items.push_back(QueueItem {
                id,
                event,
                attempt_count: 0,
                state: ItemState::Pending,
            });
            metrics::gauge!("watch_queue_depth").set(state.items.len() as f64);

            let start_worker = !state.busy;
            state.busy = true;
            (id, start_worker)
        };

        if start_worker {
            tokio::spawn(drain(self.shared.clone()));
        }

        id
    }

    /// Current queue contents, head first.
    pub fn snapshot(&self) -> Vec<QueueItemView> {
        self.shared
            .lock()
            .items
            .iter()
            .map(|item| QueueItemView {
                id: item.id,
                subject_id: item.event.subject_id().to_owned(),
                attempt_count: item.attempt_count,
                state: item.state,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a worker task is currently draining the queue.
    pub fn is_busy(&self) -> bool {
        self.shared.lock().busy
    }

    /// Subscribe to terminal outcomes of items enqueued from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.shared.outcomes.subscribe()
    }
}

/// Releases the busy flag when a worker is torn down mid-item, as when the
/// sink panics, so the next `enqueue` starts a fresh worker. The interrupted
/// head item stays at the front as `Pending`.
struct WorkerGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut state = self.shared.lock();
        state.busy = false;
        if let Some(item) = state.items.front_mut() {
            item.state = ItemState::Pending;
        }
        error!("delivery worker stopped unexpectedly, {} events left in queue", state.items.len());
    }
}

/// Worker loop. Exactly one runs per queue at a time, guarded by `QueueState::busy`.
async fn drain(shared: Arc<Shared>) {
    let mut guard = WorkerGuard {
        shared: shared.clone(),
        finished: false,
    };

    while let Some((id, event)) = shared.begin_head() {
        let started = Instant::now();
        let result = shared.sink.deliver(&event).await;
        metrics::histogram!("watch_delivery_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("watch_delivery_attempts_total", "result" => "success")
                    .increment(1);

                let attempts = shared
                    .complete_head()
                    .map(|item| item.attempt_count + 1)
                    .unwrap_or(1);

                metrics::counter!("watch_events_delivered_total").increment(1);
                info!(subject_id = event.subject_id(), attempts, "delivered event");

                shared.publish(DeliveryOutcome::Delivered {
                    id,
                    subject_id: event.subject_id().to_owned(),
                    attempts,
                });
            }
            Err(err) => {
                metrics::counter!("watch_delivery_attempts_total", "result" => "failure")
                    .increment(1);

                let attempts = shared.fail_head();
                warn!(
                    subject_id = event.subject_id(),
                    attempt = attempts,
                    "delivery attempt failed: {}",
                    err
                );

                if shared.retry_policy.is_exhausted(attempts) {
                    drop(shared.complete_head());

                    metrics::counter!("watch_events_dropped_total").increment(1);
                    error!(
                        subject_id = event.subject_id(),
                        attempts, "dropping event after exhausting delivery attempts"
                    );

                    shared.publish(DeliveryOutcome::Dropped {
                        id,
                        subject_id: event.subject_id().to_owned(),
                        attempts,
                    });
                } else {
                    tokio::time::sleep(shared.retry_policy.retry_interval(attempts)).await;
                }
            }
        }
    }

    // `begin_head` already cleared the busy flag under the lock.
    guard.finished = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn event(subject_id: &str) -> CandidateEvent {
        CandidateEvent::new(
            subject_id,
            0,
            &format!("https://www.youtube.com/watch?v={}", subject_id),
            BTreeMap::from([("title".to_owned(), format!("title of {}", subject_id))]),
        )
        .unwrap()
    }

    /// Sink that replays a script of results (success once the script runs out),
    /// records every call, and tracks how many calls overlap.
    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<(String, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedSink {
        fn with_script(script: &[bool]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        fn subjects(&self) -> Vec<String> {
            self.calls().into_iter().map(|(subject, _)| subject).collect()
        }
    }

    #[async_trait]
    impl TransportSink for ScriptedSink {
        async fn deliver(&self, event: &CandidateEvent) -> Result<(), DeliveryError> {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((event.subject_id().to_owned(), Instant::now()));

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            // Give any concurrent worker a chance to overlap with us.
            tokio::time::sleep(Duration::from_millis(10)).await;

            let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if succeed {
                Ok(())
            } else {
                Err(DeliveryError::BadStatus(StatusCode::SERVICE_UNAVAILABLE))
            }
        }
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
        rx.recv().await.expect("outcome channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_enqueue_order() {
        let sink = Arc::new(ScriptedSink::default());
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        for subject in ["a", "b", "c"] {
            queue.enqueue(event(subject));
        }

        for expected in ["a", "b", "c"] {
            match next_outcome(&mut outcomes).await {
                DeliveryOutcome::Delivered {
                    subject_id,
                    attempts,
                    ..
                } => {
                    assert_eq!(subject_id, expected);
                    assert_eq!(attempts, 1);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(sink.subjects(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_until_delivered() {
        let sink = Arc::new(ScriptedSink::with_script(&[false, false, false, false, true]));
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        let id = queue.enqueue(event("abc123"));

        assert_eq!(
            next_outcome(&mut outcomes).await,
            DeliveryOutcome::Delivered {
                id,
                subject_id: "abc123".to_owned(),
                attempts: 5,
            }
        );

        // Each attempt takes 10ms in the sink, on top of the backoff.
        let calls = sink.calls();
        assert_eq!(calls.len(), 5);
        let gaps: Vec<u128> = calls
            .windows(2)
            .map(|pair| (pair[1].1 - pair[0].1).as_millis() - 10)
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000]);
        assert_eq!(gaps.iter().sum::<u128>(), 15000);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drops_after_max_attempts_and_moves_on() {
        let sink = Arc::new(ScriptedSink::with_script(&[false; 5]));
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        let dropped = queue.enqueue(event("doomed"));
        let next = queue.enqueue(event("fine"));

        assert_eq!(
            next_outcome(&mut outcomes).await,
            DeliveryOutcome::Dropped {
                id: dropped,
                subject_id: "doomed".to_owned(),
                attempts: 5,
            }
        );
        assert_eq!(
            next_outcome(&mut outcomes).await,
            DeliveryOutcome::Delivered {
                id: next,
                subject_id: "fine".to_owned(),
                attempts: 1,
            }
        );

        assert_eq!(
            sink.subjects(),
            vec!["doomed", "doomed", "doomed", "doomed", "doomed", "fine"]
        );

        // No backoff after the final failure: the next item goes right away.
        let calls = sink.calls();
        assert_eq!((calls[5].1 - calls[4].1).as_millis(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn head_of_line_blocks_later_items() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(ScriptedSink::gated(gate.clone()));
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        let first = queue.enqueue(event("first"));
        tokio::task::yield_now().await;
        let second = queue.enqueue(event("second"));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, first);
        assert_eq!(snapshot[0].state, ItemState::InFlight);
        assert_eq!(snapshot[1].id, second);
        assert_eq!(snapshot[1].state, ItemState::Pending);
        assert_eq!(sink.subjects(), vec!["first"]);

        gate.add_permits(2);

        assert_eq!(next_outcome(&mut outcomes).await.id(), first);
        assert_eq!(next_outcome(&mut outcomes).await.id(), second);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_head_keeps_others_pending() {
        let sink = Arc::new(ScriptedSink::with_script(&[false, true]));
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        queue.enqueue(event("head"));
        queue.enqueue(event("tail"));

        // Inside the first backoff window.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].attempt_count, 1);
        assert_eq!(snapshot[0].state, ItemState::Pending);
        assert_eq!(snapshot[1].attempt_count, 0);
        assert_eq!(snapshot[1].state, ItemState::Pending);
        assert_eq!(sink.subjects(), vec!["head"]);

        next_outcome(&mut outcomes).await;
        next_outcome(&mut outcomes).await;
        assert_eq!(sink.subjects(), vec!["head", "head", "tail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_attempt_in_flight() {
        let script: Vec<bool> = (0..20).map(|i| i % 3 != 0).collect();
        let sink = Arc::new(ScriptedSink::with_script(&script));
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        for i in 0..10 {
            queue.enqueue(event(&format!("subject-{}", i)));
            tokio::task::yield_now().await;
        }

        for _ in 0..10 {
            next_outcome(&mut outcomes).await;
        }

        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_goes_idle_and_restarts() {
        let sink = Arc::new(ScriptedSink::default());
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        queue.enqueue(event("one"));
        next_outcome(&mut outcomes).await;
        tokio::task::yield_now().await;
        assert!(!queue.is_busy());

        queue.enqueue(event("two"));
        assert!(queue.is_busy());
        next_outcome(&mut outcomes).await;

        assert_eq!(sink.subjects(), vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_without_outcome_subscribers() {
        let sink = Arc::new(ScriptedSink::default());
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());

        queue.enqueue(event("alone"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.subjects(), vec!["alone"]);
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
    }

    /// Panics on its first call, delivers afterwards.
    #[derive(Default)]
    struct PanickingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransportSink for PanickingSink {
        async fn deliver(&self, _event: &CandidateEvent) -> Result<(), DeliveryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sink failed hard");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_restarts_after_sink_panic() {
        let sink = Arc::new(PanickingSink::default());
        let queue = DeliveryQueue::new(sink.clone(), RetryPolicy::default());
        let mut outcomes = queue.subscribe();

        queue.enqueue(event("first"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!queue.is_busy());
        let pending = queue.snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, ItemState::Pending);

        queue.enqueue(event("second"));
        for expected in ["first", "second"] {
            match next_outcome(&mut outcomes).await {
                DeliveryOutcome::Delivered { subject_id, .. } => assert_eq!(subject_id, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
    }
}
