//! Request dispatcher
//!
//! Per-peer state machine for outbound requests:
//!
//! - *Idle*: nothing in flight. An enqueued request is promoted at once.
//! - *Pending*: one request in flight. Further requests wait in a FIFO
//!   queue. A reply, error, timeout or write failure completes it and the
//!   head of the queue is promoted.
//!
//! Disconnect or shutdown drains the pending request and the whole queue
//! with a cancellation error. Completions run on a single callback task,
//! in the order their outcomes were decided.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::pending::{Completion, Delivery, PendingRequest, PendingSlot, QueuedRequest};
use crate::domain::{EndpointError, OcppError, TransportError};
use crate::support::id::{MessageIdGenerator, UuidGenerator};
use crate::support::ocpp_frame::{OcppFrame, MAX_UNIQUE_ID_LEN};

/// Attempts at drawing a unique id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

// ── Configuration ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time a sent request may wait for its reply.
    pub request_timeout: Duration,
    /// Requests queued per peer behind the pending one; 0 means unbounded.
    pub queue_capacity: usize,
    /// Refuse to queue: a send while a request is in flight fails with `Busy`.
    pub reject_when_busy: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            queue_capacity: 0,
            reject_when_busy: false,
        }
    }
}

impl DispatcherConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_reject_when_busy(mut self, reject: bool) -> Self {
        self.reject_when_busy = reject;
        self
    }
}

// ── Transport seam ─────────────────────────────────────────────

/// Where serialized `CALL` frames go.
#[async_trait]
pub trait OutboundTransport: Send + Sync + 'static {
    async fn send_text(&self, peer: &str, text: String) -> Result<(), TransportError>;
}

// ── Dispatcher ─────────────────────────────────────────────────

#[derive(Default)]
struct PeerQueue {
    slot: PendingSlot,
    queue: VecDeque<QueuedRequest>,
}

impl PeerQueue {
    fn is_idle(&self) -> bool {
        !self.slot.is_busy() && self.queue.is_empty()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A promoted request ready to be written.
struct Outgoing {
    peer: String,
    unique_id: String,
    text: String,
    deadline: Instant,
}

/// Snapshot of one peer's dispatcher state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub pending_id: Option<String>,
    pub queued: usize,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    ids: Arc<dyn MessageIdGenerator>,
    transport: Arc<dyn OutboundTransport>,
    peers: Mutex<HashMap<String, PeerQueue>>,
    callbacks: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, transport: Arc<dyn OutboundTransport>) -> Arc<Self> {
        Self::with_id_generator(config, transport, Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(
        config: DispatcherConfig,
        transport: Arc<dyn OutboundTransport>,
        ids: Arc<dyn MessageIdGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ids,
            transport,
            peers: Mutex::new(HashMap::new()),
            callbacks: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerQueue>> {
        // A panic inside a critical section leaves the maps consistent:
        // every mutation is a single insert/remove.
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Enqueue ────────────────────────────────────────────

    /// Queue a request for `peer`. Fails synchronously when the queue is
    /// full, or when busy and queueing is disabled; `completion` is then
    /// dropped without being called.
    pub fn enqueue(
        self: &Arc<Self>,
        peer: &str,
        action: impl Into<String>,
        payload: Value,
        completion: Completion,
    ) -> Result<(), EndpointError> {
        let request = QueuedRequest::new(action, payload, completion);
        let outgoing = {
            let mut peers = self.lock();
            let entry = peers.entry(peer.to_string()).or_default();
            let busy = entry.slot.is_busy();

            if busy && self.config.reject_when_busy {
                return Err(EndpointError::Busy(peer.to_string()));
            }
            if self.config.queue_capacity > 0 && entry.queue.len() >= self.config.queue_capacity {
                return Err(EndpointError::QueueFull(peer.to_string()));
            }

            debug!(
                charge_point_id = peer,
                action = %request.action,
                queued = entry.queue.len(),
                busy,
                "Request enqueued"
            );
            entry.queue.push_back(request);
            self.promote_locked(&mut peers, peer)
        };
        if let Some(outgoing) = outgoing {
            self.spawn_send(outgoing);
        }
        Ok(())
    }

    /// Promote the head of `peer`'s queue if nothing is in flight.
    ///
    /// Requests that cannot be promoted (id exhaustion) are failed and the
    /// next one is tried.
    fn promote_locked(
        self: &Arc<Self>,
        peers: &mut HashMap<String, PeerQueue>,
        peer: &str,
    ) -> Option<Outgoing> {
        loop {
            let busy = peers.get(peer).map(|e| e.slot.is_busy()).unwrap_or(true);
            if busy {
                return None;
            }
            let queued = peers.get_mut(peer)?.queue.pop_front()?;

            let unique_id = match self.unique_id_locked(peers) {
                Some(id) => id,
                None => {
                    warn!(charge_point_id = peer, action = %queued.action, "No unique id available");
                    let mut failed = Delivery::canceled(queued, "no unique id available");
                    failed.result = Err(EndpointError::Ocpp(OcppError::internal(
                        "message id generator kept returning ids in use",
                    )));
                    self.schedule(failed);
                    continue;
                }
            };

            let text = OcppFrame::Call {
                unique_id: unique_id.clone(),
                action: queued.action.clone(),
                payload: queued.payload.clone(),
            }
            .serialize();
            let deadline = Instant::now() + self.config.request_timeout;

            let entry = peers.get_mut(peer)?;
            let request = PendingRequest::from_queued(unique_id.clone(), queued, deadline);
            if let Err(request) = entry.slot.try_start(request) {
                // Checked idle above under the same lock.
                entry.queue.push_front(QueuedRequest {
                    action: request.action,
                    payload: request.payload,
                    completion: request.completion,
                    enqueued_at: request.enqueued_at,
                });
                return None;
            }

            return Some(Outgoing {
                peer: peer.to_string(),
                unique_id,
                text,
                deadline,
            });
        }
    }

    /// Draw an id that no peer currently has in flight.
    fn unique_id_locked(&self, peers: &HashMap<String, PeerQueue>) -> Option<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id();
            let in_use = peers.values().any(|e| e.slot.pending_id() == Some(id.as_str()));
            if !in_use && !id.is_empty() && id.chars().count() <= MAX_UNIQUE_ID_LEN {
                return Some(id);
            }
            debug!(unique_id = %id, "Generated id rejected, drawing another");
        }
        None
    }

    /// Write the frame, then wait out the deadline on the same task.
    fn spawn_send(self: &Arc<Self>, outgoing: Outgoing) {
        let dispatcher = Arc::clone(self);
        let peer = outgoing.peer.clone();
        let unique_id = outgoing.unique_id.clone();

        let task = tokio::spawn(async move {
            let Outgoing {
                peer,
                unique_id,
                text,
                deadline,
            } = outgoing;

            debug!(charge_point_id = %peer, unique_id = %unique_id, "-> {}", text);
            if let Err(e) = dispatcher.transport.send_text(&peer, text).await {
                warn!(charge_point_id = %peer, unique_id = %unique_id, error = %e, "Failed to send request");
                dispatcher.fail_pending(&peer, &unique_id, EndpointError::Transport(e));
                return;
            }

            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            dispatcher.on_timeout(&peer, &unique_id);
        });

        let mut peers = self.lock();
        match peers.get_mut(&peer) {
            Some(entry) => entry.slot.set_timer(&unique_id, task.abort_handle()),
            None => task.abort(),
        }
    }

    // ── Replies ────────────────────────────────────────────

    /// Handle a `CALL_RESULT`. Returns `false` when nothing matched.
    pub fn on_result(self: &Arc<Self>, peer: &str, unique_id: &str, payload: Value) -> bool {
        self.finish(peer, |slot| slot.complete(unique_id, payload))
    }

    /// Handle a `CALL_ERROR`. Returns `false` when nothing matched.
    pub fn on_error(self: &Arc<Self>, peer: &str, unique_id: &str, error: OcppError) -> bool {
        self.finish(peer, |slot| slot.complete_error(unique_id, error))
    }

    /// Fail the pending request `unique_id` with a local error.
    pub fn fail_pending(self: &Arc<Self>, peer: &str, unique_id: &str, error: EndpointError) -> bool {
        self.finish(peer, |slot| slot.cancel(unique_id, error))
    }

    fn on_timeout(self: &Arc<Self>, peer: &str, unique_id: &str) {
        let matched = self.finish(peer, |slot| slot.expire(unique_id));
        if matched {
            warn!(charge_point_id = peer, unique_id, "Request timed out");
        }
    }

    fn finish(
        self: &Arc<Self>,
        peer: &str,
        take: impl FnOnce(&mut PendingSlot) -> Option<Delivery>,
    ) -> bool {
        let (delivery, outgoing) = {
            let mut peers = self.lock();
            let Some(entry) = peers.get_mut(peer) else {
                debug!(charge_point_id = peer, "Reply for unknown peer, discarding");
                return false;
            };
            let Some(delivery) = take(&mut entry.slot) else {
                return false;
            };
            let outgoing = self.promote_locked(&mut peers, peer);
            if peers.get(peer).map(PeerQueue::is_idle).unwrap_or(false) {
                peers.remove(peer);
            }
            (delivery, outgoing)
        };

        self.schedule(delivery);
        if let Some(outgoing) = outgoing {
            self.spawn_send(outgoing);
        }
        true
    }

    // ── Cancellation ───────────────────────────────────────

    /// Drain `peer`'s pending request and queue with a cancellation error.
    pub fn cancel_peer(self: &Arc<Self>, peer: &str, reason: &str) -> usize {
        let entry = self.lock().remove(peer);
        match entry {
            Some(entry) => self.drain(peer, entry, reason),
            None => 0,
        }
    }

    /// Drain every peer; used on shutdown.
    pub fn cancel_all(self: &Arc<Self>, reason: &str) -> usize {
        let drained: Vec<(String, PeerQueue)> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(peer, entry)| self.drain(&peer, entry, reason))
            .sum()
    }

    fn drain(self: &Arc<Self>, peer: &str, mut entry: PeerQueue, reason: &str) -> usize {
        let mut count = 0;
        if let Some(delivery) = entry.slot.take(reason) {
            self.schedule(delivery);
            count += 1;
        }
        for queued in entry.queue.drain(..) {
            self.schedule(Delivery::canceled(queued, reason));
            count += 1;
        }
        if count > 0 {
            info!(charge_point_id = peer, count, reason, "Canceled outstanding requests");
        }
        count
    }

    // ── Introspection ──────────────────────────────────────

    pub fn stats(&self, peer: &str) -> PeerStats {
        let peers = self.lock();
        match peers.get(peer) {
            Some(entry) => PeerStats {
                pending_id: entry.slot.pending_id().map(str::to_string),
                queued: entry.queue.len(),
            },
            None => PeerStats {
                pending_id: None,
                queued: 0,
            },
        }
    }

    pub fn is_pending(&self, peer: &str) -> bool {
        self.stats(peer).pending_id.is_some()
    }

    /// Action of the pending request `unique_id`, if it is still in flight.
    pub fn pending_action(&self, peer: &str, unique_id: &str) -> Option<String> {
        self.lock()
            .get(peer)
            .and_then(|e| e.slot.pending_action(unique_id))
            .map(str::to_string)
    }

    /// Total pending requests across all peers.
    pub fn pending_count(&self) -> usize {
        self.lock().values().filter(|e| e.slot.is_busy()).count()
    }

    // ── Completion delivery ────────────────────────────────

    fn schedule(&self, delivery: Delivery) {
        record_outcome(&delivery);
        let job: Job = Box::new(move || delivery.deliver());
        let tx = self.callbacks.get_or_init(spawn_callback_task);
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            // Callback task is gone (runtime shutting down); run inline.
            job();
        }
    }
}

fn spawn_callback_task() -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job();
        }
    });
    tx
}

fn record_outcome(delivery: &Delivery) {
    let action = delivery.action.clone();
    let outcome = delivery.outcome();
    metrics::counter!("ocppj_requests_total", "action" => action.clone(), "outcome" => outcome)
        .increment(1);
    if outcome == "timeout" {
        metrics::counter!("ocppj_request_timeouts_total", "action" => action.clone()).increment(1);
    }
    metrics::histogram!("ocppj_request_latency_seconds", "action" => action)
        .record(delivery.enqueued_at.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::id::SequentialGenerator;
    use crate::support::ocpp_frame::OcppFrame;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Records every frame written, per peer.
    struct MockTransport {
        sent: UnboundedSender<(String, OcppFrame)>,
        fail: bool,
    }

    #[async_trait]
    impl OutboundTransport for MockTransport {
        async fn send_text(&self, peer: &str, text: String) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            let frame = OcppFrame::parse(&text).unwrap();
            self.sent.send((peer.to_string(), frame)).unwrap();
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        sent: UnboundedReceiver<(String, OcppFrame)>,
        results: UnboundedReceiver<(u32, Result<Value, EndpointError>)>,
        results_tx: UnboundedSender<(u32, Result<Value, EndpointError>)>,
    }

    impl Harness {
        fn new(config: DispatcherConfig) -> Self {
            Self::with_transport(config, false)
        }

        fn with_transport(config: DispatcherConfig, fail: bool) -> Self {
            let (sent_tx, sent) = unbounded_channel();
            let (results_tx, results) = unbounded_channel();
            let dispatcher = Dispatcher::with_id_generator(
                config,
                Arc::new(MockTransport { sent: sent_tx, fail }),
                Arc::new(SequentialGenerator::new("T")),
            );
            Self {
                dispatcher,
                sent,
                results,
                results_tx,
            }
        }

        fn send(&self, peer: &str, tag: u32, action: &str) -> Result<(), EndpointError> {
            let tx = self.results_tx.clone();
            self.dispatcher.enqueue(
                peer,
                action,
                json!({}),
                Box::new(move |result| {
                    let _ = tx.send((tag, result));
                }),
            )
        }

        async fn next_sent(&mut self) -> (String, OcppFrame) {
            tokio::time::timeout(Duration::from_secs(1), self.sent.recv())
                .await
                .expect("frame written")
                .unwrap()
        }

        async fn next_result(&mut self) -> (u32, Result<Value, EndpointError>) {
            tokio::time::timeout(Duration::from_secs(2), self.results.recv())
                .await
                .expect("completion delivered")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn fifo_one_in_flight() {
        let mut h = Harness::new(DispatcherConfig::default());
        h.send("CS001", 1, "BootNotification").unwrap();
        h.send("CS001", 2, "Authorize").unwrap();
        h.send("CS001", 3, "Heartbeat").unwrap();

        let (_, first) = h.next_sent().await;
        assert!(matches!(&first, OcppFrame::Call { action, .. } if action == "BootNotification"));
        // Nothing else may be written while the first is pending.
        assert!(h.sent.try_recv().is_err());
        assert_eq!(h.dispatcher.stats("CS001").queued, 2);

        for expected in ["Authorize", "Heartbeat"] {
            let id = h.dispatcher.stats("CS001").pending_id.unwrap();
            assert!(h.dispatcher.on_result("CS001", &id, json!({})));
            let (_, frame) = h.next_sent().await;
            assert!(matches!(&frame, OcppFrame::Call { action, .. } if action == expected));
        }
        let id = h.dispatcher.stats("CS001").pending_id.unwrap();
        h.dispatcher.on_result("CS001", &id, json!({}));

        let order: Vec<u32> = vec![
            h.next_result().await.0,
            h.next_result().await.0,
            h.next_result().await.0,
        ];
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(h.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_delivered_exactly_once() {
        let mut h = Harness::new(DispatcherConfig::default());
        h.send("CS001", 1, "Heartbeat").unwrap();
        let (_, frame) = h.next_sent().await;
        let id = frame.unique_id().to_string();

        assert!(h.dispatcher.on_result("CS001", &id, json!({"currentTime": "2024-01-01T00:00:00Z"})));
        assert!(!h.dispatcher.on_result("CS001", &id, json!({})));
        assert!(!h.dispatcher.on_error("CS001", &id, OcppError::internal("dup")));

        let (tag, result) = h.next_result().await;
        assert_eq!(tag, 1);
        assert_eq!(result.unwrap()["currentTime"], "2024-01-01T00:00:00Z");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.results.try_recv().is_err());
    }

    #[tokio::test]
    async fn call_error_reaches_caller() {
        let mut h = Harness::new(DispatcherConfig::default());
        h.send("CS001", 1, "MadeUpAction").unwrap();
        let (_, frame) = h.next_sent().await;
        h.dispatcher
            .on_error("CS001", frame.unique_id(), OcppError::not_implemented("MadeUpAction"));
        let (_, result) = h.next_result().await;
        assert_eq!(
            result.unwrap_err().code(),
            Some(crate::domain::OcppErrorCode::NotImplemented)
        );
    }

    #[tokio::test]
    async fn timeout_then_late_reply_discarded() {
        let mut h = Harness::new(
            DispatcherConfig::default().with_request_timeout(Duration::from_millis(50)),
        );
        h.send("CS001", 1, "Heartbeat").unwrap();
        let (_, frame) = h.next_sent().await;

        let (_, result) = h.next_result().await;
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "GenericError: request timed out");
        assert!(!h.dispatcher.is_pending("CS001"));

        assert!(!h.dispatcher.on_result("CS001", frame.unique_id(), json!({})));

        // A subsequent send goes out normally.
        h.send("CS001", 2, "Heartbeat").unwrap();
        let (_, frame) = h.next_sent().await;
        assert!(h.dispatcher.on_result("CS001", frame.unique_id(), json!({})));
        assert_eq!(h.next_result().await.0, 2);
        assert!(h.results.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_full_is_synchronous() {
        let h = Harness::new(DispatcherConfig::default().with_queue_capacity(1));
        h.send("CS001", 1, "Heartbeat").unwrap();
        h.send("CS001", 2, "Heartbeat").unwrap();
        let err = h.send("CS001", 3, "Heartbeat").unwrap_err();
        assert_eq!(err, EndpointError::QueueFull("CS001".into()));
    }

    #[tokio::test]
    async fn busy_when_queueing_disabled() {
        let h = Harness::new(DispatcherConfig::default().with_reject_when_busy(true));
        h.send("CS001", 1, "BootNotification").unwrap();
        let err = h.send("CS001", 2, "Authorize").unwrap_err();
        assert_eq!(err, EndpointError::Busy("CS001".into()));
        // Other peers are independent.
        assert!(h.send("CS002", 3, "Authorize").is_ok());
    }

    #[tokio::test]
    async fn cancel_peer_drains_pending_and_queue() {
        let mut h = Harness::new(DispatcherConfig::default());
        for tag in 1..=3 {
            h.send("CS001", tag, "Heartbeat").unwrap();
        }
        h.send("CS002", 9, "Heartbeat").unwrap();
        h.next_sent().await;

        assert_eq!(h.dispatcher.cancel_peer("CS001", "disconnected"), 3);
        let mut tags = Vec::new();
        for _ in 0..3 {
            let (tag, result) = h.next_result().await;
            assert!(matches!(result, Err(EndpointError::Canceled { .. })));
            tags.push(tag);
        }
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(h.dispatcher.is_pending("CS002"));
    }

    #[tokio::test]
    async fn write_failure_fails_request_and_promotes_next() {
        let mut h = Harness::with_transport(DispatcherConfig::default(), true);
        h.send("CS001", 1, "Heartbeat").unwrap();
        h.send("CS001", 2, "Heartbeat").unwrap();
        for expected in [1, 2] {
            let (tag, result) = h.next_result().await;
            assert_eq!(tag, expected);
            assert_eq!(
                result.unwrap_err(),
                EndpointError::Transport(TransportError::NotConnected)
            );
        }
        assert_eq!(h.dispatcher.pending_count(), 0);
    }

    struct RepeatingGenerator;

    impl MessageIdGenerator for RepeatingGenerator {
        fn next_id(&self) -> String {
            "same".to_string()
        }
    }

    #[tokio::test]
    async fn ids_are_unique_across_peers() {
        let (sent_tx, mut sent) = unbounded_channel();
        let (tx, mut results) = unbounded_channel();
        let dispatcher = Dispatcher::with_id_generator(
            DispatcherConfig::default(),
            Arc::new(MockTransport {
                sent: sent_tx,
                fail: false,
            }),
            Arc::new(RepeatingGenerator),
        );
        let tx2 = tx.clone();
        dispatcher
            .enqueue("A", "Heartbeat", json!({}), Box::new(move |r| drop(tx.send(r))))
            .unwrap();
        dispatcher
            .enqueue("B", "Heartbeat", json!({}), Box::new(move |r| drop(tx2.send(r))))
            .unwrap();

        let (_, frame) = sent.recv().await.unwrap();
        assert_eq!(frame.unique_id(), "same");
        let result = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result.unwrap_err().code(),
            Some(crate::domain::OcppErrorCode::InternalError)
        );
    }
}
