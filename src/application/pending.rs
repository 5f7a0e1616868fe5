//! Pending-request slot
//!
//! Holds the single request in flight to one peer. A reply, an error, a
//! timeout or a cancellation each take the request out of the slot, so
//! whichever comes first wins and the rest find nothing to complete.

use std::time::Instant;

use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::domain::{EndpointError, OcppError};

/// Receives the outcome of one request. Invoked exactly once.
pub type Completion = Box<dyn FnOnce(Result<Value, EndpointError>) + Send + 'static>;

/// A request waiting in a peer queue.
pub struct QueuedRequest {
    pub action: String,
    pub payload: Value,
    pub completion: Completion,
    pub enqueued_at: Instant,
}

impl QueuedRequest {
    pub fn new(action: impl Into<String>, payload: Value, completion: Completion) -> Self {
        Self {
            action: action.into(),
            payload,
            completion,
            enqueued_at: Instant::now(),
        }
    }
}

/// A request that has been sent and awaits its reply.
pub struct PendingRequest {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
    pub deadline: Instant,
    pub enqueued_at: Instant,
    pub completion: Completion,
    /// Write-then-timeout task for this request.
    pub timer: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn from_queued(unique_id: String, queued: QueuedRequest, deadline: Instant) -> Self {
        Self {
            unique_id,
            action: queued.action,
            payload: queued.payload,
            deadline,
            enqueued_at: queued.enqueued_at,
            completion: queued.completion,
            timer: None,
        }
    }

    fn into_delivery(self, result: Result<Value, EndpointError>, stop_timer: bool) -> Delivery {
        if stop_timer {
            if let Some(timer) = &self.timer {
                timer.abort();
            }
        }
        Delivery {
            unique_id: self.unique_id,
            action: self.action,
            enqueued_at: self.enqueued_at,
            completion: self.completion,
            result,
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("unique_id", &self.unique_id)
            .field("action", &self.action)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// An outcome taken out of a slot or queue, to be handed to its
/// completion once no lock is held.
pub struct Delivery {
    pub unique_id: String,
    pub action: String,
    pub enqueued_at: Instant,
    pub completion: Completion,
    pub result: Result<Value, EndpointError>,
}

impl Delivery {
    pub fn canceled(queued: QueuedRequest, reason: &str) -> Self {
        Self {
            unique_id: String::new(),
            result: Err(EndpointError::Canceled {
                action: queued.action.clone(),
                reason: reason.to_string(),
            }),
            action: queued.action,
            enqueued_at: queued.enqueued_at,
            completion: queued.completion,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match &self.result {
            Ok(_) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(EndpointError::Ocpp(_)) => "call_error",
            Err(EndpointError::Canceled { .. }) => "canceled",
            Err(_) => "failed",
        }
    }

    pub fn deliver(self) {
        (self.completion)(self.result)
    }
}

// ── PendingSlot ────────────────────────────────────────────────

/// The one-in-flight slot of a peer.
#[derive(Debug, Default)]
pub struct PendingSlot {
    current: Option<PendingRequest>,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn pending_id(&self) -> Option<&str> {
        self.current.as_ref().map(|p| p.unique_id.as_str())
    }

    pub fn pending_action(&self, unique_id: &str) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|p| p.unique_id == unique_id)
            .map(|p| p.action.as_str())
    }

    /// Occupy the slot. Hands the request back when already busy.
    pub fn try_start(&mut self, request: PendingRequest) -> Result<(), PendingRequest> {
        if self.current.is_some() {
            return Err(request);
        }
        self.current = Some(request);
        Ok(())
    }

    pub fn set_timer(&mut self, unique_id: &str, timer: AbortHandle) {
        match self.current.as_mut() {
            Some(p) if p.unique_id == unique_id => p.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    fn take_matching(&mut self, unique_id: &str) -> Option<PendingRequest> {
        match &self.current {
            Some(p) if p.unique_id == unique_id => self.current.take(),
            Some(p) => {
                debug!(unique_id, pending = %p.unique_id, "Reply does not match pending request, discarding");
                None
            }
            None => {
                debug!(unique_id, "Reply with no pending request, discarding");
                None
            }
        }
    }

    /// Match a `CALL_RESULT`.
    pub fn complete(&mut self, unique_id: &str, payload: Value) -> Option<Delivery> {
        self.take_matching(unique_id)
            .map(|p| p.into_delivery(Ok(payload), true))
    }

    /// Match a `CALL_ERROR`.
    pub fn complete_error(&mut self, unique_id: &str, error: OcppError) -> Option<Delivery> {
        self.take_matching(unique_id)
            .map(|p| p.into_delivery(Err(EndpointError::Ocpp(error)), true))
    }

    /// Fail the matching request with a local error (timeout, bad reply,
    /// write failure).
    pub fn cancel(&mut self, unique_id: &str, reason: EndpointError) -> Option<Delivery> {
        self.take_matching(unique_id)
            .map(|p| p.into_delivery(Err(reason), true))
    }

    /// Fire the timeout for `unique_id`. Called from the request's own
    /// timer task, which therefore is not aborted.
    pub fn expire(&mut self, unique_id: &str) -> Option<Delivery> {
        self.take_matching(unique_id)
            .map(|p| p.into_delivery(Err(EndpointError::Ocpp(OcppError::timeout())), false))
    }

    /// Fail whatever is pending, regardless of id (disconnect, shutdown).
    pub fn take(&mut self, reason: &str) -> Option<Delivery> {
        self.current.take().map(|p| {
            let err = EndpointError::Canceled {
                action: p.action.clone(),
                reason: reason.to_string(),
            };
            p.into_delivery(Err(err), true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<Result<Value, EndpointError>>>>;

    fn pending(id: &str, log: &Log) -> PendingRequest {
        let log = log.clone();
        let queued = QueuedRequest::new(
            "Heartbeat",
            serde_json::json!({}),
            Box::new(move |result| log.lock().unwrap().push(result)),
        );
        PendingRequest::from_queued(id.to_string(), queued, Instant::now() + Duration::from_secs(30))
    }

    #[test]
    fn try_start_rejects_second_request() {
        let log = Log::default();
        let mut slot = PendingSlot::new();
        assert!(slot.try_start(pending("a", &log)).is_ok());
        let rejected = slot.try_start(pending("b", &log)).unwrap_err();
        assert_eq!(rejected.unique_id, "b");
        assert_eq!(slot.pending_id(), Some("a"));
    }

    #[test]
    fn complete_delivers_once() {
        let log = Log::default();
        let mut slot = PendingSlot::new();
        slot.try_start(pending("a", &log)).unwrap();

        slot.complete("a", serde_json::json!({"ok": true})).unwrap().deliver();
        assert!(slot.complete("a", serde_json::json!({})).is_none());
        assert!(slot.complete_error("a", OcppError::internal("late")).is_none());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].as_ref().unwrap()["ok"], true);
    }

    #[test]
    fn mismatched_id_is_discarded() {
        let log = Log::default();
        let mut slot = PendingSlot::new();
        slot.try_start(pending("a", &log)).unwrap();
        assert!(slot.complete("zzz", serde_json::json!({})).is_none());
        assert!(slot.is_busy());
    }

    #[test]
    fn expire_then_late_reply() {
        let log = Log::default();
        let mut slot = PendingSlot::new();
        slot.try_start(pending("a", &log)).unwrap();

        let delivery = slot.expire("a").unwrap();
        assert_eq!(delivery.outcome(), "timeout");
        delivery.deliver();
        assert!(slot.complete("a", serde_json::json!({})).is_none());

        let log = log.lock().unwrap();
        assert!(log[0].as_ref().unwrap_err().is_timeout());
    }

    #[test]
    fn take_cancels_regardless_of_id() {
        let log = Log::default();
        let mut slot = PendingSlot::new();
        slot.try_start(pending("a", &log)).unwrap();
        slot.take("disconnected").unwrap().deliver();
        assert!(!slot.is_busy());
        let log = log.lock().unwrap();
        assert!(matches!(
            log[0].as_ref().unwrap_err(),
            EndpointError::Canceled { reason, .. } if reason == "disconnected"
        ));
    }
}
