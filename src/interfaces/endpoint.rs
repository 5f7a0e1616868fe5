//! Endpoint core shared by both facades
//!
//! Text frames from the transport land in [`Endpoint::handle_text`].
//! Inbound calls run on one worker task per peer, so a peer's calls are
//! answered in arrival order while replies to our own requests are
//! matched immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::inbound::InboundRouter;
use super::ErrorSink;
use crate::application::ports::InboundCall;
use crate::application::{Dispatcher, DispatcherConfig, OutboundTransport};
use crate::domain::{EndpointError, FeatureRegistry, OcppRequest, OcppVersion, Role, TransportError};
use crate::support::id::{MessageIdGenerator, UuidGenerator};
use crate::support::ocpp_frame::{FrameError, OcppFrame};
use crate::support::validation::Validator;

enum Job {
    Call(InboundCall),
    /// Pre-rendered frame, e.g. a `CALL_ERROR` for a malformed message.
    Reply(String),
}

pub(crate) struct Endpoint {
    role: Role,
    registry: Arc<FeatureRegistry>,
    validator: Validator,
    dispatcher: Arc<Dispatcher>,
    router: InboundRouter,
    transport: Arc<dyn OutboundTransport>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    /// Connection serial of each peer's live session.
    sessions: Mutex<HashMap<String, u64>>,
    errors: Arc<ErrorSink>,
}

impl Endpoint {
    pub(crate) fn new(
        role: Role,
        registry: Arc<FeatureRegistry>,
        validator: Validator,
        dispatcher_config: DispatcherConfig,
        ids: Option<Arc<dyn MessageIdGenerator>>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Arc<Self> {
        let ids = ids.unwrap_or_else(|| Arc::new(UuidGenerator));
        let dispatcher =
            Dispatcher::with_id_generator(dispatcher_config, Arc::clone(&transport), ids);
        Arc::new(Self {
            role,
            router: InboundRouter::new(role, Arc::clone(&registry), validator.clone()),
            registry,
            validator,
            dispatcher,
            transport,
            workers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            errors: Arc::new(ErrorSink::new()),
        })
    }

    pub(crate) fn router(&self) -> &InboundRouter {
        &self.router
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub(crate) fn version(&self) -> OcppVersion {
        self.registry.version()
    }

    pub(crate) fn errors(&self) -> Option<mpsc::Receiver<EndpointError>> {
        self.errors.take()
    }

    pub(crate) fn push_error(&self, error: EndpointError) {
        self.errors.push(error);
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Job>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Outbound ───────────────────────────────────────────

    /// Queue `request` for `peer`; `callback` runs once with the typed
    /// response or the failure.
    pub(crate) fn send_async<R, F>(
        &self,
        peer: &str,
        request: R,
        callback: F,
    ) -> Result<(), EndpointError>
    where
        R: OcppRequest,
        F: FnOnce(Result<R::Response, EndpointError>) + Send + 'static,
    {
        if !self.registry.can_send(self.role, R::ACTION) {
            return Err(EndpointError::UnsupportedAction {
                action: R::ACTION.to_string(),
                role: self.role.as_str(),
            });
        }
        let payload = self.validator.encode(&request)?;
        let validator = self.validator.clone();

        self.dispatcher.enqueue(
            peer,
            R::ACTION,
            payload,
            Box::new(move |result: Result<Value, EndpointError>| {
                let typed = result.and_then(|value| {
                    validator
                        .decode::<R::Response>(value)
                        .map_err(EndpointError::InvalidResponse)
                });
                callback(typed);
            }),
        )
    }

    pub(crate) async fn send<R: OcppRequest>(
        &self,
        peer: &str,
        request: R,
    ) -> Result<R::Response, EndpointError> {
        let (tx, rx) = oneshot::channel();
        self.send_async(peer, request, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| EndpointError::Canceled {
            action: R::ACTION.to_string(),
            reason: "request dropped".to_string(),
        })?
    }

    // ── Inbound ────────────────────────────────────────────

    pub(crate) fn handle_text(self: &Arc<Self>, peer: &str, text: String) {
        match OcppFrame::parse(&text) {
            Ok(OcppFrame::Call {
                unique_id,
                action,
                payload,
            }) => {
                debug!(charge_point_id = peer, unique_id = %unique_id, action = %action, "CALL received");
                self.submit(
                    peer,
                    Job::Call(InboundCall {
                        station_id: peer.to_string(),
                        unique_id,
                        action,
                        payload,
                    }),
                );
            }
            Ok(OcppFrame::CallResult { unique_id, payload }) => {
                self.handle_result(peer, &unique_id, payload);
            }
            Ok(frame @ OcppFrame::CallError { .. }) => {
                let Some(error) = frame.as_ocpp_error() else {
                    return;
                };
                if !self.dispatcher.on_error(peer, frame.unique_id(), error) {
                    debug!(
                        charge_point_id = peer,
                        unique_id = frame.unique_id(),
                        "Ignoring CALL_ERROR with no pending request"
                    );
                }
            }
            Err(e) => self.handle_frame_error(peer, e),
        }
    }

    fn handle_result(&self, peer: &str, unique_id: &str, payload: Value) {
        let feature = self
            .dispatcher
            .pending_action(peer, unique_id)
            .and_then(|action| self.registry.resolve(&action).map(|(_, f)| f));

        if let Some(feature) = feature {
            if let Err(e) = feature.check_response(&self.validator, &payload) {
                warn!(charge_point_id = peer, unique_id, "Invalid {}: {}", feature.response_type(), e);
                self.dispatcher
                    .fail_pending(peer, unique_id, EndpointError::InvalidResponse(e));
                return;
            }
        }

        if !self.dispatcher.on_result(peer, unique_id, payload) {
            debug!(charge_point_id = peer, unique_id, "Ignoring CALL_RESULT with no pending request");
        }
    }

    fn handle_frame_error(self: &Arc<Self>, peer: &str, e: FrameError) {
        let error = e.to_ocpp_error();
        warn!(charge_point_id = peer, "Malformed OCPP message: {}", e);
        self.errors.push(EndpointError::Ocpp(error.clone()));

        let Some(unique_id) = e.unique_id else {
            return;
        };
        let is_reply = matches!(e.message_type, Some(3) | Some(4));
        if is_reply && self.dispatcher.pending_action(peer, &unique_id).is_some() {
            self.dispatcher
                .fail_pending(peer, &unique_id, EndpointError::InvalidResponse(error));
            return;
        }

        let frame = OcppFrame::error_response(unique_id, &error, self.version());
        self.submit(peer, Job::Reply(frame.serialize()));
    }

    /// Hand a job to `peer`'s worker, starting one if needed.
    fn submit(self: &Arc<Self>, peer: &str, job: Job) {
        let mut workers = self.workers();
        let sender = workers.entry(peer.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let endpoint = Arc::clone(self);
            let peer = peer.to_string();
            tokio::spawn(async move { endpoint.run_worker(peer, rx).await });
            tx
        });
        if let Err(mpsc::error::SendError(_)) = sender.send(job) {
            warn!(charge_point_id = peer, "Inbound worker is gone, dropping message");
            workers.remove(peer);
        }
    }

    async fn run_worker(self: Arc<Self>, peer: String, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let text = match job {
                Job::Call(call) => self.answer(call).await,
                Job::Reply(text) => text,
            };
            if let Err(e) = self.transport.send_text(&peer, text).await {
                warn!(charge_point_id = %peer, "Failed to send reply: {}", e);
                self.errors.push(EndpointError::Transport(e));
            }
        }
        debug!(charge_point_id = %peer, "Inbound worker stopped");
    }

    async fn answer(&self, call: InboundCall) -> String {
        let unique_id = call.unique_id.clone();
        let action = call.action.clone();
        match self.router.route(call).await {
            Ok(payload) => OcppFrame::CallResult { unique_id, payload }.serialize(),
            Err(error) => {
                warn!(unique_id = %unique_id, action = %action, "Answering with CALL_ERROR: {}", error);
                self.errors.push(EndpointError::Ocpp(error.clone()));
                OcppFrame::error_response(unique_id, &error, self.version()).serialize()
            }
        }
    }

    // ── Lifecycle ──────────────────────────────────────────

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember `serial` as `peer`'s live session.
    pub(crate) fn peer_connected(&self, peer: &str, serial: u64) {
        self.sessions().insert(peer.to_string(), serial);
    }

    /// Drop `peer`'s worker and cancel its in-flight and queued requests.
    ///
    /// With `serial` set, a teardown of a session that has already been
    /// replaced is ignored and `false` is returned.
    pub(crate) fn peer_disconnected(
        &self,
        peer: &str,
        serial: Option<u64>,
        error: Option<&TransportError>,
    ) -> bool {
        {
            let mut sessions = self.sessions();
            match (serial, sessions.get(peer)) {
                (Some(ended), Some(&live)) if ended != live => {
                    debug!(charge_point_id = peer, ended, live, "Ignoring teardown of replaced session");
                    return false;
                }
                _ => {
                    sessions.remove(peer);
                }
            }
        }
        self.workers().remove(peer);
        let reason = match error {
            Some(e) => e.to_string(),
            None => "connection closed".to_string(),
        };
        let canceled = self.dispatcher.cancel_peer(peer, &reason);
        if canceled > 0 {
            debug!(charge_point_id = peer, canceled, "Canceled requests of disconnected peer");
        }
        true
    }

    pub(crate) fn stop(&self) {
        self.dispatcher.cancel_all("endpoint stopped");
        self.workers().clear();
        self.sessions().clear();
        self.errors.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::v16;
    use crate::catalog::v16::core::{HeartbeatRequest, ResetRequest};
    use crate::catalog::v16::types::ResetType;
    use crate::domain::OcppErrorCode;
    use crate::support::id::SequentialGenerator;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        sent: AsyncMutex<Vec<(String, String)>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl OutboundTransport for Recorder {
        async fn send_text(&self, peer: &str, text: String) -> Result<(), TransportError> {
            self.sent.lock().await.push((peer.to_string(), text));
            self.notify.notify_one();
            Ok(())
        }
    }

    impl Recorder {
        async fn next(&self) -> Value {
            loop {
                if let Some((_, text)) = self.sent.lock().await.pop() {
                    return serde_json::from_str(&text).unwrap();
                }
                self.notify.notified().await;
            }
        }
    }

    fn endpoint(role: Role, transport: Arc<Recorder>) -> Arc<Endpoint> {
        Endpoint::new(
            role,
            Arc::new(v16::registry()),
            Validator::new(),
            DispatcherConfig::default(),
            Some(Arc::new(SequentialGenerator::new("m"))),
            transport,
        )
    }

    #[tokio::test]
    async fn unknown_action_gets_not_implemented() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::CentralSystem, Arc::clone(&transport));
        ep.handle_text("CS001", r#"[2,"xyz","MadeUpAction",{}]"#.to_string());

        let frame = transport.next().await;
        assert_eq!(frame, json!([4, "xyz", "NotImplemented", "no handler for action MadeUpAction", {}]));
    }

    #[tokio::test]
    async fn malformed_call_gets_formation_violation() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::CentralSystem, Arc::clone(&transport));
        ep.handle_text("CS001", r#"[2,"abc","Heartbeat"]"#.to_string());

        let frame = transport.next().await;
        assert_eq!(frame[0], 4);
        assert_eq!(frame[1], "abc");
        assert_eq!(frame[2], "FormationViolation");
    }

    #[tokio::test]
    async fn station_cannot_send_central_system_actions() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::ChargingStation, transport);
        let err = ep
            .send_async("CS001", ResetRequest { kind: ResetType::Soft }, |_| {})
            .unwrap_err();
        assert_eq!(
            err,
            EndpointError::UnsupportedAction {
                action: "Reset".into(),
                role: "charging station",
            }
        );
    }

    #[tokio::test]
    async fn result_completes_pending_request() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::ChargingStation, Arc::clone(&transport));

        let sender = Arc::clone(&ep);
        let task = tokio::spawn(async move { sender.send("CS001", HeartbeatRequest {}).await });

        let frame = transport.next().await;
        assert_eq!(frame, json!([2, "m-1", "Heartbeat", {}]));

        ep.handle_text("CS001", r#"[3,"m-1",{"currentTime":"2024-01-01T00:00:00Z"}]"#.to_string());
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.current_time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn invalid_result_fails_the_request() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::ChargingStation, Arc::clone(&transport));

        let sender = Arc::clone(&ep);
        let task = tokio::spawn(async move { sender.send("CS001", HeartbeatRequest {}).await });
        transport.next().await;

        ep.handle_text("CS001", r#"[3,"m-1",{}]"#.to_string());
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(OcppErrorCode::OccurrenceConstraintViolation));
        assert!(matches!(err, EndpointError::InvalidResponse(_)));
        assert!(!ep.dispatcher().is_pending("CS001"));
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_request() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::ChargingStation, Arc::clone(&transport));

        let sender = Arc::clone(&ep);
        let task = tokio::spawn(async move { sender.send("CS001", HeartbeatRequest {}).await });
        transport.next().await;

        assert!(ep.peer_disconnected("CS001", None, Some(&TransportError::ConnectionReset)));
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, EndpointError::Canceled { .. }));
    }

    #[tokio::test]
    async fn late_teardown_of_replaced_session_keeps_new_requests() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::CentralSystem, Arc::clone(&transport));
        ep.peer_connected("CS001", 1);
        ep.peer_connected("CS001", 2);

        let sender = Arc::clone(&ep);
        let task = tokio::spawn(async move {
            sender
                .send("CS001", crate::catalog::v16::core::ClearCacheRequest {})
                .await
        });
        let frame = transport.next().await;
        assert_eq!(frame[1], "m-1");

        assert!(!ep.peer_disconnected("CS001", Some(1), Some(&TransportError::ConnectionReset)));
        assert!(ep.dispatcher().is_pending("CS001"));

        ep.handle_text("CS001", r#"[3,"m-1",{"status":"Accepted"}]"#.to_string());
        assert!(task.await.unwrap().is_ok());

        assert!(ep.peer_disconnected("CS001", Some(2), None));
    }

    #[tokio::test]
    async fn overlong_request_field_is_refused_before_sending() {
        let transport = Arc::new(Recorder::default());
        let ep = endpoint(Role::ChargingStation, Arc::clone(&transport));

        let err = ep
            .send_async(
                "CS001",
                crate::catalog::v16::core::AuthorizeRequest {
                    id_tag: "123456789012345678901".into(),
                },
                |_| panic!("callback must not run"),
            )
            .unwrap_err();
        assert_eq!(err.code(), Some(OcppErrorCode::PropertyConstraintViolation));
        assert!(!ep.dispatcher().is_pending("CS001"));

        tokio::task::yield_now().await;
        assert!(transport.sent.lock().await.is_empty());
    }
}
