//! Shared fixtures for the loopback integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ocppj::application::HandlerResult;
use ocppj::catalog::v16::core::{
    AuthorizeRequest, AuthorizeResponse, BootNotificationRequest, BootNotificationResponse,
    CentralSystemHandler, HeartbeatRequest, HeartbeatResponse,
};
use ocppj::catalog::v16::types::{IdTagInfo, RegistrationStatus};
use ocppj::support::id::MessageIdGenerator;

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in a test.
pub const STEP: Duration = Duration::from_secs(5);

pub fn fixed_time() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

// ── Central system handler ─────────────────────────────────────

/// Answers Boot/Heartbeat/Authorize and records the order of calls.
#[derive(Default)]
pub struct RecordingCsms {
    pub calls: Mutex<Vec<String>>,
    pub boot_delay: Option<Duration>,
}

impl RecordingCsms {
    pub fn with_boot_delay(delay: Duration) -> Self {
        Self {
            boot_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, action: &str) {
        self.calls.lock().unwrap().push(action.to_string());
    }
}

#[async_trait]
impl CentralSystemHandler for RecordingCsms {
    async fn on_authorize(&self, _station_id: &str, _req: AuthorizeRequest) -> HandlerResult<AuthorizeResponse> {
        self.record("Authorize");
        Ok(AuthorizeResponse {
            id_tag_info: IdTagInfo::accepted(),
        })
    }

    async fn on_boot_notification(
        &self,
        _station_id: &str,
        _req: BootNotificationRequest,
    ) -> HandlerResult<BootNotificationResponse> {
        self.record("BootNotification");
        if let Some(delay) = self.boot_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(BootNotificationResponse {
            current_time: fixed_time(),
            interval: 300,
            status: RegistrationStatus::Accepted,
        })
    }

    async fn on_heartbeat(&self, _station_id: &str, _req: HeartbeatRequest) -> HandlerResult<HeartbeatResponse> {
        self.record("Heartbeat");
        Ok(HeartbeatResponse {
            current_time: fixed_time(),
        })
    }
}

// ── Message ids ────────────────────────────────────────────────

/// Hands out the same id every time.
pub struct FixedId(pub &'static str);

impl MessageIdGenerator for FixedId {
    fn next_id(&self) -> String {
        self.0.to_string()
    }
}

// ── Raw WebSocket peers ────────────────────────────────────────

pub async fn raw_connect(addr: SocketAddr, path: &str, subprotocol: &'static str) -> RawSocket {
    let mut request = format!("ws://{}{}", addr, path).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(subprotocol));
    let (ws, _) = tokio::time::timeout(STEP, tokio_tungstenite::connect_async(request))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    ws
}

/// Next text frame, parsed as JSON.
pub async fn next_json(ws: &mut RawSocket) -> Value {
    loop {
        let message = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Poll `condition` until it holds or the step deadline passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
