//! WebSocket client
//!
//! Dials `<url>` (the station facade appends `/<id>`), requests one OCPP
//! subprotocol, and keeps the link up: a lost connection is re-established
//! with exponential backoff until it succeeds or the client is stopped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{self, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{Connector, MaybeTlsStream};
use tracing::{debug, info, warn};

use super::channel::{self, close_frame, ChannelConfig, ChannelEvents, ConnectionInfo, WsChannel};
use super::{ClientTimeouts, DEFAULT_OUT_QUEUE_CAPACITY};
use crate::domain::TransportError;
use crate::support::backoff::Backoff;
use crate::support::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Station id; also the connection id in logs.
    pub id: String,
    /// Requested `Sec-WebSocket-Protocol`.
    pub subprotocol: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra headers on the upgrade request.
    pub headers: Vec<(String, String)>,
    pub timeouts: ClientTimeouts,
    pub out_queue_capacity: usize,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClientOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subprotocol: None,
            username: None,
            password: None,
            headers: Vec::new(),
            timeouts: ClientTimeouts::default(),
            out_queue_capacity: DEFAULT_OUT_QUEUE_CAPACITY,
            tls: None,
        }
    }
}

/// Link lifecycle, as seen by the endpoint above the client.
pub trait ClientEvents: Send + Sync + 'static {
    fn on_text(&self, text: String);
    /// The link went down. `error` is `None` when the client closed it.
    fn on_disconnected(&self, error: Option<TransportError>);
    /// A lost link was re-established.
    fn on_reconnected(&self);
    fn on_error(&self, error: TransportError);
}

pub struct WsClient {
    options: ClientOptions,
    url: Mutex<Option<String>>,
    channel: RwLock<Option<WsChannel>>,
    events: RwLock<Option<Arc<dyn ClientEvents>>>,
    shutdown: Mutex<ShutdownSignal>,
    stopping: AtomicBool,
    reconnecting: AtomicBool,
    serial: AtomicU64,
}

impl WsClient {
    pub fn new(options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            url: Mutex::new(None),
            channel: RwLock::new(None),
            events: RwLock::new(None),
            shutdown: Mutex::new(ShutdownSignal::new()),
            stopping: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            serial: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn events(&self) -> Option<Arc<dyn ClientEvents>> {
        self.events.read().ok().and_then(|e| e.clone())
    }

    fn current_channel(&self) -> Option<WsChannel> {
        self.channel.read().ok().and_then(|c| c.clone())
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        match self.shutdown.lock() {
            Ok(signal) => signal.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Connect to `url`. Fails if the first attempt fails; reconnects only
    /// happen after a successful connect.
    pub async fn start(
        self: &Arc<Self>,
        url: &str,
        events: Arc<dyn ClientEvents>,
    ) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Ok(mut slot) = self.events.write() {
            *slot = Some(events);
        }
        if let Ok(mut slot) = self.url.lock() {
            *slot = Some(url.to_string());
        }
        if let Ok(mut signal) = self.shutdown.lock() {
            *signal = ShutdownSignal::new();
        }
        self.stopping.store(false, Ordering::SeqCst);

        self.connect(url).await
    }

    async fn connect(self: &Arc<Self>, url: &str) -> Result<(), TransportError> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();

        if let Some(protocol) = &self.options.subprotocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| TransportError::Handshake(format!("subprotocol header: {}", e)))?;
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
        if let Some(username) = &self.options.username {
            let password = self.options.password.as_deref().unwrap_or("");
            let token = BASE64.encode(format!("{}:{}", username, password));
            let value = HeaderValue::from_str(&format!("Basic {}", token))
                .map_err(|e| TransportError::Handshake(format!("authorization header: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let connector = self.options.tls.clone().map(Connector::Rustls);
        let handshake_timeout = self.options.timeouts.handshake_timeout;
        debug!(charge_point_id = %self.options.id, url, "Connecting");

        let (ws, response) = match timeout(
            handshake_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(TransportError::from(e)),
            Err(_) => return Err(TransportError::HandshakeTimeout),
        };

        let subprotocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (remote_addr, tls) = match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => (stream.peer_addr().ok(), false),
            MaybeTlsStream::Rustls(stream) => (stream.get_ref().0.peer_addr().ok(), true),
            _ => (None, false),
        };

        let now = Utc::now();
        let info = ConnectionInfo {
            id: self.options.id.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            remote_addr,
            subprotocol,
            tls,
            connected_at: now,
            last_activity: now,
        };
        let config = ChannelConfig {
            write_wait: self.options.timeouts.write_wait,
            read_wait: self.options.timeouts.pong_wait,
            ping_period: Some(self.options.timeouts.ping_period),
            out_queue_capacity: self.options.out_queue_capacity,
        };
        let hooks = Arc::new(ClientChannelEvents {
            client: Arc::downgrade(self),
        });

        // `stop()` raises `stopping` before it looks at the slot, so checking
        // under the slot lock means a link is either seen by `stop()` or never
        // installed.
        let installed = {
            let mut slot = match self.channel.write() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.stopping.load(Ordering::SeqCst) {
                Err(ws)
            } else {
                let (channel, runner) = channel::open(ws, info, config, hooks);
                *slot = Some(channel.clone());
                Ok((channel, runner))
            }
        };
        let (channel, runner) = match installed {
            Ok(opened) => opened,
            Err(mut ws) => {
                debug!(charge_point_id = %self.options.id, "Client stopped during handshake, dropping link");
                let frame = close_frame(CloseCode::Normal, "client stopped");
                let _ = timeout(self.options.timeouts.write_wait, ws.close(Some(frame))).await;
                return Err(TransportError::NotConnected);
            }
        };
        runner.start();

        info!(
            charge_point_id = %self.options.id,
            url,
            subprotocol = ?channel.info().subprotocol,
            "🔗 Connected to central system"
        );
        Ok(())
    }

    fn on_channel_closed(self: Arc<Self>, info: ConnectionInfo, error: Option<TransportError>) {
        if let Ok(mut slot) = self.channel.write() {
            if slot.as_ref().map(|c| c.serial()) == Some(info.serial) {
                *slot = None;
            }
        }

        let events = self.events();
        if let (Some(events), Some(e)) = (&events, &error) {
            events.on_error(e.clone());
        }
        if let Some(events) = &events {
            events.on_disconnected(error.clone());
        }

        if error.is_some() && !self.stopping.load(Ordering::SeqCst) {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tokio::spawn(async move {
            loop {
                let reconnected = self.reconnect_loop().await;
                self.reconnecting.store(false, Ordering::SeqCst);
                // A link that dropped before the flag was cleared found the
                // loop still running and did not start another one.
                if !reconnected || self.stopping.load(Ordering::SeqCst) || self.is_connected() {
                    return;
                }
                if self
                    .reconnecting
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    /// Retry until a link is up. Returns `false` when the client was stopped.
    async fn reconnect_loop(self: &Arc<Self>) -> bool {
        let shutdown = self.shutdown_signal();
        let mut backoff = Backoff::new(self.options.timeouts.backoff());

        loop {
            let delay = backoff.next_delay();
            info!(
                charge_point_id = %self.options.id,
                attempt = backoff.attempt(),
                "🔄 Reconnecting in {:?}",
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => return false,
            }
            if self.stopping.load(Ordering::SeqCst) {
                return false;
            }

            let Some(url) = self.url.lock().ok().and_then(|u| u.clone()) else {
                return false;
            };
            let attempt = tokio::select! {
                result = self.connect(&url) => result,
                _ = shutdown.wait() => return false,
            };
            match attempt {
                Ok(()) => {
                    if let Some(events) = self.events() {
                        events.on_reconnected();
                    }
                    return true;
                }
                Err(e) => {
                    warn!(charge_point_id = %self.options.id, error = %e, "Reconnect failed");
                    if let Some(events) = self.events() {
                        events.on_error(e);
                    }
                }
            }
        }
    }

    // ── Public surface ─────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.current_channel().map(|c| c.is_connected()).unwrap_or(false)
    }

    pub fn negotiated_subprotocol(&self) -> Option<String> {
        self.current_channel().and_then(|c| c.info().subprotocol)
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.current_channel().map(|c| c.info())
    }

    pub async fn write(&self, text: String) -> Result<(), TransportError> {
        match self.current_channel() {
            Some(channel) => channel.write(text).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Close the link without reconnecting and wait for cleanup.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown_signal().trigger();

        if let Some(channel) = self.current_channel() {
            channel.close(Some(close_frame(CloseCode::Normal, "client stopped")));
            let deadline = self.options.timeouts.write_wait * 2;
            if timeout(deadline, channel.closed()).await.is_err() {
                warn!(charge_point_id = %self.options.id, "Connection did not close within {:?}", deadline);
            }
        }
        info!(charge_point_id = %self.options.id, "🛑 Client stopped");
    }
}

struct ClientChannelEvents {
    client: Weak<WsClient>,
}

impl ChannelEvents for ClientChannelEvents {
    fn on_text(&self, _info: &ConnectionInfo, text: String) {
        if let Some(client) = self.client.upgrade() {
            if let Some(events) = client.events() {
                events.on_text(text);
            }
        }
    }

    fn on_closed(&self, info: ConnectionInfo, error: Option<TransportError>) {
        if let Some(client) = self.client.upgrade() {
            client.on_channel_closed(info, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_without_connection_fails() {
        let client = WsClient::new(ClientOptions::new("CS001"));
        assert!(!client.is_connected());
        assert_eq!(
            client.write("[]".into()).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        struct Silent;
        impl ClientEvents for Silent {
            fn on_text(&self, _text: String) {}
            fn on_disconnected(&self, _error: Option<TransportError>) {}
            fn on_reconnected(&self) {}
            fn on_error(&self, _error: TransportError) {}
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = WsClient::new(ClientOptions::new("CS001"));
        let result = client
            .start(&format!("ws://{}/CS001", addr), Arc::new(Silent))
            .await;
        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        struct Silent;
        impl ClientEvents for Silent {
            fn on_text(&self, _text: String) {}
            fn on_disconnected(&self, _error: Option<TransportError>) {}
            fn on_reconnected(&self) {}
            fn on_error(&self, _error: TransportError) {}
        }
        let client = WsClient::new(ClientOptions::new("CS001"));
        assert!(client.start("not a url", Arc::new(Silent)).await.is_err());
    }
}
