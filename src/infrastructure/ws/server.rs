//! WebSocket server
//!
//! Accepts station connections at `ws://<host>:<port><listen_path>`, where
//! the listen path carries an `{id}` placeholder (default `/{id}`). The
//! handshake runs, in order: path match, Basic auth, subprotocol
//! negotiation. After the upgrade a duplicate id or a failed negotiation is
//! answered with a Close frame; otherwise the channel is registered and
//! started.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::channel::{self, close_frame, ChannelConfig, ChannelEvents, ConnectionInfo, WsChannel};
use super::negotiator::{Negotiation, ProtocolNegotiator};
use super::{ServerTimeouts, DEFAULT_OUT_QUEUE_CAPACITY};
use crate::domain::TransportError;
use crate::support::shutdown::ShutdownSignal;

/// Text of the close frame sent to a second connection with a known id.
pub const DUPLICATE_ID_REASON: &str = "a connection with this ID already exists";

/// Predicate over Basic-auth credentials `(username, password)`.
pub type BasicAuthHandler = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

// ── Options / events ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_path: String,
    pub negotiator: ProtocolNegotiator,
    pub timeouts: ServerTimeouts,
    pub out_queue_capacity: usize,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl ServerOptions {
    pub fn new(negotiator: ProtocolNegotiator) -> Self {
        Self {
            listen_path: "/{id}".to_string(),
            negotiator,
            timeouts: ServerTimeouts::default(),
            out_queue_capacity: DEFAULT_OUT_QUEUE_CAPACITY,
            tls: None,
        }
    }
}

/// Connection lifecycle, as seen by the endpoint above the server.
pub trait ServerEvents: Send + Sync + 'static {
    /// A channel was registered. Its reader starts after this returns.
    fn on_connected(&self, channel: &WsChannel);
    fn on_text(&self, station_id: &str, text: String);
    /// The channel was removed from the connection map.
    fn on_disconnected(&self, info: ConnectionInfo, error: Option<TransportError>);
    fn on_error(&self, error: TransportError);
}

// ── Path matching ──────────────────────────────────────────────

/// Why a handshake path did not yield a station id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// Path is outside the listen route.
    NotFound,
    /// Route matched but the id segment is empty or nested.
    InvalidId,
}

/// Extract the station id from `path` according to `pattern`.
///
/// `pattern` is e.g. `/{id}` or `/ocpp/{id}`. A pattern without the
/// placeholder treats the segment after it as the id.
pub fn match_station_id(pattern: &str, path: &str) -> Result<String, PathError> {
    let (prefix, suffix) = match pattern.split_once("{id}") {
        Some((prefix, suffix)) => (prefix.to_string(), suffix),
        None => (format!("{}/", pattern.trim_end_matches('/')), ""),
    };

    let rest = path.strip_prefix(prefix.as_str()).ok_or(PathError::NotFound)?;
    let id = rest.strip_suffix(suffix).ok_or(PathError::NotFound)?;

    if id.is_empty() || id.contains('/') {
        return Err(PathError::InvalidId);
    }
    Ok(id.to_string())
}

/// Decode an `Authorization: Basic ...` header value.
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// What the handshake callback learned.
struct Handshake {
    station_id: String,
    subprotocol: Option<String>,
    rejected: Option<Vec<String>>,
}

// ── WsServer ───────────────────────────────────────────────────

pub struct WsServer {
    options: ServerOptions,
    auth: RwLock<Option<BasicAuthHandler>>,
    connections: DashMap<String, WsChannel>,
    shutdown: ShutdownSignal,
    serial: AtomicU64,
    events: RwLock<Option<Arc<dyn ServerEvents>>>,
    local_addr: AsyncMutex<Option<SocketAddr>>,
}

impl WsServer {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            auth: RwLock::new(None),
            connections: DashMap::new(),
            shutdown: ShutdownSignal::new(),
            serial: AtomicU64::new(1),
            events: RwLock::new(None),
            local_addr: AsyncMutex::new(None),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn set_basic_auth_handler(&self, handler: Option<BasicAuthHandler>) {
        if let Ok(mut auth) = self.auth.write() {
            *auth = handler;
        }
    }

    fn auth_handler(&self) -> Option<BasicAuthHandler> {
        self.auth.read().ok().and_then(|a| a.clone())
    }

    fn events(&self) -> Option<Arc<dyn ServerEvents>> {
        self.events.read().ok().and_then(|e| e.clone())
    }

    /// Bind `addr` and start accepting. Port 0 picks a free port; the bound
    /// address is returned.
    pub async fn start(
        self: &Arc<Self>,
        addr: &str,
        events: Arc<dyn ServerEvents>,
    ) -> Result<SocketAddr, TransportError> {
        if self.shutdown.is_triggered() {
            return Err(TransportError::WebSocket("server was stopped".into()));
        }
        if let Ok(mut slot) = self.events.write() {
            *slot = Some(events);
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local);

        let scheme = if self.options.tls.is_some() { "wss" } else { "ws" };
        info!("🔌 OCPP server listening on {}://{}{}", scheme, local, self.options.listen_path);

        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(local)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        if let Some(events) = self.events() {
                            events.on_error(TransportError::from(e));
                        }
                    }
                },
                _ = shutdown.wait() => {
                    info!("🛑 OCPP server stopped accepting connections");
                    return;
                }
            }
        }
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let handshake_timeout = server.options.timeouts.handshake_timeout;
            let result = match server.options.tls.clone() {
                Some(tls) => {
                    match timeout(handshake_timeout, TlsAcceptor::from(tls).accept(stream)).await {
                        Ok(Ok(stream)) => server.handle_connection(stream, addr, true).await,
                        Ok(Err(e)) => Err(TransportError::Tls(e.to_string())),
                        Err(_) => Err(TransportError::HandshakeTimeout),
                    }
                }
                None => server.handle_connection(stream, addr, false).await,
            };
            if let Err(e) = result {
                warn!(remote = %addr, error = %e, "Connection setup failed");
                if let Some(events) = server.events() {
                    events.on_error(e);
                }
            }
        });
    }

    async fn handle_connection<S>(
        self: &Arc<Self>,
        stream: S,
        addr: SocketAddr,
        tls: bool,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let listen_path = self.options.listen_path.clone();
        let negotiator = self.options.negotiator.clone();
        let auth = self.auth_handler();
        let mut handshake: Option<Handshake> = None;

        let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let path = req.uri().path();
            debug!(remote = %addr, path, "WebSocket handshake");

            let station_id = match match_station_id(&listen_path, path) {
                Ok(id) => id,
                Err(PathError::NotFound) => {
                    return Err(error_response(StatusCode::NOT_FOUND, "unknown path"))
                }
                Err(PathError::InvalidId) => {
                    return Err(error_response(StatusCode::BAD_REQUEST, "invalid station id"))
                }
            };

            let requested = req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            let (subprotocol, rejected) = match negotiator.negotiate(requested) {
                Negotiation::Selected(protocol) => match HeaderValue::from_str(&protocol) {
                    Ok(value) => {
                        response
                            .headers_mut()
                            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                        (Some(protocol), None)
                    }
                    Err(_) => (None, Some(vec![protocol])),
                },
                Negotiation::NoneRequested => (None, None),
                Negotiation::Rejected { offered } => (None, Some(offered)),
            };

            // Credentials are checked only for a negotiated subprotocol. A
            // rejected one is closed with 1002 after the upgrade.
            if let (Some(auth), None) = (&auth, &rejected) {
                let credentials = req
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_basic_auth);
                let authorized = credentials
                    .map(|(user, pass)| auth(&user, &pass))
                    .unwrap_or(false);
                if !authorized {
                    warn!(remote = %addr, station_id = %station_id, "Basic authentication failed");
                    let mut resp = error_response(StatusCode::UNAUTHORIZED, "unauthorized");
                    resp.headers_mut().insert(
                        header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=\"OCPP\""),
                    );
                    return Err(resp);
                }
            }

            handshake = Some(Handshake {
                station_id,
                subprotocol,
                rejected,
            });
            Ok(response)
        };

        let ws = match timeout(
            self.options.timeouts.handshake_timeout,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            Err(_) => return Err(TransportError::HandshakeTimeout),
        };

        let Some(handshake) = handshake else {
            return Err(TransportError::Handshake("handshake callback not invoked".into()));
        };

        if let Some(offered) = handshake.rejected {
            warn!(
                charge_point_id = %handshake.station_id,
                ?offered,
                supported = ?self.options.negotiator.supported(),
                "Unsupported subprotocol, closing"
            );
            self.reject(ws, CloseCode::Protocol, "unsupported subprotocol").await;
            return Err(TransportError::Subprotocol(format!("{:?}", offered)));
        }

        self.register(ws, handshake.station_id, handshake.subprotocol, addr, tls)
            .await
    }

    async fn register<S>(
        self: &Arc<Self>,
        ws: WebSocketStream<S>,
        station_id: String,
        subprotocol: Option<String>,
        addr: SocketAddr,
        tls: bool,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let now = Utc::now();
        let info = ConnectionInfo {
            id: station_id.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            remote_addr: Some(addr),
            subprotocol,
            tls,
            connected_at: now,
            last_activity: now,
        };
        let config = ChannelConfig {
            write_wait: self.options.timeouts.write_wait,
            read_wait: self.options.timeouts.ping_wait,
            ping_period: None,
            out_queue_capacity: self.options.out_queue_capacity,
        };
        let hooks = Arc::new(ServerChannelEvents {
            server: Arc::downgrade(self),
        });

        if self.shutdown.is_triggered() {
            self.reject(ws, CloseCode::Away, "server shutting down").await;
            return Err(TransportError::NotConnected);
        }

        let mut unregistered = Some(ws);
        let registered = match self.connections.entry(station_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => unregistered.take().map(|ws| {
                let (channel, runner) = channel::open(ws, info, config, hooks);
                slot.insert(channel.clone());
                (channel, runner)
            }),
        };
        let Some((channel, runner)) = registered else {
            warn!(charge_point_id = %station_id, remote = %addr, "Duplicate connection rejected");
            if let Some(ws) = unregistered {
                self.reject(ws, CloseCode::Policy, DUPLICATE_ID_REASON).await;
            }
            return Err(TransportError::WebSocket(format!(
                "duplicate station id {}",
                station_id
            )));
        };

        info!(
            charge_point_id = %station_id,
            remote = %addr,
            subprotocol = ?channel.info().subprotocol,
            "Station connected"
        );
        metrics::gauge!("ocppj_connections").increment(1.0);

        if let Some(events) = self.events() {
            events.on_connected(&channel);
        }
        runner.start();
        Ok(())
    }

    async fn reject<S>(&self, mut ws: WebSocketStream<S>, code: CloseCode, reason: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let write_wait = self.options.timeouts.write_wait;
        let _ = timeout(write_wait, ws.close(Some(close_frame(code, reason)))).await;
    }

    /// Called by a channel after cleanup. Removes the map entry only if it
    /// still belongs to that same connection.
    fn on_channel_closed(&self, info: ConnectionInfo, error: Option<TransportError>) {
        let removed = self
            .connections
            .remove_if(&info.id, |_, channel| channel.serial() == info.serial)
            .is_some();
        if !removed {
            return;
        }
        metrics::gauge!("ocppj_connections").decrement(1.0);
        info!(charge_point_id = %info.id, "Station disconnected");
        if let Some(events) = self.events() {
            if let Some(e) = &error {
                events.on_error(e.clone());
            }
            events.on_disconnected(info, error);
        }
    }

    // ── Outbound ───────────────────────────────────────────

    pub async fn send_text(&self, station_id: &str, text: String) -> Result<(), TransportError> {
        let channel = self
            .connections
            .get(station_id)
            .map(|c| c.clone())
            .ok_or(TransportError::NotConnected)?;
        channel.write(text).await
    }

    /// Gracefully close one station's connection.
    pub fn disconnect(&self, station_id: &str) -> bool {
        match self.connections.get(station_id).map(|c| c.clone()) {
            Some(channel) => channel.close(Some(close_frame(CloseCode::Normal, "closed by server"))),
            None => false,
        }
    }

    // ── Introspection ──────────────────────────────────────

    pub fn connected_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.connections.contains_key(station_id)
    }

    pub fn connection_info(&self, station_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(station_id).map(|c| c.info())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Shutdown ───────────────────────────────────────────

    /// Stop accepting, close every channel and wait for their cleanup,
    /// bounded by twice the write deadline.
    pub async fn stop(&self) {
        self.shutdown.trigger();

        let channels: Vec<WsChannel> = self.connections.iter().map(|e| e.value().clone()).collect();
        if !channels.is_empty() {
            info!("📢 Closing {} station connection(s)...", channels.len());
        }
        for channel in &channels {
            channel.close(Some(close_frame(CloseCode::Away, "server shutting down")));
        }

        let deadline = self.options.timeouts.write_wait * 2;
        let all_closed = async {
            for channel in &channels {
                channel.closed().await;
            }
        };
        if timeout(deadline, all_closed).await.is_err() {
            warn!("⚠️ Some connections did not close within {:?}", deadline);
        }
        info!("✅ OCPP server shutdown complete");
    }
}

struct ServerChannelEvents {
    server: Weak<WsServer>,
}

impl ChannelEvents for ServerChannelEvents {
    fn on_text(&self, info: &ConnectionInfo, text: String) {
        if let Some(server) = self.server.upgrade() {
            if let Some(events) = server.events() {
                events.on_text(&info.id, text);
            }
        }
    }

    fn on_closed(&self, info: ConnectionInfo, error: Option<TransportError>) {
        if let Some(server) = self.server.upgrade() {
            server.on_channel_closed(info, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_takes_single_segment() {
        assert_eq!(match_station_id("/{id}", "/CS001"), Ok("CS001".into()));
        assert_eq!(match_station_id("/{id}", "/"), Err(PathError::InvalidId));
        assert_eq!(match_station_id("/{id}", "/a/b"), Err(PathError::InvalidId));
    }

    #[test]
    fn prefixed_pattern() {
        assert_eq!(match_station_id("/ocpp/{id}", "/ocpp/CS001"), Ok("CS001".into()));
        assert_eq!(match_station_id("/ocpp/{id}", "/other/CS001"), Err(PathError::NotFound));
        assert_eq!(match_station_id("/ocpp/{id}", "/ocpp/"), Err(PathError::InvalidId));
    }

    #[test]
    fn pattern_without_placeholder() {
        assert_eq!(match_station_id("/ws", "/ws/CS001"), Ok("CS001".into()));
        assert_eq!(match_station_id("/ws/", "/ws/CS001"), Ok("CS001".into()));
        assert_eq!(match_station_id("/ws", "/ws"), Err(PathError::NotFound));
    }

    #[test]
    fn basic_auth_header() {
        let header = format!("Basic {}", BASE64.encode("CS001:secret"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("CS001".into(), "secret".into()))
        );
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
    }
}
