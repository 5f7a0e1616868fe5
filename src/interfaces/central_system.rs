//! Central-system endpoint
//!
//! Accepts charging stations on a WebSocket server, answers their calls
//! through the registered profile handlers and sends requests to them by
//! station id.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::endpoint::Endpoint;
use crate::application::ports::{ProfileHandler, ProfileRegistration};
use crate::application::{DispatcherConfig, OutboundTransport};
use crate::config::{DispatcherSection, ServerConfig};
use crate::domain::{EndpointError, FeatureRegistry, OcppRequest, Role, TransportError};
use crate::infrastructure::ws::server::BasicAuthHandler;
use crate::infrastructure::ws::ProtocolNegotiator;
use crate::infrastructure::{ConnectionInfo, ServerEvents, ServerOptions, ServerTimeouts, WsChannel, WsServer};
use crate::support::id::MessageIdGenerator;
use crate::support::validation::Validator;

pub type NewClientHandler = Arc<dyn Fn(ConnectionInfo) + Send + Sync>;
pub type DisconnectedClientHandler = Arc<dyn Fn(ConnectionInfo, Option<TransportError>) + Send + Sync>;

// ── Builder ────────────────────────────────────────────────────

pub struct CentralSystemBuilder {
    registry: FeatureRegistry,
    options: ServerOptions,
    dispatcher: DispatcherConfig,
    validator: Validator,
    ids: Option<Arc<dyn MessageIdGenerator>>,
}

impl CentralSystemBuilder {
    fn new(registry: FeatureRegistry) -> Self {
        let negotiator = ProtocolNegotiator::for_version(registry.version());
        Self {
            registry,
            options: ServerOptions::new(negotiator),
            dispatcher: DispatcherConfig::default(),
            validator: Validator::new(),
            ids: None,
        }
    }

    /// Path pattern; `{id}` marks the station id segment.
    pub fn listen_path(mut self, path: impl Into<String>) -> Self {
        self.options.listen_path = path.into();
        self
    }

    /// Subprotocols to accept. Empty accepts whatever the station offers.
    pub fn subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.negotiator = ProtocolNegotiator::new(protocols.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.options.timeouts = timeouts;
        self
    }

    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.options.tls = Some(config);
        self
    }

    pub fn out_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.out_queue_capacity = capacity;
        self
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn MessageIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Apply the `[server]` and `[dispatcher]` config sections.
    pub fn from_config(
        mut self,
        server: &ServerConfig,
        dispatcher: &DispatcherSection,
    ) -> Result<Self, TransportError> {
        if server.ocpp_version != self.registry.version() {
            warn!(
                "Configured OCPP version {} differs from the registry's {}",
                server.ocpp_version,
                self.registry.version()
            );
        }
        self = self
            .listen_path(server.listen_path.clone())
            .timeouts(server.timeouts())
            .dispatcher_config(dispatcher.dispatcher_config())
            .validator(dispatcher.validator());
        if !server.subprotocols.is_empty() {
            self = self.subprotocols(server.subprotocols.clone());
        }
        if let Some(tls) = &server.tls {
            self = self.tls(tls.build()?);
        }
        Ok(self)
    }

    pub fn build(self) -> CentralSystem {
        let server = WsServer::new(self.options);
        let endpoint = Endpoint::new(
            Role::CentralSystem,
            Arc::new(self.registry),
            self.validator,
            self.dispatcher,
            self.ids,
            Arc::clone(&server) as Arc<dyn OutboundTransport>,
        );
        CentralSystem {
            inner: Arc::new(Inner {
                server,
                endpoint,
                on_connected: RwLock::new(None),
                on_disconnected: RwLock::new(None),
            }),
        }
    }
}

// ── CentralSystem ──────────────────────────────────────────────

struct Inner {
    server: Arc<WsServer>,
    endpoint: Arc<Endpoint>,
    on_connected: RwLock<Option<NewClientHandler>>,
    on_disconnected: RwLock<Option<DisconnectedClientHandler>>,
}

#[derive(Clone)]
pub struct CentralSystem {
    inner: Arc<Inner>,
}

impl CentralSystem {
    pub fn builder(registry: FeatureRegistry) -> CentralSystemBuilder {
        CentralSystemBuilder::new(registry)
    }

    pub fn new(registry: FeatureRegistry) -> Self {
        Self::builder(registry).build()
    }

    pub fn registry(&self) -> &FeatureRegistry {
        self.inner.endpoint.registry()
    }

    // ── Handlers ───────────────────────────────────────────

    pub fn set_handler(&self, profile: &'static str, handler: Arc<dyn ProfileHandler>) {
        self.inner.endpoint.router().set_handler(profile, handler);
    }

    /// Install a catalog handler, e.g. `v16::core::central_system(handler)`.
    pub fn register(&self, registration: ProfileRegistration) {
        self.inner.endpoint.router().register(registration);
    }

    /// Require Basic-auth credentials on the upgrade request.
    pub fn set_basic_auth_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        let handler: BasicAuthHandler = Arc::new(handler);
        self.inner.server.set_basic_auth_handler(Some(handler));
    }

    pub fn set_new_client_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionInfo) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_connected.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn set_disconnected_client_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionInfo, Option<TransportError>) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_disconnected.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    /// Network, protocol and handler errors. Available once.
    pub fn errors(&self) -> Option<mpsc::Receiver<EndpointError>> {
        self.inner.endpoint.errors()
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Bind `addr` (`host:port`, port 0 picks one) and start accepting.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        let events = Arc::new(Events(Arc::downgrade(&self.inner)));
        let local = self.inner.server.start(addr, events).await?;
        info!(
            "🚀 Central system ready ({})",
            self.inner.endpoint.version()
        );
        Ok(local)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr().await
    }

    /// Close every connection and cancel all outstanding requests.
    pub async fn stop(&self) {
        self.inner.server.stop().await;
        self.inner.endpoint.stop();
        info!("🛑 Central system stopped");
    }

    // ── Requests ───────────────────────────────────────────

    /// Send `request` to `station_id` and wait for the typed response.
    pub async fn send_request<R: OcppRequest>(
        &self,
        station_id: &str,
        request: R,
    ) -> Result<R::Response, EndpointError> {
        self.ensure_connected(station_id)?;
        self.inner.endpoint.send(station_id, request).await
    }

    /// Queue `request`; `callback` runs once with the outcome.
    pub fn send_request_async<R, F>(
        &self,
        station_id: &str,
        request: R,
        callback: F,
    ) -> Result<(), EndpointError>
    where
        R: OcppRequest,
        F: FnOnce(Result<R::Response, EndpointError>) + Send + 'static,
    {
        self.ensure_connected(station_id)?;
        self.inner.endpoint.send_async(station_id, request, callback)
    }

    fn ensure_connected(&self, station_id: &str) -> Result<(), EndpointError> {
        if self.inner.server.is_connected(station_id) {
            Ok(())
        } else {
            Err(EndpointError::NotConnected(station_id.to_string()))
        }
    }

    // ── Introspection ──────────────────────────────────────

    pub fn connected_ids(&self) -> Vec<String> {
        self.inner.server.connected_ids()
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.inner.server.is_connected(station_id)
    }

    pub fn connection_info(&self, station_id: &str) -> Option<ConnectionInfo> {
        self.inner.server.connection_info(station_id)
    }

    /// Close one station's connection. Returns `false` if it was not
    /// connected.
    pub fn disconnect(&self, station_id: &str) -> bool {
        self.inner.server.disconnect(station_id)
    }
}

// ── Server events ──────────────────────────────────────────────

struct Events(Weak<Inner>);

impl ServerEvents for Events {
    fn on_connected(&self, channel: &WsChannel) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let info = channel.info();
        inner.endpoint.peer_connected(&info.id, info.serial);
        let handler = inner.on_connected.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(info);
        }
    }

    fn on_text(&self, station_id: &str, text: String) {
        if let Some(inner) = self.0.upgrade() {
            inner.endpoint.handle_text(station_id, text);
        }
    }

    fn on_disconnected(&self, info: ConnectionInfo, error: Option<TransportError>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        // A replacement may already be registered with the server before its
        // own connect event reaches the endpoint.
        let replaced = inner
            .server
            .connection_info(&info.id)
            .is_some_and(|live| live.serial != info.serial);
        if !replaced {
            inner.endpoint.peer_disconnected(&info.id, Some(info.serial), error.as_ref());
        }
        let handler = inner.on_disconnected.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(info, error);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(inner) = self.0.upgrade() {
            inner.endpoint.push_error(EndpointError::Transport(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::v16;
    use crate::catalog::v16::core::ClearCacheRequest;

    #[tokio::test]
    async fn request_to_unknown_station_is_not_connected() {
        let csms = CentralSystem::new(v16::registry());
        let err = csms
            .send_request("CS404", ClearCacheRequest {})
            .await
            .unwrap_err();
        assert_eq!(err, EndpointError::NotConnected("CS404".into()));
        assert!(csms.connected_ids().is_empty());
        assert!(!csms.disconnect("CS404"));
    }

    #[tokio::test]
    async fn errors_stream_is_handed_out_once() {
        let csms = CentralSystem::new(v16::registry());
        assert!(csms.errors().is_some());
        assert!(csms.errors().is_none());
    }
}
