//! Charging-station endpoint
//!
//! Dials `<base_url>/<station id>`, keeps the link up with pings and
//! reconnects after failures. Requests the central system sends are
//! answered by the registered profile handlers.

use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::info;

use super::endpoint::Endpoint;
use crate::application::ports::{ProfileHandler, ProfileRegistration};
use crate::application::{DispatcherConfig, OutboundTransport};
use crate::config::{ClientConfig, DispatcherSection};
use crate::domain::{EndpointError, FeatureRegistry, OcppRequest, Role, TransportError};
use crate::infrastructure::{ClientEvents, ClientOptions, ClientTimeouts, ConnectionInfo, WsClient};
use crate::support::id::MessageIdGenerator;
use crate::support::validation::Validator;

pub type DisconnectedHandler = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;
pub type ReconnectedHandler = Arc<dyn Fn() + Send + Sync>;

// ── Builder ────────────────────────────────────────────────────

pub struct ChargingStationBuilder {
    registry: FeatureRegistry,
    options: ClientOptions,
    dispatcher: DispatcherConfig,
    validator: Validator,
    ids: Option<Arc<dyn MessageIdGenerator>>,
}

impl ChargingStationBuilder {
    fn new(id: impl Into<String>, registry: FeatureRegistry) -> Self {
        let mut options = ClientOptions::new(id);
        options.subprotocol = Some(registry.version().subprotocol().to_string());
        Self {
            registry,
            options,
            dispatcher: DispatcherConfig::default(),
            validator: Validator::new(),
            ids: None,
        }
    }

    /// Override the requested subprotocol.
    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.options.subprotocol = Some(subprotocol.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self.options.password = Some(password.into());
        self
    }

    /// Extra header on the upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.options.timeouts = timeouts;
        self
    }

    pub fn tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
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

    /// Apply the `[client]` and `[dispatcher]` config sections. The station
    /// id and url stay with the caller.
    pub fn from_config(
        mut self,
        client: &ClientConfig,
        dispatcher: &DispatcherSection,
    ) -> Result<Self, TransportError> {
        self = self
            .timeouts(client.timeouts())
            .dispatcher_config(dispatcher.dispatcher_config())
            .validator(dispatcher.validator());
        if let (Some(user), Some(pass)) = (&client.username, &client.password) {
            self = self.basic_auth(user.clone(), pass.clone());
        }
        if let Some(tls) = &client.tls {
            self = self.tls(tls.build()?);
        }
        Ok(self)
    }

    pub fn build(self) -> ChargingStation {
        let id = self.options.id.clone();
        let client = WsClient::new(self.options);
        let endpoint = Endpoint::new(
            Role::ChargingStation,
            Arc::new(self.registry),
            self.validator,
            self.dispatcher,
            self.ids,
            Arc::clone(&client) as Arc<dyn OutboundTransport>,
        );
        ChargingStation {
            inner: Arc::new(Inner {
                id,
                client,
                endpoint,
                on_disconnected: RwLock::new(None),
                on_reconnected: RwLock::new(None),
            }),
        }
    }
}

// ── ChargingStation ────────────────────────────────────────────

struct Inner {
    id: String,
    client: Arc<WsClient>,
    endpoint: Arc<Endpoint>,
    on_disconnected: RwLock<Option<DisconnectedHandler>>,
    on_reconnected: RwLock<Option<ReconnectedHandler>>,
}

#[derive(Clone)]
pub struct ChargingStation {
    inner: Arc<Inner>,
}

impl ChargingStation {
    pub fn builder(id: impl Into<String>, registry: FeatureRegistry) -> ChargingStationBuilder {
        ChargingStationBuilder::new(id, registry)
    }

    pub fn new(id: impl Into<String>, registry: FeatureRegistry) -> Self {
        Self::builder(id, registry).build()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn registry(&self) -> &FeatureRegistry {
        self.inner.endpoint.registry()
    }

    // ── Handlers ───────────────────────────────────────────

    pub fn set_handler(&self, profile: &'static str, handler: Arc<dyn ProfileHandler>) {
        self.inner.endpoint.router().set_handler(profile, handler);
    }

    /// Install a catalog handler, e.g. `v16::core::charge_point(handler)`.
    pub fn register(&self, registration: ProfileRegistration) {
        self.inner.endpoint.router().register(registration);
    }

    pub fn set_disconnected_handler<F>(&self, handler: F)
    where
        F: Fn(Option<TransportError>) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_disconnected.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn set_reconnected_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_reconnected.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    /// Network, protocol and handler errors. Available once.
    pub fn errors(&self) -> Option<mpsc::Receiver<EndpointError>> {
        self.inner.endpoint.errors()
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Connect to `<base_url>/<id>`. Fails if the first attempt fails.
    pub async fn start(&self, base_url: &str) -> Result<(), TransportError> {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), self.inner.id);
        let events = Arc::new(Events(Arc::downgrade(&self.inner)));
        self.inner.client.start(&url, events).await?;
        info!(
            charge_point_id = %self.inner.id,
            "✅ Connected to central system ({})",
            self.inner.endpoint.version()
        );
        Ok(())
    }

    /// Close the link without reconnecting and cancel outstanding requests.
    pub async fn stop(&self) {
        self.inner.client.stop().await;
        self.inner.endpoint.stop();
        info!(charge_point_id = %self.inner.id, "🛑 Charging station stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    pub fn negotiated_subprotocol(&self) -> Option<String> {
        self.inner.client.negotiated_subprotocol()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.client.connection_info()
    }

    // ── Requests ───────────────────────────────────────────

    /// Send `request` to the central system and wait for the typed response.
    pub async fn send_request<R: OcppRequest>(&self, request: R) -> Result<R::Response, EndpointError> {
        self.ensure_connected()?;
        self.inner.endpoint.send(&self.inner.id, request).await
    }

    /// Queue `request`; `callback` runs once with the outcome.
    pub fn send_request_async<R, F>(&self, request: R, callback: F) -> Result<(), EndpointError>
    where
        R: OcppRequest,
        F: FnOnce(Result<R::Response, EndpointError>) + Send + 'static,
    {
        self.ensure_connected()?;
        self.inner.endpoint.send_async(&self.inner.id, request, callback)
    }

    fn ensure_connected(&self) -> Result<(), EndpointError> {
        if self.inner.client.is_connected() {
            Ok(())
        } else {
            Err(EndpointError::NotConnected(self.inner.id.clone()))
        }
    }
}

// ── Client events ──────────────────────────────────────────────

struct Events(Weak<Inner>);

impl ClientEvents for Events {
    fn on_text(&self, text: String) {
        if let Some(inner) = self.0.upgrade() {
            inner.endpoint.handle_text(&inner.id, text);
        }
    }

    fn on_disconnected(&self, error: Option<TransportError>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        inner.endpoint.peer_disconnected(&inner.id, None, error.as_ref());
        let handler = inner.on_disconnected.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn on_reconnected(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        info!(charge_point_id = %inner.id, "🔄 Reconnected to central system");
        let handler = inner.on_reconnected.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler();
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(inner) = self.0.upgrade() {
            inner.endpoint.push_error(EndpointError::Transport(error));
        }
    }
}
