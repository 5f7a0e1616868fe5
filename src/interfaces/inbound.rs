//! Inbound `CALL` routing
//!
//! Resolution of an incoming action:
//!
//! 1. unknown action → `NotImplemented`
//! 2. action the peer may not originate, or whose profile has no handler
//!    → `NotSupported`
//! 3. payload fails decoding or validation → the classified code
//! 4. otherwise the profile handler answers

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::application::ports::{InboundCall, ProfileHandler, ProfileRegistration};
use crate::domain::{FeatureRegistry, OcppError, Role};
use crate::support::validation::Validator;

pub struct InboundRouter {
    role: Role,
    registry: Arc<FeatureRegistry>,
    validator: Validator,
    handlers: RwLock<HashMap<&'static str, Arc<dyn ProfileHandler>>>,
}

impl InboundRouter {
    pub fn new(role: Role, registry: Arc<FeatureRegistry>, validator: Validator) -> Self {
        Self {
            role,
            registry,
            validator,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Install the handler for `profile`, replacing any previous one.
    pub fn set_handler(&self, profile: &'static str, handler: Arc<dyn ProfileHandler>) {
        if self.registry.profile(profile).is_none() {
            warn!(profile, "Handler registered for a profile this endpoint does not carry");
        }
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(profile, handler);
        }
    }

    pub fn register(&self, registration: ProfileRegistration) {
        self.set_handler(registration.profile, registration.handler);
    }

    pub fn has_handler(&self, profile: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(profile))
            .unwrap_or(false)
    }

    fn handler(&self, profile: &str) -> Option<Arc<dyn ProfileHandler>> {
        self.handlers.read().ok().and_then(|h| h.get(profile).cloned())
    }

    /// Answer one inbound call with a `CALL_RESULT` payload or the error
    /// for its `CALL_ERROR`.
    pub async fn route(&self, call: InboundCall) -> Result<Value, OcppError> {
        let Some((profile, feature)) = self.registry.resolve(&call.action) else {
            debug!(charge_point_id = %call.station_id, action = %call.action, "Unknown action");
            return Err(OcppError::not_implemented(&call.action));
        };

        let peer = self.role.peer();
        if !feature.initiator.allows(peer) {
            return Err(OcppError::not_supported(format!(
                "{} cannot be sent by the {}",
                call.action, peer
            )));
        }

        let Some(handler) = self.handler(profile.name) else {
            return Err(OcppError::not_supported(format!(
                "no handler for profile {} (action {})",
                profile.name, call.action
            )));
        };

        feature.check_request(&self.validator, &call.payload)?;

        debug!(
            charge_point_id = %call.station_id,
            unique_id = %call.unique_id,
            action = %call.action,
            "Dispatching to {} handler",
            profile.name
        );
        handler.handle(call, &self.validator).await
    }
}
