//! Handler ports
//!
//! The engine talks to domain code through one [`ProfileHandler`] per
//! profile. Catalog modules adapt their typed handler traits
//! (`on_boot_notification`, ...) to this untyped seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{OcppError, OcppPayload};
use crate::support::validation::{classify, Validator};

/// Error returned by domain handlers. Returning an [`OcppError`] inside it
/// keeps that error's code on the wire; anything else becomes
/// `InternalError`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Map a handler error to the `CALL_ERROR` it produces.
pub fn into_ocpp_error(err: HandlerError) -> OcppError {
    match err.downcast::<OcppError>() {
        Ok(ocpp) => *ocpp,
        Err(other) => OcppError::internal(other.to_string()),
    }
}

/// An inbound `CALL` that passed lookup and validation.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Charging station the call came from (CSMS side) or our own id
    /// (station side).
    pub station_id: String,
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

/// Untyped handler for every action of one profile.
#[async_trait]
pub trait ProfileHandler: Send + Sync + 'static {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError>;
}

/// A handler bound to the profile it serves.
#[derive(Clone)]
pub struct ProfileRegistration {
    pub profile: &'static str,
    pub handler: Arc<dyn ProfileHandler>,
}

impl std::fmt::Debug for ProfileRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistration")
            .field("profile", &self.profile)
            .finish()
    }
}

/// Decode an already validated request payload.
pub fn decode<T: OcppPayload>(payload: Value) -> Result<T, OcppError> {
    serde_json::from_value(payload).map_err(|e| classify(&e))
}

/// Turn a typed handler outcome into the `CALL_RESULT` payload.
///
/// A response that fails its own validation rules is reported to the
/// peer as `InternalError`.
pub fn respond<T: OcppPayload>(validator: &Validator, result: HandlerResult<T>) -> Result<Value, OcppError> {
    let response = result.map_err(into_ocpp_error)?;
    validator
        .encode(&response)
        .map_err(|e| OcppError::internal(format!("invalid response: {}", e.description)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppErrorCode;
    use serde::{Deserialize, Serialize};
    use validator::Validate;

    #[derive(Debug, Serialize, Deserialize, Validate)]
    struct Reply {
        #[validate(length(max = 3))]
        text: String,
    }

    #[test]
    fn plain_error_becomes_internal() {
        let err: HandlerError = "database unavailable".into();
        let ocpp = into_ocpp_error(err);
        assert_eq!(ocpp.code, OcppErrorCode::InternalError);
        assert_eq!(ocpp.description, "database unavailable");
    }

    #[test]
    fn wrapped_ocpp_error_keeps_code() {
        let err: HandlerError = Box::new(OcppError::new(OcppErrorCode::SecurityError, "bad key"));
        assert_eq!(into_ocpp_error(err).code, OcppErrorCode::SecurityError);
    }

    #[test]
    fn invalid_response_is_internal_error() {
        let validator = Validator::new();
        let err = respond(&validator, Ok(Reply { text: "toolong".into() })).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::InternalError);
        assert!(err.description.starts_with("invalid response:"));

        let ok = respond(&validator, Ok(Reply { text: "ok".into() })).unwrap();
        assert_eq!(ok["text"], "ok");
    }
}
