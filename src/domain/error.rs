//! Protocol and endpoint errors

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::domain::OcppVersion;

// ── OcppErrorCode ──────────────────────────────────────────────

/// Error codes carried in a `CALL_ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcppErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    /// 2.0.1 only; 1.6 peers receive `NotSupported`.
    MessageTypeNotSupported,
    /// 2.0.1 only; 1.6 peers receive `GenericError`.
    RpcFrameworkError,
}

impl OcppErrorCode {
    /// Wire spelling of the code for the given protocol version.
    ///
    /// 1.6 spells `OccurenceConstraintViolation` with a single "r" and has
    /// no `FormatViolation` alias.
    pub fn as_str(&self, version: OcppVersion) -> &'static str {
        match (self, version) {
            (Self::NotImplemented, _) => "NotImplemented",
            (Self::NotSupported, _) => "NotSupported",
            (Self::InternalError, _) => "InternalError",
            (Self::ProtocolError, _) => "ProtocolError",
            (Self::SecurityError, _) => "SecurityError",
            (Self::FormationViolation, OcppVersion::V16) => "FormationViolation",
            (Self::FormationViolation, OcppVersion::V201) => "FormatViolation",
            (Self::PropertyConstraintViolation, _) => "PropertyConstraintViolation",
            (Self::OccurrenceConstraintViolation, OcppVersion::V16) => {
                "OccurenceConstraintViolation"
            }
            (Self::OccurrenceConstraintViolation, OcppVersion::V201) => {
                "OccurrenceConstraintViolation"
            }
            (Self::TypeConstraintViolation, _) => "TypeConstraintViolation",
            (Self::GenericError, _) => "GenericError",
            (Self::MessageTypeNotSupported, OcppVersion::V16) => "NotSupported",
            (Self::MessageTypeNotSupported, OcppVersion::V201) => "MessageTypeNotSupported",
            (Self::RpcFrameworkError, OcppVersion::V16) => "GenericError",
            (Self::RpcFrameworkError, OcppVersion::V201) => "RpcFrameworkError",
        }
    }

    /// Parse a wire error code, accepting the spellings of both versions.
    pub fn parse(s: &str) -> Option<Self> {
        let code = match s {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" | "FormatViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                Self::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            "GenericError" => Self::GenericError,
            "MessageTypeNotSupported" => Self::MessageTypeNotSupported,
            "RpcFrameworkError" => Self::RpcFrameworkError,
            _ => return None,
        };
        Some(code)
    }

    /// Parse a received code; unknown codes degrade to `GenericError`.
    pub fn parse_lossy(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::GenericError)
    }
}

impl fmt::Display for OcppErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str(OcppVersion::V201))
    }
}

// ── OcppError ──────────────────────────────────────────────────

/// A protocol-level error, either received in a `CALL_ERROR` or produced
/// locally and destined for one.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct OcppError {
    pub code: OcppErrorCode,
    pub description: String,
    pub details: Value,
}

impl OcppError {
    pub fn new(code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            OcppErrorCode::NotImplemented,
            format!("no handler for action {}", action),
        )
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::NotSupported, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::InternalError, description)
    }

    pub fn formation(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::FormationViolation, description)
    }

    pub fn property(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::PropertyConstraintViolation, description)
    }

    /// Synthetic error delivered when a request receives no answer in time.
    pub fn timeout() -> Self {
        Self::new(OcppErrorCode::GenericError, "request timed out")
    }
}

// ── TransportError ─────────────────────────────────────────────

/// Failures of the WebSocket layer.
///
/// Carried by value to several subscribers (disconnect callbacks, the error
/// stream, every canceled request), so the variants hold rendered strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("write timed out")]
    WriteTimeout,

    #[error("read timed out: no frame within {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed by peer (code {code}): {reason}")]
    ClosedByPeer { code: u16, reason: String },

    #[error("connection reset without close frame")]
    ConnectionReset,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("subprotocol not negotiated: {0}")]
    Subprotocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ── EndpointError ──────────────────────────────────────────────

/// Errors surfaced to callers of the endpoint facades.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EndpointError {
    /// Remote `CALL_ERROR`, validation failure or timeout.
    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer {0} is not connected")]
    NotConnected(String),

    #[error("request queue for {0} is full")]
    QueueFull(String),

    #[error("a request to {0} is already in flight")]
    Busy(String),

    #[error("action {action} cannot be sent by the {role}")]
    UnsupportedAction { action: String, role: &'static str },

    #[error("{action} canceled: {reason}")]
    Canceled { action: String, reason: String },

    /// The peer answered with a payload that failed decoding or validation.
    #[error("invalid response: {0}")]
    InvalidResponse(OcppError),
}

impl EndpointError {
    /// The OCPP error code, when the failure maps to one.
    pub fn code(&self) -> Option<OcppErrorCode> {
        match self {
            Self::Ocpp(e) | Self::InvalidResponse(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Ocpp(e) if *e == OcppError::timeout())
    }
}

// ── ConfigError ────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spelling_differs_by_version() {
        let code = OcppErrorCode::OccurrenceConstraintViolation;
        assert_eq!(code.as_str(OcppVersion::V16), "OccurenceConstraintViolation");
        assert_eq!(code.as_str(OcppVersion::V201), "OccurrenceConstraintViolation");
        assert_eq!(
            OcppErrorCode::FormationViolation.as_str(OcppVersion::V201),
            "FormatViolation"
        );
    }

    #[test]
    fn parse_accepts_both_spellings() {
        for s in ["OccurenceConstraintViolation", "OccurrenceConstraintViolation"] {
            assert_eq!(
                OcppErrorCode::parse(s),
                Some(OcppErrorCode::OccurrenceConstraintViolation)
            );
        }
        assert_eq!(
            OcppErrorCode::parse("FormatViolation"),
            Some(OcppErrorCode::FormationViolation)
        );
        assert_eq!(OcppErrorCode::parse("Bogus"), None);
        assert_eq!(OcppErrorCode::parse_lossy("Bogus"), OcppErrorCode::GenericError);
    }

    #[test]
    fn two_zero_one_only_codes_degrade_on_16() {
        assert_eq!(
            OcppErrorCode::MessageTypeNotSupported.as_str(OcppVersion::V16),
            "NotSupported"
        );
        assert_eq!(
            OcppErrorCode::RpcFrameworkError.as_str(OcppVersion::V16),
            "GenericError"
        );
    }

    #[test]
    fn not_implemented_text() {
        let err = OcppError::not_implemented("MadeUpAction");
        assert_eq!(err.code, OcppErrorCode::NotImplemented);
        assert_eq!(err.description, "no handler for action MadeUpAction");
        assert_eq!(err.details, serde_json::json!({}));
    }

    #[test]
    fn endpoint_error_code() {
        let err = EndpointError::from(OcppError::timeout());
        assert!(err.is_timeout());
        assert_eq!(err.code(), Some(OcppErrorCode::GenericError));
        assert_eq!(EndpointError::Busy("CS001".into()).code(), None);
    }
}
