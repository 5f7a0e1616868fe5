//! OCPP-J message framing
//!
//! Implements the OCPP-J (JSON over WebSocket) envelope. The framing is
//! identical for 1.6 and 2.0.1:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

use crate::domain::{OcppError, OcppErrorCode, OcppVersion};

// ── Message-type constants ─────────────────────────────────────

pub const MSG_TYPE_CALL: u64 = 2;
pub const MSG_TYPE_CALL_RESULT: u64 = 3;
pub const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Longest unique id a peer may use.
pub const MAX_UNIQUE_ID_LEN: usize = 36;

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    ///
    /// The code is kept as received so unknown codes survive a round trip.
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse a raw JSON text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FrameError::new(FrameErrorKind::InvalidJson(e.to_string())))?;

        let arr = match value {
            Value::Array(arr) => arr,
            _ => return Err(FrameError::new(FrameErrorKind::NotAnArray)),
        };

        // Recover what we can up front so every later error can be answered.
        let unique_id = arr.get(1).and_then(Value::as_str).map(str::to_string);
        let message_type = arr.first().and_then(Value::as_u64);
        let fail = |kind| FrameError {
            unique_id: unique_id.clone().filter(|id| valid_unique_id(id)),
            message_type,
            kind,
        };

        let msg_type = message_type.ok_or_else(|| fail(FrameErrorKind::InvalidMessageType))?;
        if !matches!(
            msg_type,
            MSG_TYPE_CALL | MSG_TYPE_CALL_RESULT | MSG_TYPE_CALL_ERROR
        ) {
            return Err(fail(FrameErrorKind::UnknownMessageType(msg_type)));
        }

        let unique_id = match &unique_id {
            Some(id) if valid_unique_id(id) => id.clone(),
            Some(_) => return Err(fail(FrameErrorKind::InvalidUniqueId)),
            None => return Err(fail(FrameErrorKind::FieldTypeMismatch("uniqueId must be a string"))),
        };

        let expect_len = |allowed: &[usize]| {
            if allowed.contains(&arr.len()) {
                Ok(())
            } else {
                Err(fail(FrameErrorKind::WrongLength {
                    expected: allowed[0],
                    got: arr.len(),
                }))
            }
        };

        match msg_type {
            MSG_TYPE_CALL => {
                expect_len(&[4])?;
                let action = arr[2]
                    .as_str()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| fail(FrameErrorKind::FieldTypeMismatch("action must be a string")))?
                    .to_string();
                let payload = payload_object(&arr[3])
                    .ok_or_else(|| fail(FrameErrorKind::FieldTypeMismatch("payload must be an object")))?;
                Ok(Self::Call {
                    unique_id,
                    action,
                    payload,
                })
            }
            MSG_TYPE_CALL_RESULT => {
                expect_len(&[3])?;
                let payload = payload_object(&arr[2])
                    .ok_or_else(|| fail(FrameErrorKind::FieldTypeMismatch("payload must be an object")))?;
                Ok(Self::CallResult { unique_id, payload })
            }
            _ => {
                expect_len(&[5, 4])?;
                let error_code = arr[2]
                    .as_str()
                    .ok_or_else(|| fail(FrameErrorKind::FieldTypeMismatch("errorCode must be a string")))?
                    .to_string();
                let error_description = arr[3]
                    .as_str()
                    .ok_or_else(|| {
                        fail(FrameErrorKind::FieldTypeMismatch("errorDescription must be a string"))
                    })?
                    .to_string();
                let error_details = match arr.get(4) {
                    Some(details) => payload_object(details).ok_or_else(|| {
                        fail(FrameErrorKind::FieldTypeMismatch("errorDetails must be an object"))
                    })?,
                    None => empty_object(),
                };
                Ok(Self::CallError {
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                })
            }
        }
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to its JSON array text.
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                non_null(payload),
            ]),

            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_RESULT),
                Value::String(unique_id.clone()),
                non_null(payload),
            ]),

            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_ERROR),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                non_null(error_details),
            ]),
        }
    }

    // ── Helpers ────────────────────────────────────────────

    /// Get the unique message ID.
    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a `CallError` from an [`OcppError`], spelled for `version`.
    pub fn error_response(unique_id: impl Into<String>, error: &OcppError, version: OcppVersion) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error.code.as_str(version).to_string(),
            error_description: error.description.clone(),
            error_details: non_null(&error.details),
        }
    }

    /// Interpret a `CallError` frame as an [`OcppError`].
    pub fn as_ocpp_error(&self) -> Option<OcppError> {
        match self {
            Self::CallError {
                error_code,
                error_description,
                error_details,
                ..
            } => Some(
                OcppError::new(OcppErrorCode::parse_lossy(error_code), error_description.clone())
                    .with_details(error_details.clone()),
            ),
            _ => None,
        }
    }

    /// Returns `true` if this is a `Call` frame.
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    /// Returns `true` if this is a `CallResult` frame.
    pub fn is_call_result(&self) -> bool {
        matches!(self, Self::CallResult { .. })
    }

    /// Returns `true` if this is a `CallError` frame.
    pub fn is_call_error(&self) -> bool {
        matches!(self, Self::CallError { .. })
    }
}

fn valid_unique_id(id: &str) -> bool {
    !id.is_empty() && id.chars().count() <= MAX_UNIQUE_ID_LEN
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn payload_object(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::Null => Some(empty_object()),
        _ => None,
    }
}

fn non_null(value: &Value) -> Value {
    match value {
        Value::Null => empty_object(),
        other => other.clone(),
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// A frame that could not be parsed, with whatever envelope fields were
/// recoverable before the failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}")]
pub struct FrameError {
    pub unique_id: Option<String>,
    pub message_type: Option<u64>,
    pub kind: FrameErrorKind,
}

impl FrameError {
    fn new(kind: FrameErrorKind) -> Self {
        Self {
            unique_id: None,
            message_type: None,
            kind,
        }
    }

    /// The error to report back to the peer, when the frame can be answered.
    pub fn to_ocpp_error(&self) -> OcppError {
        match self.kind {
            FrameErrorKind::UnknownMessageType(_) => OcppError::new(
                OcppErrorCode::MessageTypeNotSupported,
                self.kind.to_string(),
            ),
            _ => OcppError::formation(self.kind.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameErrorKind {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON array")]
    NotAnArray,

    #[error("message type is not a number")]
    InvalidMessageType,

    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("uniqueId must be a non-empty string of at most 36 characters")]
    InvalidUniqueId,

    #[error("expected {expected} elements, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}
