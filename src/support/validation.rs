//! Payload validation
//!
//! Field rules are declared on the catalog structs with `validator` derive
//! attributes. The [`Validator`] applies them, together with any extra
//! per-type rules, and classifies failures into OCPP error codes:
//!
//! | Failure                          | Code                            |
//! |----------------------------------|---------------------------------|
//! | required field missing           | `OccurrenceConstraintViolation` |
//! | wrong JSON type                  | `TypeConstraintViolation`       |
//! | unknown enum value               | `PropertyConstraintViolation`   |
//! | length / range / set-size rule   | `PropertyConstraintViolation`   |

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use validator::Validate;

use crate::domain::{OcppError, OcppErrorCode, OcppPayload};

/// Additional rule evaluated against the raw JSON of a payload type.
pub type ExtraRule = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Endpoint-scoped validator.
///
/// Cloning is cheap; clones share the rule table.
#[derive(Clone)]
pub struct Validator {
    enabled: bool,
    rules: Arc<HashMap<&'static str, Vec<ExtraRule>>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            enabled: true,
            rules: Arc::new(HashMap::new()),
        }
    }

    /// A validator that only decodes; rule checks are skipped.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register an extra rule for payload type `T`.
    pub fn with_rule<T, F>(mut self, rule: F) -> Self
    where
        T: OcppPayload,
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.rules)
            .entry(type_name::<T>())
            .or_default()
            .push(Arc::new(rule));
        self
    }

    /// Run the derive rules and extra rules for an already-typed payload.
    pub fn check<T: OcppPayload>(&self, payload: &T, raw: &Value) -> Result<(), OcppError> {
        if !self.enabled {
            return Ok(());
        }
        payload
            .validate()
            .map_err(|e| OcppError::property(e.to_string().replace('\n', "; ")))?;
        if let Some(rules) = self.rules.get(type_name::<T>()) {
            for rule in rules {
                rule(raw).map_err(OcppError::property)?;
            }
        }
        Ok(())
    }

    /// Decode a raw payload into `T` and validate it.
    pub fn decode<T: OcppPayload>(&self, value: Value) -> Result<T, OcppError> {
        let payload: T = serde_json::from_value(value.clone()).map_err(|e| classify(&e))?;
        self.check(&payload, &value)?;
        Ok(payload)
    }

    /// Validate and encode a typed payload.
    pub fn encode<T: OcppPayload>(&self, payload: &T) -> Result<Value, OcppError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| OcppError::internal(format!("serialization failed: {}", e)))?;
        self.check(payload, &value)?;
        Ok(normalize(value))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("enabled", &self.enabled)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Map a serde decoding error to the matching OCPP error code.
pub fn classify(err: &serde_json::Error) -> OcppError {
    let msg = err.to_string();
    let code = if msg.starts_with("missing field") {
        OcppErrorCode::OccurrenceConstraintViolation
    } else if msg.starts_with("unknown variant") || msg.starts_with("unknown field") {
        OcppErrorCode::PropertyConstraintViolation
    } else if err.is_syntax() || err.is_eof() {
        OcppErrorCode::FormationViolation
    } else {
        OcppErrorCode::TypeConstraintViolation
    };
    OcppError::new(code, msg)
}

/// Payloads that serialize to `null` (unit structs) go on the wire as `{}`.
fn normalize(value: Value) -> Value {
    match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum Status {
        Accepted,
        Rejected,
    }

    #[derive(Debug, Serialize, Deserialize, Validate)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[validate(length(max = 20))]
        id_tag: String,
        #[validate(range(min = 0))]
        connector_id: i32,
        status: Status,
        #[validate(length(min = 1))]
        #[serde(default)]
        values: Vec<i32>,
    }

    fn sample() -> Value {
        json!({"idTag": "ABC", "connectorId": 1, "status": "Accepted", "values": [1]})
    }

    #[test]
    fn decode_valid_payload() {
        let s: Sample = Validator::new().decode(sample()).unwrap();
        assert_eq!(s.id_tag, "ABC");
        assert_eq!(s.status, Status::Accepted);
    }

    #[test]
    fn missing_field_is_occurrence_violation() {
        let err = Validator::new()
            .decode::<Sample>(json!({"connectorId": 1, "status": "Accepted"}))
            .unwrap_err();
        assert_eq!(err.code, OcppErrorCode::OccurrenceConstraintViolation);
    }

    #[test]
    fn wrong_type_is_type_violation() {
        let mut v = sample();
        v["connectorId"] = json!("one");
        let err = Validator::new().decode::<Sample>(v).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn unknown_enum_is_property_violation() {
        let mut v = sample();
        v["status"] = json!("Maybe");
        let err = Validator::new().decode::<Sample>(v).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn length_and_range_rules_are_property_violations() {
        let mut v = sample();
        v["idTag"] = json!("X".repeat(21));
        let err = Validator::new().decode::<Sample>(v).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);

        let mut v = sample();
        v["connectorId"] = json!(-1);
        assert!(Validator::new().decode::<Sample>(v).is_err());

        let mut v = sample();
        v["values"] = json!([]);
        assert!(Validator::new().decode::<Sample>(v).is_err());
    }

    #[test]
    fn disabled_validator_still_decodes() {
        let mut v = sample();
        v["idTag"] = json!("X".repeat(21));
        let s: Sample = Validator::disabled().decode(v).unwrap();
        assert_eq!(s.id_tag.len(), 21);

        let err = Validator::disabled()
            .decode::<Sample>(json!({"idTag": "A"}))
            .unwrap_err();
        assert_eq!(err.code, OcppErrorCode::OccurrenceConstraintViolation);
    }

    #[test]
    fn extra_rules_are_scoped_to_type() {
        let validator = Validator::new().with_rule::<Sample, _>(|raw| {
            if raw["idTag"] == "BLOCKED" {
                Err("idTag is blocked".into())
            } else {
                Ok(())
            }
        });
        let mut v = sample();
        v["idTag"] = json!("BLOCKED");
        let err = validator.decode::<Sample>(v).unwrap_err();
        assert_eq!(err.description, "idTag is blocked");
        assert!(validator.decode::<Sample>(sample()).is_ok());
    }

    #[test]
    fn encode_rejects_invalid_payload() {
        let s = Sample {
            id_tag: "X".repeat(30),
            connector_id: 1,
            status: Status::Rejected,
            values: vec![1],
        };
        let err = Validator::new().encode(&s).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);
        assert!(Validator::disabled().encode(&s).is_ok());
    }
}
