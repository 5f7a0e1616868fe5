//! Features, profiles and the per-endpoint feature registry

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::domain::{OcppError, OcppPayload, OcppRequest, OcppVersion};
use crate::support::validation::Validator;

/// Checks a raw payload against a feature's schema.
pub type SchemaCheck = fn(&Validator, &Value) -> Result<(), OcppError>;

fn check_schema<T: OcppPayload>(validator: &Validator, value: &Value) -> Result<(), OcppError> {
    validator.decode::<T>(value.clone()).map(|_| ())
}

// ── Role / Initiator ───────────────────────────────────────────

/// Which side of the link an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    ChargingStation,
    CentralSystem,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChargingStation => "charging station",
            Self::CentralSystem => "central system",
        }
    }

    pub fn peer(&self) -> Role {
        match self {
            Self::ChargingStation => Self::CentralSystem,
            Self::CentralSystem => Self::ChargingStation,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side is allowed to originate a feature's `CALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    ChargingStation,
    CentralSystem,
    Both,
}

impl Initiator {
    pub fn allows(&self, role: Role) -> bool {
        matches!(
            (self, role),
            (Self::Both, _)
                | (Self::ChargingStation, Role::ChargingStation)
                | (Self::CentralSystem, Role::CentralSystem)
        )
    }
}

// ── Feature ────────────────────────────────────────────────────

/// One action together with its request and response schemas.
#[derive(Clone, Copy)]
pub struct Feature {
    pub name: &'static str,
    pub initiator: Initiator,
    request_type: &'static str,
    response_type: &'static str,
    check_request: SchemaCheck,
    check_response: SchemaCheck,
}

impl Feature {
    pub fn of<R: OcppRequest>(initiator: Initiator) -> Self {
        Self {
            name: R::ACTION,
            initiator,
            request_type: std::any::type_name::<R>(),
            response_type: std::any::type_name::<R::Response>(),
            check_request: check_schema::<R>,
            check_response: check_schema::<R::Response>,
        }
    }

    pub fn check_request(&self, validator: &Validator, payload: &Value) -> Result<(), OcppError> {
        (self.check_request)(validator, payload)
    }

    pub fn check_response(&self, validator: &Validator, payload: &Value) -> Result<(), OcppError> {
        (self.check_response)(validator, payload)
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn response_type(&self) -> &'static str {
        self.response_type
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name)
            .field("initiator", &self.initiator)
            .field("request", &self.request_type)
            .field("response", &self.response_type)
            .finish()
    }
}

// ── Profile ────────────────────────────────────────────────────

/// A named group of features, e.g. `Core` or `Reservation`.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: &'static str,
    pub features: Vec<Feature>,
}

impl Profile {
    pub fn new(name: &'static str, features: Vec<Feature>) -> Self {
        Self { name, features }
    }

    pub fn feature(&self, action: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == action)
    }
}

// ── FeatureRegistry ────────────────────────────────────────────

/// The ordered set of profiles an endpoint was configured with, plus a
/// flat action index for dispatch.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    version: OcppVersion,
    profiles: Vec<Profile>,
    by_action: HashMap<&'static str, (usize, usize)>,
}

impl FeatureRegistry {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            version,
            profiles: Vec::new(),
            by_action: HashMap::new(),
        }
    }

    /// Add a profile. An action already registered by an earlier profile
    /// keeps its first owner.
    pub fn with_profile(mut self, profile: Profile) -> Self {
        let index = self.profiles.len();
        for (feature_index, feature) in profile.features.iter().enumerate() {
            self.by_action
                .entry(feature.name)
                .or_insert((index, feature_index));
        }
        self.profiles.push(profile);
        self
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Resolve an action to its owning profile and feature.
    pub fn resolve(&self, action: &str) -> Option<(&Profile, &Feature)> {
        let (p, f) = *self.by_action.get(action)?;
        let profile = &self.profiles[p];
        Some((profile, &profile.features[f]))
    }

    /// Whether an endpoint playing `role` may originate `action`.
    pub fn can_send(&self, role: Role, action: &str) -> bool {
        self.resolve(action)
            .map(|(_, feature)| feature.initiator.allows(role))
            .unwrap_or(false)
    }

    pub fn actions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.profiles
            .iter()
            .flat_map(|p| p.features.iter().map(|f| f.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use validator::Validate;

    #[derive(Debug, Serialize, Deserialize, Validate)]
    struct PingRequest {}

    #[derive(Debug, Serialize, Deserialize, Validate)]
    #[serde(rename_all = "camelCase")]
    struct PingResponse {
        #[validate(length(max = 5))]
        echo: String,
    }

    crate::ocpp_request!(PingRequest => PingResponse, "Ping");

    #[derive(Debug, Serialize, Deserialize, Validate)]
    struct PushRequest {}

    crate::ocpp_request!(PushRequest => PingRequest, "Push");

    fn registry() -> FeatureRegistry {
        FeatureRegistry::new(OcppVersion::V16)
            .with_profile(Profile::new(
                "Core",
                vec![Feature::of::<PingRequest>(Initiator::ChargingStation)],
            ))
            .with_profile(Profile::new(
                "Extra",
                vec![
                    Feature::of::<PushRequest>(Initiator::CentralSystem),
                    Feature::of::<PingRequest>(Initiator::Both),
                ],
            ))
    }

    #[test]
    fn resolve_returns_owning_profile() {
        let reg = registry();
        let (profile, feature) = reg.resolve("Push").unwrap();
        assert_eq!(profile.name, "Extra");
        assert_eq!(feature.name, "Push");
        assert!(reg.resolve("MadeUpAction").is_none());
    }

    #[test]
    fn first_profile_keeps_duplicate_action() {
        let reg = registry();
        let (profile, feature) = reg.resolve("Ping").unwrap();
        assert_eq!(profile.name, "Core");
        assert_eq!(feature.initiator, Initiator::ChargingStation);
    }

    #[test]
    fn can_send_follows_initiator() {
        let reg = registry();
        assert!(reg.can_send(Role::ChargingStation, "Ping"));
        assert!(!reg.can_send(Role::CentralSystem, "Ping"));
        assert!(reg.can_send(Role::CentralSystem, "Push"));
        assert!(!reg.can_send(Role::CentralSystem, "Unknown"));
    }

    #[test]
    fn schema_checks_use_the_bound_types() {
        let reg = registry();
        let (_, feature) = reg.resolve("Ping").unwrap();
        let validator = Validator::new();
        assert!(feature
            .check_response(&validator, &serde_json::json!({"echo": "hi"}))
            .is_ok());
        let err = feature
            .check_response(&validator, &serde_json::json!({"echo": "too long"}))
            .unwrap_err();
        assert_eq!(err.code, crate::domain::OcppErrorCode::PropertyConstraintViolation);
        assert!(feature.request_type().ends_with("PingRequest"));
    }
}
