//! OCPP 2.0.1 catalog (`ocpp2.0.1`, also offered as `ocpp2.0`)

pub mod authorization;
pub mod availability;
pub mod data;
pub mod provisioning;
pub mod types;

use crate::domain::{FeatureRegistry, OcppVersion};

pub fn registry() -> FeatureRegistry {
    FeatureRegistry::new(OcppVersion::V201)
        .with_profile(provisioning::profile())
        .with_profile(authorization::profile())
        .with_profile(availability::profile())
        .with_profile(data::profile())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn station_cannot_send_csms_actions() {
        let registry = registry();
        assert!(registry.can_send(Role::ChargingStation, "Authorize"));
        assert!(!registry.can_send(Role::ChargingStation, "ClearCache"));
        assert!(registry.can_send(Role::CentralSystem, "ChangeAvailability"));
        assert!(!registry.can_send(Role::CentralSystem, "StatusNotification"));
        assert_eq!(registry.version(), OcppVersion::V201);
    }
}
