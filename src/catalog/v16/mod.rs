//! OCPP 1.6 catalog (`ocpp1.6`)

pub mod core;
pub mod remote_trigger;
pub mod reservation;
pub mod types;

use crate::domain::{FeatureRegistry, OcppVersion};

/// Every 1.6 profile this crate ships, Core first.
pub fn registry() -> FeatureRegistry {
    FeatureRegistry::new(OcppVersion::V16)
        .with_profile(core::profile())
        .with_profile(reservation::profile())
        .with_profile(remote_trigger::profile())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn gating_by_role() {
        let registry = registry();
        assert!(registry.can_send(Role::ChargingStation, "BootNotification"));
        assert!(!registry.can_send(Role::CentralSystem, "BootNotification"));
        assert!(registry.can_send(Role::CentralSystem, "ReserveNow"));
        assert!(registry.can_send(Role::CentralSystem, "TriggerMessage"));
        assert!(registry.can_send(Role::ChargingStation, "DataTransfer"));
        assert!(registry.can_send(Role::CentralSystem, "DataTransfer"));
    }

    #[test]
    fn actions_resolve_to_their_profile() {
        let registry = registry();
        assert_eq!(registry.resolve("CancelReservation").unwrap().0.name, reservation::PROFILE);
        assert_eq!(registry.resolve("Heartbeat").unwrap().0.name, core::PROFILE);
        assert_eq!(registry.actions().count(), 19);
    }
}
