//! OCPP 2.0.1 Availability functional block

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::{Evse, StatusInfo};
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "Availability";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    #[validate(range(min = 0))]
    pub evse_id: i32,
    #[validate(range(min = 0))]
    pub connector_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct StatusNotificationResponse {}

ocpp_request!(StatusNotificationRequest => StatusNotificationResponse, "StatusNotification");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalStatus {
    Inoperative,
    Operative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAvailabilityStatus {
    Accepted,
    Rejected,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    pub operational_status: OperationalStatus,
    /// Whole station when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub evse: Option<Evse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityResponse {
    pub status: ChangeAvailabilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub status_info: Option<StatusInfo>,
}

ocpp_request!(ChangeAvailabilityRequest => ChangeAvailabilityResponse, "ChangeAvailability");

pub fn profile() -> Profile {
    Profile::new(
        PROFILE,
        vec![
            Feature::of::<StatusNotificationRequest>(Initiator::ChargingStation),
            Feature::of::<ChangeAvailabilityRequest>(Initiator::CentralSystem),
        ],
    )
}

#[async_trait]
pub trait CsmsHandler: Send + Sync + 'static {
    async fn on_status_notification(
        &self,
        station_id: &str,
        req: StatusNotificationRequest,
    ) -> HandlerResult<StatusNotificationResponse> {
        let _ = (station_id, req);
        unsupported("StatusNotification")
    }
}

struct CsmsAdapter<H>(Arc<H>);

#[async_trait]
impl<H: CsmsHandler> ProfileHandler for CsmsAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "StatusNotification" => respond(
                validator,
                self.0
                    .on_status_notification(&call.station_id, decode(call.payload)?)
                    .await,
            ),
            other => Err(OcppError::not_supported(format!("{} is not handled by the CSMS", other))),
        }
    }
}

pub fn csms<H: CsmsHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(CsmsAdapter(handler)),
    }
}

#[async_trait]
pub trait StationHandler: Send + Sync + 'static {
    async fn on_change_availability(
        &self,
        req: ChangeAvailabilityRequest,
    ) -> HandlerResult<ChangeAvailabilityResponse> {
        let _ = req;
        unsupported("ChangeAvailability")
    }
}

struct StationAdapter<H>(Arc<H>);

#[async_trait]
impl<H: StationHandler> ProfileHandler for StationAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "ChangeAvailability" => respond(validator, self.0.on_change_availability(decode(call.payload)?).await),
            other => Err(OcppError::not_supported(format!(
                "{} is not handled by the charging station",
                other
            ))),
        }
    }
}

pub fn station<H: StationHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(StationAdapter(handler)),
    }
}
