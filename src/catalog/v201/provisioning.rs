//! OCPP 2.0.1 Provisioning functional block

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::*;
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "Provisioning";

// ── BootNotification ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Modem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub imsi: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 25))]
    pub serial_number: Option<String>,
    #[validate(length(max = 20))]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub modem: Option<Modem>,
    #[validate(length(max = 50))]
    pub vendor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    #[validate(nested)]
    pub charging_station: ChargingStation,
    pub reason: BootReason,
}

impl BootNotificationRequest {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>, reason: BootReason) -> Self {
        Self {
            charging_station: ChargingStation {
                serial_number: None,
                model: model.into(),
                modem: None,
                vendor_name: vendor.into(),
                firmware_version: None,
            },
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub status_info: Option<StatusInfo>,
}

ocpp_request!(BootNotificationRequest => BootNotificationResponse, "BootNotification");

// ── Heartbeat ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

ocpp_request!(HeartbeatRequest => HeartbeatResponse, "Heartbeat");

// ── Reset ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Immediate,
    OnIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0))]
    pub evse_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub status_info: Option<StatusInfo>,
}

ocpp_request!(ResetRequest => ResetResponse, "Reset");

// ── GetVariables ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetVariableStatus {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
    NotSupportedAttributeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[validate(nested)]
    pub component: Component,
    #[validate(nested)]
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesRequest {
    #[validate(length(min = 1), nested)]
    pub get_variable_data: Vec<GetVariableData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableResult {
    pub attribute_status: GetVariableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2500))]
    pub attribute_value: Option<String>,
    #[validate(nested)]
    pub component: Component,
    #[validate(nested)]
    pub variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub attribute_status_info: Option<StatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesResponse {
    #[validate(length(min = 1), nested)]
    pub get_variable_result: Vec<GetVariableResult>,
}

ocpp_request!(GetVariablesRequest => GetVariablesResponse, "GetVariables");

// ── SetVariables ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetVariableStatus {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
    NotSupportedAttributeType,
    RebootRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[validate(length(max = 1000))]
    pub attribute_value: String,
    #[validate(nested)]
    pub component: Component,
    #[validate(nested)]
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesRequest {
    #[validate(length(min = 1), nested)]
    pub set_variable_data: Vec<SetVariableData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    pub attribute_status: SetVariableStatus,
    #[validate(nested)]
    pub component: Component,
    #[validate(nested)]
    pub variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub attribute_status_info: Option<StatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesResponse {
    #[validate(length(min = 1), nested)]
    pub set_variable_result: Vec<SetVariableResult>,
}

ocpp_request!(SetVariablesRequest => SetVariablesResponse, "SetVariables");

// ── Profile ────────────────────────────────────────────────────

pub fn profile() -> Profile {
    use Initiator::{CentralSystem, ChargingStation};

    Profile::new(
        PROFILE,
        vec![
            Feature::of::<BootNotificationRequest>(ChargingStation),
            Feature::of::<HeartbeatRequest>(ChargingStation),
            Feature::of::<ResetRequest>(CentralSystem),
            Feature::of::<GetVariablesRequest>(CentralSystem),
            Feature::of::<SetVariablesRequest>(CentralSystem),
        ],
    )
}

// ── CSMS side ──────────────────────────────────────────────────

#[async_trait]
pub trait CsmsHandler: Send + Sync + 'static {
    async fn on_boot_notification(
        &self,
        station_id: &str,
        req: BootNotificationRequest,
    ) -> HandlerResult<BootNotificationResponse> {
        let _ = (station_id, req);
        unsupported("BootNotification")
    }

    async fn on_heartbeat(&self, station_id: &str, req: HeartbeatRequest) -> HandlerResult<HeartbeatResponse> {
        let _ = (station_id, req);
        unsupported("Heartbeat")
    }
}

struct CsmsAdapter<H>(Arc<H>);

#[async_trait]
impl<H: CsmsHandler> ProfileHandler for CsmsAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        let id = call.station_id.as_str();
        match call.action.as_str() {
            "BootNotification" => respond(validator, self.0.on_boot_notification(id, decode(call.payload)?).await),
            "Heartbeat" => respond(validator, self.0.on_heartbeat(id, decode(call.payload)?).await),
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

// ── Station side ───────────────────────────────────────────────

#[async_trait]
pub trait StationHandler: Send + Sync + 'static {
    async fn on_reset(&self, req: ResetRequest) -> HandlerResult<ResetResponse> {
        let _ = req;
        unsupported("Reset")
    }

    async fn on_get_variables(&self, req: GetVariablesRequest) -> HandlerResult<GetVariablesResponse> {
        let _ = req;
        unsupported("GetVariables")
    }

    async fn on_set_variables(&self, req: SetVariablesRequest) -> HandlerResult<SetVariablesResponse> {
        let _ = req;
        unsupported("SetVariables")
    }
}

struct StationAdapter<H>(Arc<H>);

#[async_trait]
impl<H: StationHandler> ProfileHandler for StationAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "Reset" => respond(validator, self.0.on_reset(decode(call.payload)?).await),
            "GetVariables" => respond(validator, self.0.on_get_variables(decode(call.payload)?).await),
            "SetVariables" => respond(validator, self.0.on_set_variables(decode(call.payload)?).await),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppErrorCode;
    use serde_json::json;

    #[test]
    fn get_variables_needs_at_least_one_entry() {
        let validator = Validator::new();
        let err = validator
            .decode::<GetVariablesRequest>(json!({"getVariableData": []}))
            .unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn boot_reason_must_be_known() {
        let validator = Validator::new();
        let err = validator
            .decode::<BootNotificationRequest>(json!({
                "chargingStation": {"model": "X1", "vendorName": "Acme"},
                "reason": "Sunrise"
            }))
            .unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn missing_charging_station_is_occurrence_violation() {
        let validator = Validator::new();
        let err = validator
            .decode::<BootNotificationRequest>(json!({"reason": "PowerUp"}))
            .unwrap_err();
        assert_eq!(err.code, OcppErrorCode::OccurrenceConstraintViolation);
    }

    struct Variables;

    #[async_trait]
    impl StationHandler for Variables {
        async fn on_get_variables(&self, req: GetVariablesRequest) -> HandlerResult<GetVariablesResponse> {
            let get_variable_result = req
                .get_variable_data
                .into_iter()
                .map(|data| GetVariableResult {
                    attribute_status: GetVariableStatus::Accepted,
                    attribute_type: data.attribute_type,
                    attribute_value: Some("60".into()),
                    component: data.component,
                    variable: data.variable,
                    attribute_status_info: None,
                })
                .collect();
            Ok(GetVariablesResponse { get_variable_result })
        }
    }

    #[tokio::test]
    async fn station_adapter_dispatches_get_variables() {
        let registration = station(Arc::new(Variables));
        let call = InboundCall {
            station_id: "CS001".into(),
            unique_id: "g1".into(),
            action: "GetVariables".into(),
            payload: json!({"getVariableData": [{
                "component": {"name": "OCPPCommCtrlr"},
                "variable": {"name": "HeartbeatInterval"}
            }]}),
        };
        let value = registration.handler.handle(call, &Validator::new()).await.unwrap();
        assert_eq!(value["getVariableResult"][0]["attributeValue"], "60");
        assert_eq!(value["getVariableResult"][0]["attributeStatus"], "Accepted");
    }
}
