//! OCPP 1.6 Core profile

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

pub const PROFILE: &str = "Core";

// ── Authorize ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(length(max = 20))]
    pub id_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    #[validate(nested)]
    pub id_tag_info: IdTagInfo,
}

ocpp_request!(AuthorizeRequest => AuthorizeResponse, "Authorize");

// ── BootNotification ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    #[validate(length(max = 20))]
    pub charge_point_vendor: String,
    #[validate(length(max = 20))]
    pub charge_point_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 25))]
    pub charge_point_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 25))]
    pub charge_box_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 25))]
    pub meter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 25))]
    pub meter_serial_number: Option<String>,
}

impl BootNotificationRequest {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            charge_point_vendor: vendor.into(),
            charge_point_model: model.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds.
    #[validate(range(min = 0))]
    pub interval: i32,
    pub status: RegistrationStatus,
}

ocpp_request!(BootNotificationRequest => BootNotificationResponse, "BootNotification");

// ── ChangeAvailability ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    #[validate(range(min = 0))]
    pub connector_id: i32,
    #[serde(rename = "type")]
    pub kind: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ChangeAvailabilityResponse {
    pub status: AvailabilityStatus,
}

ocpp_request!(ChangeAvailabilityRequest => ChangeAvailabilityResponse, "ChangeAvailability");

// ── ChangeConfiguration ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ChangeConfigurationRequest {
    #[validate(length(max = 50))]
    pub key: String,
    #[validate(length(max = 500))]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

ocpp_request!(ChangeConfigurationRequest => ChangeConfigurationResponse, "ChangeConfiguration");

// ── ClearCache ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClearCacheResponse {
    pub status: ClearCacheStatus,
}

ocpp_request!(ClearCacheRequest => ClearCacheResponse, "ClearCache");

// ── DataTransfer ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    #[validate(length(max = 255))]
    pub vendor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

ocpp_request!(DataTransferRequest => DataTransferResponse, "DataTransfer");

// ── GetConfiguration ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct GetConfigurationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub configuration_key: Option<Vec<KeyValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_key: Option<Vec<String>>,
}

ocpp_request!(GetConfigurationRequest => GetConfigurationResponse, "GetConfiguration");

// ── Heartbeat ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

ocpp_request!(HeartbeatRequest => HeartbeatResponse, "Heartbeat");

// ── MeterValues ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    #[validate(range(min = 0))]
    pub connector_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    #[validate(length(min = 1), nested)]
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct MeterValuesResponse {}

ocpp_request!(MeterValuesRequest => MeterValuesResponse, "MeterValues");

// ── RemoteStartTransaction ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub connector_id: Option<i32>,
    #[validate(length(max = 20))]
    pub id_tag: String,
    /// Smart charging profile, passed through untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RemoteStartTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_request!(RemoteStartTransactionRequest => RemoteStartTransactionResponse, "RemoteStartTransaction");

// ── RemoteStopTransaction ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RemoteStopTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_request!(RemoteStopTransactionRequest => RemoteStopTransactionResponse, "RemoteStopTransaction");

// ── Reset ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

ocpp_request!(ResetRequest => ResetResponse, "Reset");

// ── StartTransaction ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    #[validate(range(min = 1))]
    pub connector_id: i32,
    #[validate(length(max = 20))]
    pub id_tag: String,
    pub meter_start: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    #[validate(nested)]
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

ocpp_request!(StartTransactionRequest => StartTransactionResponse, "StartTransaction");

// ── StatusNotification ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    #[validate(range(min = 0))]
    pub connector_id: i32,
    pub error_code: ChargePointErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255))]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub vendor_error_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct StatusNotificationResponse {}

ocpp_request!(StatusNotificationRequest => StatusNotificationResponse, "StatusNotification");

// ── StopTransaction ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub id_tag: Option<String>,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub transaction_data: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub id_tag_info: Option<IdTagInfo>,
}

ocpp_request!(StopTransactionRequest => StopTransactionResponse, "StopTransaction");

// ── UnlockConnector ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    #[validate(range(min = 1))]
    pub connector_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

ocpp_request!(UnlockConnectorRequest => UnlockConnectorResponse, "UnlockConnector");

// ── Profile ────────────────────────────────────────────────────

pub fn profile() -> Profile {
    use Initiator::{Both, CentralSystem, ChargingStation};

    Profile::new(
        PROFILE,
        vec![
            Feature::of::<AuthorizeRequest>(ChargingStation),
            Feature::of::<BootNotificationRequest>(ChargingStation),
            Feature::of::<ChangeAvailabilityRequest>(CentralSystem),
            Feature::of::<ChangeConfigurationRequest>(CentralSystem),
            Feature::of::<ClearCacheRequest>(CentralSystem),
            Feature::of::<DataTransferRequest>(Both),
            Feature::of::<GetConfigurationRequest>(CentralSystem),
            Feature::of::<HeartbeatRequest>(ChargingStation),
            Feature::of::<MeterValuesRequest>(ChargingStation),
            Feature::of::<RemoteStartTransactionRequest>(CentralSystem),
            Feature::of::<RemoteStopTransactionRequest>(CentralSystem),
            Feature::of::<ResetRequest>(CentralSystem),
            Feature::of::<StartTransactionRequest>(ChargingStation),
            Feature::of::<StatusNotificationRequest>(ChargingStation),
            Feature::of::<StopTransactionRequest>(ChargingStation),
            Feature::of::<UnlockConnectorRequest>(CentralSystem),
        ],
    )
}

// ── Central system side ────────────────────────────────────────

/// Core requests a charge point sends to the central system.
///
/// Every method defaults to `NotSupported`; implement the ones you serve.
#[async_trait]
pub trait CentralSystemHandler: Send + Sync + 'static {
    async fn on_authorize(&self, station_id: &str, req: AuthorizeRequest) -> HandlerResult<AuthorizeResponse> {
        let _ = (station_id, req);
        unsupported("Authorize")
    }

    async fn on_boot_notification(
        &self,
        station_id: &str,
        req: BootNotificationRequest,
    ) -> HandlerResult<BootNotificationResponse> {
        let _ = (station_id, req);
        unsupported("BootNotification")
    }

    async fn on_data_transfer(&self, station_id: &str, req: DataTransferRequest) -> HandlerResult<DataTransferResponse> {
        let _ = (station_id, req);
        unsupported("DataTransfer")
    }

    async fn on_heartbeat(&self, station_id: &str, req: HeartbeatRequest) -> HandlerResult<HeartbeatResponse> {
        let _ = (station_id, req);
        unsupported("Heartbeat")
    }

    async fn on_meter_values(&self, station_id: &str, req: MeterValuesRequest) -> HandlerResult<MeterValuesResponse> {
        let _ = (station_id, req);
        unsupported("MeterValues")
    }

    async fn on_start_transaction(
        &self,
        station_id: &str,
        req: StartTransactionRequest,
    ) -> HandlerResult<StartTransactionResponse> {
        let _ = (station_id, req);
        unsupported("StartTransaction")
    }

    async fn on_status_notification(
        &self,
        station_id: &str,
        req: StatusNotificationRequest,
    ) -> HandlerResult<StatusNotificationResponse> {
        let _ = (station_id, req);
        unsupported("StatusNotification")
    }

    async fn on_stop_transaction(
        &self,
        station_id: &str,
        req: StopTransactionRequest,
    ) -> HandlerResult<StopTransactionResponse> {
        let _ = (station_id, req);
        unsupported("StopTransaction")
    }
}

struct CentralSystemAdapter<H>(Arc<H>);

#[async_trait]
impl<H: CentralSystemHandler> ProfileHandler for CentralSystemAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        let id = call.station_id.as_str();
        let h = &self.0;
        match call.action.as_str() {
            "Authorize" => respond(validator, h.on_authorize(id, decode(call.payload)?).await),
            "BootNotification" => respond(validator, h.on_boot_notification(id, decode(call.payload)?).await),
            "DataTransfer" => respond(validator, h.on_data_transfer(id, decode(call.payload)?).await),
            "Heartbeat" => respond(validator, h.on_heartbeat(id, decode(call.payload)?).await),
            "MeterValues" => respond(validator, h.on_meter_values(id, decode(call.payload)?).await),
            "StartTransaction" => respond(validator, h.on_start_transaction(id, decode(call.payload)?).await),
            "StatusNotification" => respond(validator, h.on_status_notification(id, decode(call.payload)?).await),
            "StopTransaction" => respond(validator, h.on_stop_transaction(id, decode(call.payload)?).await),
            other => Err(OcppError::not_supported(format!(
                "{} is not handled by the central system",
                other
            ))),
        }
    }
}

pub fn central_system<H: CentralSystemHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(CentralSystemAdapter(handler)),
    }
}

// ── Charge point side ──────────────────────────────────────────

/// Core requests the central system sends to a charge point.
#[async_trait]
pub trait ChargePointHandler: Send + Sync + 'static {
    async fn on_change_availability(
        &self,
        req: ChangeAvailabilityRequest,
    ) -> HandlerResult<ChangeAvailabilityResponse> {
        let _ = req;
        unsupported("ChangeAvailability")
    }

    async fn on_change_configuration(
        &self,
        req: ChangeConfigurationRequest,
    ) -> HandlerResult<ChangeConfigurationResponse> {
        let _ = req;
        unsupported("ChangeConfiguration")
    }

    async fn on_clear_cache(&self, req: ClearCacheRequest) -> HandlerResult<ClearCacheResponse> {
        let _ = req;
        unsupported("ClearCache")
    }

    async fn on_data_transfer(&self, req: DataTransferRequest) -> HandlerResult<DataTransferResponse> {
        let _ = req;
        unsupported("DataTransfer")
    }

    async fn on_get_configuration(&self, req: GetConfigurationRequest) -> HandlerResult<GetConfigurationResponse> {
        let _ = req;
        unsupported("GetConfiguration")
    }

    async fn on_remote_start_transaction(
        &self,
        req: RemoteStartTransactionRequest,
    ) -> HandlerResult<RemoteStartTransactionResponse> {
        let _ = req;
        unsupported("RemoteStartTransaction")
    }

    async fn on_remote_stop_transaction(
        &self,
        req: RemoteStopTransactionRequest,
    ) -> HandlerResult<RemoteStopTransactionResponse> {
        let _ = req;
        unsupported("RemoteStopTransaction")
    }

    async fn on_reset(&self, req: ResetRequest) -> HandlerResult<ResetResponse> {
        let _ = req;
        unsupported("Reset")
    }

    async fn on_unlock_connector(&self, req: UnlockConnectorRequest) -> HandlerResult<UnlockConnectorResponse> {
        let _ = req;
        unsupported("UnlockConnector")
    }
}

struct ChargePointAdapter<H>(Arc<H>);

#[async_trait]
impl<H: ChargePointHandler> ProfileHandler for ChargePointAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        let h = &self.0;
        match call.action.as_str() {
            "ChangeAvailability" => respond(validator, h.on_change_availability(decode(call.payload)?).await),
            "ChangeConfiguration" => respond(validator, h.on_change_configuration(decode(call.payload)?).await),
            "ClearCache" => respond(validator, h.on_clear_cache(decode(call.payload)?).await),
            "DataTransfer" => respond(validator, h.on_data_transfer(decode(call.payload)?).await),
            "GetConfiguration" => respond(validator, h.on_get_configuration(decode(call.payload)?).await),
            "RemoteStartTransaction" => {
                respond(validator, h.on_remote_start_transaction(decode(call.payload)?).await)
            }
            "RemoteStopTransaction" => {
                respond(validator, h.on_remote_stop_transaction(decode(call.payload)?).await)
            }
            "Reset" => respond(validator, h.on_reset(decode(call.payload)?).await),
            "UnlockConnector" => respond(validator, h.on_unlock_connector(decode(call.payload)?).await),
            other => Err(OcppError::not_supported(format!(
                "{} is not handled by the charge point",
                other
            ))),
        }
    }
}

pub fn charge_point<H: ChargePointHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(ChargePointAdapter(handler)),
    }
}
