//! OCPP 2.0.1 DataTransfer functional block
//!
//! Either side may originate a `DataTransfer`, so both handler traits
//! carry the same single method.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::StatusInfo;
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "Data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50))]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[validate(length(max = 255))]
    pub vendor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub status_info: Option<StatusInfo>,
}

ocpp_request!(DataTransferRequest => DataTransferResponse, "DataTransfer");

pub fn profile() -> Profile {
    Profile::new(
        PROFILE,
        vec![Feature::of::<DataTransferRequest>(Initiator::Both)],
    )
}

#[async_trait]
pub trait CsmsHandler: Send + Sync + 'static {
    async fn on_data_transfer(&self, station_id: &str, req: DataTransferRequest) -> HandlerResult<DataTransferResponse> {
        let _ = (station_id, req);
        unsupported("DataTransfer")
    }
}

#[async_trait]
pub trait StationHandler: Send + Sync + 'static {
    async fn on_data_transfer(&self, req: DataTransferRequest) -> HandlerResult<DataTransferResponse> {
        let _ = req;
        unsupported("DataTransfer")
    }
}

struct CsmsAdapter<H>(Arc<H>);

#[async_trait]
impl<H: CsmsHandler> ProfileHandler for CsmsAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "DataTransfer" => respond(
                validator,
                self.0.on_data_transfer(&call.station_id, decode(call.payload)?).await,
            ),
            other => Err(OcppError::not_supported(format!("{} is not handled by the CSMS", other))),
        }
    }
}

struct StationAdapter<H>(Arc<H>);

#[async_trait]
impl<H: StationHandler> ProfileHandler for StationAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "DataTransfer" => respond(validator, self.0.on_data_transfer(decode(call.payload)?).await),
            other => Err(OcppError::not_supported(format!(
                "{} is not handled by the charging station",
                other
            ))),
        }
    }
}

pub fn csms<H: CsmsHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(CsmsAdapter(handler)),
    }
}

pub fn station<H: StationHandler>(handler: Arc<H>) -> ProfileRegistration {
    ProfileRegistration {
        profile: PROFILE,
        handler: Arc::new(StationAdapter(handler)),
    }
}
