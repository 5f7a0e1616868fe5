//! OCPP 2.0.1 Authorization functional block

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::{AuthorizationStatus, GenericStatus, IdToken, StatusInfo};
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "Authorization";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(nested)]
    pub id_token: IdToken,
    /// PEM-encoded contract certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 5500))]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IdTokenInfo {
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiry_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = -9, max = 9))]
    pub charging_priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    #[validate(nested)]
    pub id_token_info: IdTokenInfo,
}

ocpp_request!(AuthorizeRequest => AuthorizeResponse, "Authorize");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheResponse {
    pub status: GenericStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub status_info: Option<StatusInfo>,
}

ocpp_request!(ClearCacheRequest => ClearCacheResponse, "ClearCache");

pub fn profile() -> Profile {
    Profile::new(
        PROFILE,
        vec![
            Feature::of::<AuthorizeRequest>(Initiator::ChargingStation),
            Feature::of::<ClearCacheRequest>(Initiator::CentralSystem),
        ],
    )
}

#[async_trait]
pub trait CsmsHandler: Send + Sync + 'static {
    async fn on_authorize(&self, station_id: &str, req: AuthorizeRequest) -> HandlerResult<AuthorizeResponse> {
        let _ = (station_id, req);
        unsupported("Authorize")
    }
}

struct CsmsAdapter<H>(Arc<H>);

#[async_trait]
impl<H: CsmsHandler> ProfileHandler for CsmsAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "Authorize" => respond(
                validator,
                self.0.on_authorize(&call.station_id, decode(call.payload)?).await,
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
    async fn on_clear_cache(&self, req: ClearCacheRequest) -> HandlerResult<ClearCacheResponse> {
        let _ = req;
        unsupported("ClearCache")
    }
}

struct StationAdapter<H>(Arc<H>);

#[async_trait]
impl<H: StationHandler> ProfileHandler for StationAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "ClearCache" => respond(validator, self.0.on_clear_cache(decode(call.payload)?).await),
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
