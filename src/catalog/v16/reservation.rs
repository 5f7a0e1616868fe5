//! OCPP 1.6 Reservation profile

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::{CancelReservationStatus, ReservationStatus};
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "Reservation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    #[validate(range(min = 0))]
    pub connector_id: i32,
    pub expiry_date: DateTime<Utc>,
    #[validate(length(max = 20))]
    pub id_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 20))]
    pub parent_id_tag: Option<String>,
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
}

ocpp_request!(ReserveNowRequest => ReserveNowResponse, "ReserveNow");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CancelReservationResponse {
    pub status: CancelReservationStatus,
}

ocpp_request!(CancelReservationRequest => CancelReservationResponse, "CancelReservation");

pub fn profile() -> Profile {
    Profile::new(
        PROFILE,
        vec![
            Feature::of::<ReserveNowRequest>(Initiator::CentralSystem),
            Feature::of::<CancelReservationRequest>(Initiator::CentralSystem),
        ],
    )
}

/// Reservation requests handled by a charge point.
#[async_trait]
pub trait ChargePointHandler: Send + Sync + 'static {
    async fn on_reserve_now(&self, req: ReserveNowRequest) -> HandlerResult<ReserveNowResponse> {
        let _ = req;
        unsupported("ReserveNow")
    }

    async fn on_cancel_reservation(&self, req: CancelReservationRequest) -> HandlerResult<CancelReservationResponse> {
        let _ = req;
        unsupported("CancelReservation")
    }
}

struct ChargePointAdapter<H>(Arc<H>);

#[async_trait]
impl<H: ChargePointHandler> ProfileHandler for ChargePointAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "ReserveNow" => respond(validator, self.0.on_reserve_now(decode(call.payload)?).await),
            "CancelReservation" => respond(validator, self.0.on_cancel_reservation(decode(call.payload)?).await),
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
