//! OCPP 1.6 RemoteTrigger profile

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::types::{MessageTrigger, TriggerMessageStatus};
use crate::application::ports::{decode, respond, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
use crate::catalog::unsupported;
use crate::domain::{Feature, Initiator, OcppError, Profile};
use crate::ocpp_request;
use crate::support::validation::Validator;

pub const PROFILE: &str = "RemoteTrigger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: MessageTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0))]
    pub connector_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TriggerMessageResponse {
    pub status: TriggerMessageStatus,
}

ocpp_request!(TriggerMessageRequest => TriggerMessageResponse, "TriggerMessage");

pub fn profile() -> Profile {
    Profile::new(
        PROFILE,
        vec![Feature::of::<TriggerMessageRequest>(Initiator::CentralSystem)],
    )
}

#[async_trait]
pub trait ChargePointHandler: Send + Sync + 'static {
    async fn on_trigger_message(&self, req: TriggerMessageRequest) -> HandlerResult<TriggerMessageResponse> {
        let _ = req;
        unsupported("TriggerMessage")
    }
}

struct ChargePointAdapter<H>(Arc<H>);

#[async_trait]
impl<H: ChargePointHandler> ProfileHandler for ChargePointAdapter<H> {
    async fn handle(&self, call: InboundCall, validator: &Validator) -> Result<Value, OcppError> {
        match call.action.as_str() {
            "TriggerMessage" => respond(validator, self.0.on_trigger_message(decode(call.payload)?).await),
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
