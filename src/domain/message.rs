//! Typed message contracts
//!
//! Every catalog struct implements [`OcppPayload`]; request structs
//! additionally bind their action name and response type through
//! [`OcppRequest`]. The `ocpp_request!` macro keeps those bindings on one
//! line per action.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use validator::Validate;

/// Anything that can travel as an OCPP-J payload.
pub trait OcppPayload: Serialize + DeserializeOwned + Validate + Debug + Send + Sync + 'static {}

impl<T> OcppPayload for T where
    T: Serialize + DeserializeOwned + Validate + Debug + Send + Sync + 'static
{
}

/// A request payload bound to its action and response type.
pub trait OcppRequest: OcppPayload {
    type Response: OcppPayload;

    /// Action name as it appears in element 2 of a `CALL` frame.
    const ACTION: &'static str;
}

/// Bind a request struct to its response and action name.
///
/// ```ignore
/// ocpp_request!(HeartbeatRequest => HeartbeatResponse, "Heartbeat");
/// ```
#[macro_export]
macro_rules! ocpp_request {
    ($req:ty => $resp:ty, $action:literal) => {
        impl $crate::domain::OcppRequest for $req {
            type Response = $resp;
            const ACTION: &'static str = $action;
        }
    };
}
