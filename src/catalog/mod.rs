//! Message catalogs
//!
//! One module per OCPP version. Each profile module declares its message
//! structs, its [`Profile`](crate::domain::Profile) and a typed handler
//! trait per side, plus the function that adapts a handler to the
//! engine's [`ProfileRegistration`](crate::application::ports::ProfileRegistration).

pub mod v16;
pub mod v201;

use crate::application::ports::HandlerResult;
use crate::domain::OcppError;

/// Default body of handler methods a domain implementation leaves out.
pub(crate) fn unsupported<T>(action: &str) -> HandlerResult<T> {
    Err(Box::new(OcppError::not_supported(format!(
        "{} is not supported",
        action
    ))))
}
