pub mod backoff;
pub mod id;
pub mod logging;
pub mod ocpp_frame;
pub mod shutdown;
pub mod validation;
