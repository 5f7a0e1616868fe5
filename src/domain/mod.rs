pub mod error;
pub mod feature;
pub mod message;
pub mod ocpp;

pub use error::{ConfigError, EndpointError, OcppError, OcppErrorCode, TransportError};
pub use feature::{Feature, FeatureRegistry, Initiator, Profile, Role};
pub use message::{OcppPayload, OcppRequest};
pub use ocpp::OcppVersion;
