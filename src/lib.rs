//! # ocppj
//!
//! OCPP-J (OCPP over WebSocket) engine for OCPP 1.6 and 2.0.1.
//!
//! Both sides of the link are provided:
//!
//! - [`CentralSystem`]: WebSocket server accepting charging stations
//! - [`ChargingStation`]: WebSocket client with keep-alive and reconnect
//!
//! ## Architecture
//!
//! - **domain**: errors, versions, features and the typed message traits
//! - **support**: frame codec, validation, ids, backoff, shutdown, logging
//! - **application**: request dispatcher and handler ports
//! - **infrastructure**: WebSocket channel, server, client and TLS
//! - **interfaces**: the two endpoint facades
//! - **catalog**: message structs and handler traits per OCPP version
//!
//! ```ignore
//! use ocppj::catalog::v16;
//! use ocppj::CentralSystem;
//!
//! let csms = CentralSystem::new(v16::registry());
//! csms.register(v16::core::central_system(Arc::new(MyHandler)));
//! csms.start("0.0.0.0:8887").await?;
//! ```

pub mod application;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interfaces;
pub mod support;

pub use config::{default_config_path, AppConfig};
pub use domain::{
    ConfigError, EndpointError, FeatureRegistry, OcppError, OcppErrorCode, OcppRequest,
    OcppVersion, Role, TransportError,
};
pub use interfaces::{CentralSystem, CentralSystemBuilder, ChargingStation, ChargingStationBuilder};
pub use support::logging::init_tracing;
pub use support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};
