pub mod dispatcher;
pub mod pending;
pub mod ports;

pub use dispatcher::{Dispatcher, DispatcherConfig, OutboundTransport, PeerStats};
pub use pending::{Completion, PendingSlot};
pub use ports::{HandlerError, HandlerResult, InboundCall, ProfileHandler, ProfileRegistration};
