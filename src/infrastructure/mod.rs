//! Infrastructure layer - network transport

pub mod ws;

pub use ws::{
    ClientEvents, ClientOptions, ClientTimeouts, ConnectionInfo, ServerEvents, ServerOptions,
    ServerTimeouts, WsChannel, WsClient, WsServer,
};
