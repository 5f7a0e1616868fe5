//! Interfaces layer - the two endpoint facades
//!
//! - [`CentralSystem`]: accepts stations over [`WsServer`]
//! - [`ChargingStation`]: dials a central system over [`WsClient`]
//!
//! Both sit on the same [`endpoint::Endpoint`] core: inbound routing,
//! outbound dispatch and the error stream.

pub mod central_system;
pub mod charging_station;
pub(crate) mod endpoint;
pub mod inbound;

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::OutboundTransport;
use crate::domain::{EndpointError, TransportError};
use crate::infrastructure::{WsClient, WsServer};

pub use central_system::{CentralSystem, CentralSystemBuilder};
pub use charging_station::{ChargingStation, ChargingStationBuilder};
pub use inbound::InboundRouter;

// ── Error stream ───────────────────────────────────────────────

/// Buffer of the error stream. A consumer that falls behind loses errors
/// rather than stalling the read loops.
pub const ERROR_BUFFER: usize = 1;

pub(crate) struct ErrorSink {
    sender: Mutex<Option<mpsc::Sender<EndpointError>>>,
    receiver: Mutex<Option<mpsc::Receiver<EndpointError>>>,
}

impl ErrorSink {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(ERROR_BUFFER);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn push(&self, error: EndpointError) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        if let Some(tx) = sender.as_ref() {
            if let Err(e) = tx.try_send(error) {
                debug!("Error stream full or closed, dropping: {}", e.into_inner());
            }
        }
    }

    /// The receiving half. Only the first caller gets it.
    pub(crate) fn take(&self) -> Option<mpsc::Receiver<EndpointError>> {
        self.receiver.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Close the stream; a consumer sees `None` once the buffer drains.
    pub(crate) fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

// ── Transports ─────────────────────────────────────────────────

#[async_trait]
impl OutboundTransport for WsServer {
    async fn send_text(&self, peer: &str, text: String) -> Result<(), TransportError> {
        WsServer::send_text(self, peer, text).await
    }
}

/// A client has exactly one peer, so the id is ignored.
#[async_trait]
impl OutboundTransport for WsClient {
    async fn send_text(&self, _peer: &str, text: String) -> Result<(), TransportError> {
        self.write(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_sink_drops_when_full() {
        let sink = ErrorSink::new();
        sink.push(EndpointError::NotConnected("CS001".into()));
        sink.push(EndpointError::NotConnected("CS002".into()));

        let mut rx = sink.take().unwrap();
        assert!(sink.take().is_none());
        assert_eq!(rx.recv().await, Some(EndpointError::NotConnected("CS001".into())));

        sink.close();
        assert_eq!(rx.recv().await, None);
    }
}
