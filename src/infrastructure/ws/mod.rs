//! WebSocket transport
//!
//! - [`channel`]: one connection, its reader and writer tasks
//! - [`server`]: accepts station connections, negotiates and registers them
//! - [`client`]: dials a central system and reconnects on failure
//! - [`negotiator`]: subprotocol selection
//! - [`tls`]: rustls configuration from PEM files

pub mod channel;
pub mod client;
pub mod negotiator;
pub mod server;
pub mod tls;

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::domain::TransportError;
use crate::support::backoff::BackoffConfig;

pub use channel::{ChannelConfig, ConnectionInfo, WsChannel};
pub use client::{ClientEvents, ClientOptions, WsClient};
pub use negotiator::{Negotiation, ProtocolNegotiator};
pub use server::{BasicAuthHandler, ServerEvents, ServerOptions, WsServer};

/// Default bound of a channel's outbound queue.
pub const DEFAULT_OUT_QUEUE_CAPACITY: usize = 1;

// ── Timeouts ───────────────────────────────────────────────────

/// Client-side link timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub write_wait: Duration,
    pub handshake_timeout: Duration,
    /// Read deadline, refreshed by every inbound frame.
    pub pong_wait: Duration,
    /// Interval between client pings; should be below `pong_wait`.
    pub ping_period: Duration,
    pub reconnect_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            reconnect_backoff: Duration::from_secs(5),
            reconnect_max_backoff: Duration::from_secs(120),
        }
    }
}

impl ClientTimeouts {
    pub fn with_write_wait(mut self, d: Duration) -> Self {
        self.write_wait = d;
        self
    }

    pub fn with_handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    pub fn with_pong_wait(mut self, d: Duration) -> Self {
        self.pong_wait = d;
        self
    }

    pub fn with_ping_period(mut self, d: Duration) -> Self {
        self.ping_period = d;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = initial;
        self.reconnect_max_backoff = max;
        self
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_backoff,
            max_delay: self.reconnect_max_backoff,
            ..BackoffConfig::default()
        }
    }
}

/// Server-side link timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTimeouts {
    pub write_wait: Duration,
    /// Read deadline; the station's pings keep it from expiring.
    pub ping_wait: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            ping_wait: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerTimeouts {
    pub fn with_write_wait(mut self, d: Duration) -> Self {
        self.write_wait = d;
        self
    }

    pub fn with_ping_wait(mut self, d: Duration) -> Self {
        self.ping_wait = d;
        self
    }

    pub fn with_handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }
}

// ── Error mapping ──────────────────────────────────────────────

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        use tungstenite::error::ProtocolError;
        use tungstenite::Error;

        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => Self::NotConnected,
            Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Self::ConnectionReset,
            Error::Io(io) => Self::Io(io.to_string()),
            Error::Url(url) => Self::InvalidUrl(url.to_string()),
            Error::Http(resp) => Self::Handshake(format!("HTTP {}", resp.status())),
            Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(sub)) => {
                Self::Subprotocol(sub.to_string())
            }
            other => Self::WebSocket(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals() {
        let client = ClientTimeouts::default();
        assert_eq!(client.write_wait, Duration::from_secs(10));
        assert_eq!(client.ping_period, Duration::from_secs(54));
        assert_eq!(client.handshake_timeout, Duration::from_secs(30));
        assert_eq!(ServerTimeouts::default().ping_wait, Duration::from_secs(60));
    }

    #[test]
    fn reset_maps_to_connection_reset() {
        let err = tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        );
        assert_eq!(TransportError::from(err), TransportError::ConnectionReset);
    }
}
