//! WebSocket subprotocol negotiation
//!
//! During the handshake the station advertises the OCPP subprotocols it
//! speaks in `Sec-WebSocket-Protocol`. The server walks that list in the
//! station's order and selects the first entry it supports.

use tracing::debug;

use crate::domain::OcppVersion;

/// Outcome of negotiating one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Echo this subprotocol back to the client.
    Selected(String),
    /// Neither side asked for a subprotocol.
    NoneRequested,
    /// Upgrade, then close with a protocol error.
    Rejected { offered: Vec<String> },
}

/// Picks a subprotocol from the client's offer.
#[derive(Debug, Clone)]
pub struct ProtocolNegotiator {
    /// Subprotocols the server accepts. Empty accepts whatever the client
    /// offers first.
    supported: Vec<String>,
}

impl ProtocolNegotiator {
    pub fn new(supported: Vec<String>) -> Self {
        Self { supported }
    }

    /// Accept every subprotocol name of `version`.
    pub fn for_version(version: OcppVersion) -> Self {
        Self::new(version.subprotocols().iter().map(|s| s.to_string()).collect())
    }

    /// Negotiate from the raw `Sec-WebSocket-Protocol` header value.
    pub fn negotiate(&self, requested_protocols: &str) -> Negotiation {
        let offered: Vec<String> = requested_protocols
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if self.supported.is_empty() {
            return match offered.into_iter().next() {
                Some(first) => Negotiation::Selected(first),
                None => Negotiation::NoneRequested,
            };
        }

        match offered.iter().find(|p| self.supported.contains(p)) {
            Some(selected) => Negotiation::Selected(selected.clone()),
            None => {
                debug!(?offered, supported = ?self.supported, "No common subprotocol");
                Negotiation::Rejected { offered }
            }
        }
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_single_match() {
        let negotiator = ProtocolNegotiator::for_version(OcppVersion::V16);
        assert_eq!(
            negotiator.negotiate("ocpp1.6"),
            Negotiation::Selected("ocpp1.6".into())
        );
    }

    #[test]
    fn client_order_wins() {
        let negotiator = ProtocolNegotiator::new(vec!["ocpp2.0.1".into(), "ocpp2.0".into()]);
        assert_eq!(
            negotiator.negotiate("ocpp1.6, ocpp2.0, ocpp2.0.1"),
            Negotiation::Selected("ocpp2.0".into())
        );
    }

    #[test]
    fn negotiate_no_match() {
        let negotiator = ProtocolNegotiator::for_version(OcppVersion::V16);
        assert_eq!(
            negotiator.negotiate("ocpp2.0.1"),
            Negotiation::Rejected {
                offered: vec!["ocpp2.0.1".into()]
            }
        );
    }

    #[test]
    fn negotiate_empty_header() {
        let negotiator = ProtocolNegotiator::for_version(OcppVersion::V16);
        assert!(matches!(negotiator.negotiate(""), Negotiation::Rejected { .. }));
    }

    #[test]
    fn empty_supported_list_accepts_first_offer() {
        let negotiator = ProtocolNegotiator::new(Vec::new());
        assert_eq!(
            negotiator.negotiate("foo, ocpp1.6"),
            Negotiation::Selected("foo".into())
        );
        assert_eq!(negotiator.negotiate(""), Negotiation::NoneRequested);
    }
}
