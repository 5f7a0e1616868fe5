//! OCPP protocol version
//!
//! Both supported versions share the OCPP-J framing; they differ in the
//! message catalog, in the WebSocket subprotocol names and in a couple of
//! error-code spellings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6")]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1", alias = "2.0")]
    V201,
}

impl OcppVersion {
    /// Preferred WebSocket subprotocol identifier for this version.
    pub fn subprotocol(&self) -> &'static str {
        self.subprotocols()[0]
    }

    /// Every subprotocol name a peer may use for this version, preferred first.
    ///
    /// Early 2.0 deployments advertise `ocpp2.0`; the framing is identical so
    /// the 2.0.1 catalog serves both.
    pub fn subprotocols(&self) -> &'static [&'static str] {
        match self {
            Self::V16 => &["ocpp1.6"],
            Self::V201 => &["ocpp2.0.1", "ocpp2.0"],
        }
    }

    /// Parse an OCPP version from a WebSocket subprotocol string.
    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0.1" | "ocpp2.0" => Some(Self::V201),
            _ => None,
        }
    }

    /// All supported OCPP versions, ordered from newest to oldest.
    pub const ALL: &'static [OcppVersion] = &[Self::V201, Self::V16];

    /// Human-readable version string.
    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_names() {
        assert_eq!(OcppVersion::V16.subprotocol(), "ocpp1.6");
        assert_eq!(OcppVersion::V201.subprotocol(), "ocpp2.0.1");
        assert_eq!(OcppVersion::V201.subprotocols(), &["ocpp2.0.1", "ocpp2.0"]);
    }

    #[test]
    fn legacy_two_zero_maps_to_201() {
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.0"), Some(OcppVersion::V201));
        assert_eq!(OcppVersion::from_subprotocol(" ocpp1.6 "), Some(OcppVersion::V16));
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.1"), None);
    }
}
