use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::PeerError;
use super::peer_id::PeerId;
use crate::constants::{CLIENT_VERSION, UT_PEX_ID};

/// Message ID of the extension handshake itself (BEP-10).
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The BEP-10 extension handshake dictionary.
///
/// Negotiates per-extension numeric ids (`m`), and optionally carries the
/// advertised request-queue depth (`reqq`), listen port (`p`), client
/// version (`v`) and the address the peer sees us at (`yourip`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionHandshake {
    #[serde(default)]
    pub m: BTreeMap<String, u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub yourip: Option<Vec<u8>>,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handshake we advertise: ut_pex plus our version and port.
    pub fn ours(listen_port: Option<u16>) -> Self {
        let mut hs = Self::new();
        hs.m.insert("ut_pex".to_string(), UT_PEX_ID);
        hs.v = Some(CLIENT_VERSION.to_string());
        hs.p = listen_port;
        hs
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        serde_bencode::to_bytes(self)
            .map(Bytes::from)
            .map_err(|e| PeerError::Extension(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        serde_bencode::from_bytes(data).map_err(|e| PeerError::Extension(e.to_string()))
    }

    /// The numeric id the peer assigned to `name`, if advertised.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied().filter(|&id| id != 0)
    }
}

/// Azureus-style prefixes of legacy clients known to address Extended
/// messages with our outgoing extension ids instead of the ids they
/// advertised. Their malformed messages are tolerated; the same traffic
/// from any other client is a protocol violation. This is a targeted
/// exception, not a general leniency policy.
const QUIRKY_EXTENSION_CLIENTS: &[&[u8]] = &[b"-SD", b"-XL"];

/// True if `peer_id` identifies a client whose misuse of extension ids
/// we tolerate.
pub fn tolerates_extension_id_misuse(peer_id: &PeerId) -> bool {
    peer_id.has_prefix(QUIRKY_EXTENSION_CLIENTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let mut hs = ExtensionHandshake::ours(Some(6881));
        hs.reqq = Some(500);
        let encoded = hs.encode().unwrap();
        let decoded = ExtensionHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.extension_id("ut_pex"), Some(UT_PEX_ID));
        assert_eq!(decoded.v.as_deref(), Some(CLIENT_VERSION));
        assert_eq!(decoded.p, Some(6881));
        assert_eq!(decoded.reqq, Some(500));
    }

    #[test]
    fn zero_extension_id_means_disabled() {
        let mut hs = ExtensionHandshake::new();
        hs.m.insert("ut_pex".to_string(), 0);
        assert_eq!(hs.extension_id("ut_pex"), None);
    }

    #[test]
    fn quirk_allowlist_is_narrow() {
        let quirky = PeerId::from_bytes(b"-SD0100-aaaaaaaaaaaa").unwrap();
        let normal = PeerId::from_bytes(b"-TR4050-aaaaaaaaaaaa").unwrap();
        assert!(tolerates_extension_id_misuse(&quirky));
        assert!(!tolerates_extension_id_misuse(&normal));
    }
}
