//! Peer exchange (BEP-11) over the extension protocol.
//!
//! Each connection tracks which swarm addresses it has already told the
//! remote about; the periodic share step sends only the delta. Incoming
//! PEX messages feed the swarm's reserve of dialable peers.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::constants::PEX_MAX_ADDED;
use crate::peer::{Message, PeerError};
use crate::torrent::{PeerInfo, PeerKey, PeerSource, TorrentState};

/// How often a connection shares its PEX delta.
pub const SHARE_INTERVAL: Duration = Duration::from_secs(60);

/// The remote prefers encrypted connections.
pub const FLAG_PREFERS_ENCRYPTION: u8 = 0x01;
/// The remote is a seed or upload-only.
pub const FLAG_SEED_UPLOAD_ONLY: u8 = 0x02;
/// The remote supports uTP.
pub const FLAG_SUPPORTS_UTP: u8 = 0x04;
/// The remote supports holepunching.
pub const FLAG_SUPPORTS_HOLEPUNCH: u8 = 0x08;
/// The address was learned from an outgoing connection, so its port is
/// known dialable.
pub const FLAG_OUTGOING: u8 = 0x10;

fn buf_is_empty(b: &ByteBuf) -> bool {
    b.is_empty()
}

/// The bencoded `ut_pex` payload. Addresses are in compact form, 6
/// bytes per IPv4 peer and 18 per IPv6 peer.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PexMessage {
    #[serde(default, skip_serializing_if = "buf_is_empty")]
    pub added: ByteBuf,
    #[serde(rename = "added.f", default, skip_serializing_if = "buf_is_empty")]
    pub added_f: ByteBuf,
    #[serde(default, skip_serializing_if = "buf_is_empty")]
    pub added6: ByteBuf,
    #[serde(rename = "added6.f", default, skip_serializing_if = "buf_is_empty")]
    pub added6_f: ByteBuf,
    #[serde(default, skip_serializing_if = "buf_is_empty")]
    pub dropped: ByteBuf,
    #[serde(default, skip_serializing_if = "buf_is_empty")]
    pub dropped6: ByteBuf,
}

impl PexMessage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    pub fn encode(&self) -> Result<bytes::Bytes, PeerError> {
        serde_bencode::to_bytes(self)
            .map(bytes::Bytes::from)
            .map_err(|e| PeerError::Extension(format!("encoding ut_pex: {e}")))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        serde_bencode::from_bytes(data)
            .map_err(|e| PeerError::Extension(format!("decoding ut_pex: {e}")))
    }

    /// All addresses in the added lists, IPv4 then IPv6.
    pub fn added_addrs(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        for chunk in self.added.chunks_exact(6) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            out.push(SocketAddr::new(IpAddr::V4(ip), port));
        }
        for chunk in self.added6.chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            out.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
        }
        out
    }

    fn push_added(&mut self, addr: SocketAddr, flags: u8) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.added.extend_from_slice(&ip.octets());
                self.added.extend_from_slice(&addr.port().to_be_bytes());
                self.added_f.push(flags);
            }
            IpAddr::V6(ip) => {
                self.added6.extend_from_slice(&ip.octets());
                self.added6.extend_from_slice(&addr.port().to_be_bytes());
                self.added6_f.push(flags);
            }
        }
    }

    fn push_dropped(&mut self, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.dropped.extend_from_slice(&ip.octets());
                self.dropped.extend_from_slice(&addr.port().to_be_bytes());
            }
            IpAddr::V6(ip) => {
                self.dropped6.extend_from_slice(&ip.octets());
                self.dropped6.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
    }
}

/// Applies an incoming `ut_pex` message from `key`, feeding new
/// addresses into the dial reserve.
pub fn handle_pex_message(
    state: &mut TorrentState,
    key: PeerKey,
    payload: &[u8],
) -> Result<(), PeerError> {
    let msg = PexMessage::decode(payload)?;
    let mut accepted = 0usize;
    for addr in msg.added_addrs().into_iter().take(PEX_MAX_ADDED) {
        if addr.port() == 0 || state.is_banned(&addr.ip()) {
            continue;
        }
        if !state.swarm.known.insert(addr) {
            continue;
        }
        state.swarm.reserve.push(PeerInfo {
            addr,
            id: None,
            source: PeerSource::Pex,
            trusted: false,
        });
        accepted += 1;
    }
    if accepted > 0 {
        trace!(%key, accepted, "learned peers via pex");
        state.swarm.dial_wakeup.notify_one();
    }
    // Dropped addresses are informational only; we make our own
    // decisions about who to keep.
    Ok(())
}

/// Addresses this torrent currently considers shareable: remote ends of
/// outgoing wire connections, whose ports are known dialable.
fn shareable_addrs(state: &TorrentState) -> HashSet<SocketAddr> {
    state
        .peers
        .values()
        .filter_map(|p| p.as_wire())
        .filter(|s| s.core.outgoing && !s.core.closed)
        .map(|s| s.core.remote_addr)
        .collect()
}

/// Sends the PEX delta to `key` if the remote negotiated `ut_pex`.
/// Called periodically from the connection's watchdog task.
pub fn share_step(state: &mut TorrentState, key: PeerKey) {
    let current = shareable_addrs(state);
    let Some(session) = state.peers.get_mut(&key).and_then(|p| p.as_wire_mut()) else {
        return;
    };
    let Some(pex_id) = session.core.pex_id else {
        return;
    };
    let own_addr = session.core.remote_addr;

    let mut msg = PexMessage::default();
    let mut announced = 0usize;
    for addr in &current {
        if *addr == own_addr || session.pex_sent.contains(addr) {
            continue;
        }
        if announced >= PEX_MAX_ADDED {
            break;
        }
        msg.push_added(*addr, FLAG_OUTGOING);
        session.pex_sent.insert(*addr);
        announced += 1;
    }
    let gone: Vec<SocketAddr> = session
        .pex_sent
        .iter()
        .filter(|a| !current.contains(a))
        .copied()
        .collect();
    for addr in gone {
        session.pex_sent.remove(&addr);
        msg.push_dropped(addr);
    }

    if msg.is_empty() {
        return;
    }
    match msg.encode() {
        Ok(payload) => {
            session.writer.write(&Message::Extended {
                id: pex_id,
                payload,
            });
        }
        Err(err) => debug!(%key, %err, "failed to encode pex delta"),
    }
}
