use std::collections::HashSet;
use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::constants::ALLOWED_FAST_SET_SIZE;

/// Per-peer state for the Fast Extension (BEP-6).
#[derive(Debug, Clone, Default)]
pub struct FastState {
    /// Pieces the remote peer lets us request while it is choking us.
    pub allowed_fast_incoming: HashSet<u32>,
    /// Pieces we let the remote peer request while we choke it.
    pub allowed_fast_outgoing: HashSet<u32>,
    /// Pieces the remote peer suggested we download.
    pub suggested: Vec<u32>,
}

impl FastState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the scheduler may request `piece` despite a remote choke.
    pub fn can_request_while_choked(&self, piece: u32) -> bool {
        self.allowed_fast_incoming.contains(&piece)
    }

    /// True if we should serve `piece` to this peer despite choking it.
    pub fn should_serve_while_choking(&self, piece: u32) -> bool {
        self.allowed_fast_outgoing.contains(&piece)
    }

    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push(piece);
        }
    }
}

/// Generates the deterministic allowed-fast set for a peer (BEP-6).
///
/// SHA-1 is iterated over the peer's masked IP concatenated with the
/// info hash, taking 4-byte words modulo the piece count until the set
/// is full. Both sides compute the same set for a given peer address.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces as usize);

    // IPv4 is masked to /24; IPv6 uses its leading 4 bytes.
    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    let mut allowed = Vec::with_capacity(set_size);
    while allowed.len() < set_size {
        let hash = Sha1::digest(&x);
        for word in hash.chunks_exact(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes(word.try_into().unwrap()) % num_pieces;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }
        x = hash.to_vec();
    }
    allowed
}

/// Convenience wrapper using the default set size.
pub fn default_allowed_fast_set(info_hash: &[u8; 20], peer_ip: IpAddr, num_pieces: u32) -> Vec<u32> {
    generate_allowed_fast_set(info_hash, peer_ip, num_pieces, ALLOWED_FAST_SET_SIZE)
}
