use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Config;
use crate::peer::bitfield::Bitfield;
use crate::peer::fast::FastState;
use crate::peer::message::BlockRef;
use crate::peer::peer_id::PeerId;
use crate::scheduler::RequestIndex;
use crate::torrent::{PeerKey, PeerSource};

/// State shared by every peer variant, regardless of transport.
///
/// Lives under the torrent lock; all mutation happens there. Anything
/// that touches a socket goes through the owning backend instead.
pub struct PeerCore {
    pub key: PeerKey,
    pub remote_addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub outgoing: bool,
    pub trusted: bool,
    pub source: PeerSource,

    /// We are choking the remote.
    pub choking: bool,
    /// We are interested in the remote's data.
    pub interested: bool,
    /// The remote is choking us.
    pub peer_choking: bool,
    /// The remote is interested in our data.
    pub peer_interested: bool,

    /// Pieces the remote claims to have.
    pub claimed: Bitfield,
    /// Set by HaveAll; short-circuits the bitfield.
    pub has_all: bool,
    pub fast: FastState,
    pub fast_enabled: bool,
    pub extension_enabled: bool,
    /// The remote's message id for ut_pex, from its extension handshake.
    pub pex_id: Option<u8>,

    /// Requests outstanding to this peer.
    pub requests: HashSet<RequestIndex>,
    /// Cancelled requests awaiting a Reject or Piece acknowledgement.
    pub cancelled: HashSet<RequestIndex>,
    /// Multiset of chunks this peer may legitimately still send us.
    /// Incremented per request, decremented per received chunk, never
    /// cleared by cancellation.
    pub valid_receive_chunks: HashMap<RequestIndex, usize>,
    /// High-water mark of concurrently outstanding requests; the
    /// scheduler's window grows toward twice this.
    pub peak_requests: usize,
    /// The remote's advertised (or assumed) request queue depth.
    pub peer_max_requests: usize,

    /// BEP-40 canonical priority of this connection's address pair,
    /// used as an eviction tiebreak.
    pub bep40_priority: u32,

    pub completed_handshake_at: Option<Instant>,
    /// When this peer last delivered a chunk we counted as valid.
    pub last_useful_chunk_at: Option<Instant>,

    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    /// Pieces this peer contributed to that verified.
    pub pieces_dirtied_good: u64,
    /// Pieces this peer contributed to that failed verification.
    pub pieces_dirtied_bad: u64,

    pub closed: bool,
}

impl PeerCore {
    pub fn new(
        key: PeerKey,
        remote_addr: SocketAddr,
        source: PeerSource,
        outgoing: bool,
        piece_count: u32,
        config: &Config,
    ) -> Self {
        Self {
            key,
            remote_addr,
            peer_id: None,
            outgoing,
            trusted: false,
            source,
            choking: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            claimed: Bitfield::new(piece_count as usize),
            has_all: false,
            fast: FastState::new(),
            fast_enabled: false,
            extension_enabled: false,
            pex_id: None,
            requests: HashSet::new(),
            cancelled: HashSet::new(),
            valid_receive_chunks: HashMap::new(),
            peak_requests: 0,
            peer_max_requests: config.peer_max_requests,
            bep40_priority: 0,
            completed_handshake_at: None,
            last_useful_chunk_at: None,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            pieces_dirtied_good: 0,
            pieces_dirtied_bad: 0,
            closed: false,
        }
    }

    pub fn claims_piece(&self, piece: u32) -> bool {
        self.has_all || self.claimed.has(piece as usize)
    }

    pub fn claimed_count(&self, piece_count: u32) -> u32 {
        if self.has_all {
            piece_count
        } else {
            self.claimed.count() as u32
        }
    }
}

/// Transport-specific behavior behind a peer: the wire protocol over
/// TCP, or HTTP range requests against a webseed.
///
/// Methods are synchronous and non-blocking; they queue work for the
/// backend's I/O task rather than performing it.
pub trait PeerBackend: Send + Sync {
    fn core(&self) -> &PeerCore;
    fn core_mut(&mut self) -> &mut PeerCore;

    /// Queues a block request toward the remote.
    fn issue_request(&mut self, block: BlockRef);

    /// Queues a cancellation. Returns whether the remote is expected to
    /// acknowledge it (with Reject or the data itself), which keeps the
    /// request in the cancelled set until then.
    fn cancel_request(&mut self, block: BlockRef) -> bool;

    /// Declares or withdraws interest. Backends without a notion of
    /// interest just record it.
    fn declare_interest(&mut self, interested: bool);

    /// How many more requests the backend's outbound path can absorb
    /// right now.
    fn writable_request_budget(&self) -> usize;

    /// Tears down backend resources. The core's bookkeeping is cleaned
    /// up separately by the swarm.
    fn on_close(&mut self);
}
