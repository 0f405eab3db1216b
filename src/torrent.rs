//! Torrent aggregate state.
//!
//! One torrent owns its pieces, its live peers, the pending-request
//! table and the candidate reserve. All of it sits behind a single
//! coarse read/write lock; socket I/O and storage calls always happen
//! with the lock released.
//!
//! Some transitions (piece completion, peer churn) must notify observers
//! without holding the lock, so mutations queue deferred actions that
//! [`Shared::with_write`] runs on the unlocking thread immediately after
//! the guard drops, before any other writer can enter.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::events::{Hooks, Metrics};
use crate::peer::{Bitfield, BlockRef, PeerId, PeerSession};
use crate::piece::Piece;
use crate::scheduler::{PendingRequests, RequestIndex};
use crate::storage::TorrentStorage;
use crate::swarm::SwarmState;
use crate::webseed::WebseedPeer;

/// Stable identity of one connection within a torrent. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Where a candidate peer was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Incoming,
    User,
}

/// An immutable candidate record, held in the reserve until promoted to
/// a live connection or evicted.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
    pub source: PeerSource,
    pub trusted: bool,
}

/// Fixed geometry of a torrent: pieces, chunks and their lengths.
#[derive(Debug, Clone, Copy)]
pub struct TorrentLayout {
    pub piece_count: u32,
    pub piece_length: u32,
    pub last_piece_length: u32,
    pub chunk_size: u32,
}

impl TorrentLayout {
    pub fn piece_len(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Chunks in a regular (non-final) piece; the stride of the flat
    /// request-index space.
    pub fn chunks_per_piece(&self) -> u32 {
        self.piece_length.div_ceil(self.chunk_size)
    }

    pub fn chunk_count(&self, piece: u32) -> u32 {
        self.piece_len(piece).div_ceil(self.chunk_size)
    }

    pub fn chunk_len(&self, piece: u32, chunk: u32) -> u32 {
        let start = chunk * self.chunk_size;
        (self.piece_len(piece) - start).min(self.chunk_size)
    }

    pub fn request_index(&self, piece: u32, chunk: u32) -> RequestIndex {
        piece * self.chunks_per_piece() + chunk
    }

    pub fn piece_of(&self, r: RequestIndex) -> u32 {
        r / self.chunks_per_piece()
    }

    pub fn chunk_of(&self, r: RequestIndex) -> u32 {
        r % self.chunks_per_piece()
    }

    /// The wire-level block for a request index.
    pub fn block_ref(&self, r: RequestIndex) -> BlockRef {
        let piece = self.piece_of(r);
        let chunk = self.chunk_of(r);
        BlockRef {
            piece,
            offset: chunk * self.chunk_size,
            length: self.chunk_len(piece, chunk),
        }
    }

    /// Maps a wire block back to a request index, requiring exact
    /// chunk alignment and length.
    pub fn request_index_of(&self, b: &BlockRef) -> Option<RequestIndex> {
        if b.piece >= self.piece_count || b.offset % self.chunk_size != 0 {
            return None;
        }
        let chunk = b.offset / self.chunk_size;
        if chunk >= self.chunk_count(b.piece) || b.length != self.chunk_len(b.piece, chunk) {
            return None;
        }
        Some(self.request_index(b.piece, chunk))
    }

    /// True if the byte range lies within the piece, regardless of chunk
    /// alignment. Incoming peer requests are validated with this.
    pub fn range_in_piece(&self, b: &BlockRef) -> bool {
        b.piece < self.piece_count
            && b.length > 0
            && (b.offset as u64 + b.length as u64) <= self.piece_len(b.piece) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        if self.piece_count == 0 {
            return 0;
        }
        (self.piece_count as u64 - 1) * self.piece_length as u64 + self.last_piece_length as u64
    }
}

/// A live peer: the wire-protocol variant or the HTTP webseed variant.
pub enum Peer {
    Wire(PeerSession),
    Webseed(WebseedPeer),
}

impl Peer {
    pub fn backend(&self) -> &dyn crate::peer::PeerBackend {
        match self {
            Peer::Wire(s) => s,
            Peer::Webseed(w) => w,
        }
    }

    pub fn backend_mut(&mut self) -> &mut dyn crate::peer::PeerBackend {
        match self {
            Peer::Wire(s) => s,
            Peer::Webseed(w) => w,
        }
    }

    pub fn as_wire(&self) -> Option<&PeerSession> {
        match self {
            Peer::Wire(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_wire_mut(&mut self) -> Option<&mut PeerSession> {
        match self {
            Peer::Wire(s) => Some(s),
            _ => None,
        }
    }
}

type Deferred = Box<dyn FnOnce() + Send + Sync>;

/// Everything one torrent knows, guarded by one coarse lock.
pub struct TorrentState {
    pub info_hash: [u8; 20],
    pub local_peer_id: PeerId,
    pub layout: TorrentLayout,
    pub config: Arc<Config>,
    pub hooks: Arc<Hooks>,
    pub metrics: Arc<Metrics>,
    pub storage: Arc<dyn TorrentStorage>,

    pub pieces: Vec<Piece>,
    /// Verified pieces, mirrored from per-piece completion caches.
    pub completed: Bitfield,
    /// How many connected peers claim each piece.
    pub availability: Vec<u32>,
    /// Pieces waiting for a hashing slot, FIFO.
    pub hash_queue: Vec<u32>,
    /// Pieces hashing right now; capped by config.
    pub active_piece_hashes: usize,

    pub pending: PendingRequests,
    pub peers: HashMap<PeerKey, Peer>,
    pub swarm: SwarmState,

    /// Set on chunk-write failure; cleared by operator intervention.
    pub download_disabled: bool,
    pub closed: bool,
    /// Woken whenever a piece joins the hash queue.
    pub hash_wakeup: Arc<tokio::sync::Notify>,

    next_peer_key: u64,
    deferred: Vec<Deferred>,
}

impl TorrentState {
    pub fn new(
        info_hash: [u8; 20],
        layout: TorrentLayout,
        piece_hashes: Vec<[u8; 20]>,
        config: Arc<Config>,
        storage: Arc<dyn TorrentStorage>,
        hooks: Arc<Hooks>,
        metrics: Arc<Metrics>,
    ) -> Self {
        assert_eq!(piece_hashes.len(), layout.piece_count as usize);
        let pieces = piece_hashes
            .into_iter()
            .enumerate()
            .map(|(i, hash)| Piece::new(layout.chunk_count(i as u32), hash))
            .collect();
        Self {
            info_hash,
            local_peer_id: PeerId::generate(),
            layout,
            config,
            hooks,
            metrics,
            storage,
            pieces,
            completed: Bitfield::new(layout.piece_count as usize),
            availability: vec![0; layout.piece_count as usize],
            hash_queue: Vec::new(),
            active_piece_hashes: 0,
            pending: PendingRequests::new(),
            peers: HashMap::new(),
            swarm: SwarmState::default(),
            download_disabled: false,
            closed: false,
            hash_wakeup: Arc::new(tokio::sync::Notify::new()),
            next_peer_key: 0,
            deferred: Vec::new(),
        }
    }

    pub fn alloc_peer_key(&mut self) -> PeerKey {
        self.next_peer_key += 1;
        PeerKey(self.next_peer_key)
    }

    /// Queues an action to run after the write lock releases.
    pub fn defer(&mut self, f: impl FnOnce() + Send + Sync + 'static) {
        self.deferred.push(Box::new(f));
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    pub fn availability_inc(&mut self, piece: u32) {
        self.availability[piece as usize] += 1;
    }

    pub fn availability_dec(&mut self, piece: u32) {
        let slot = &mut self.availability[piece as usize];
        debug_assert!(*slot > 0, "availability underflow for piece {piece}");
        *slot = slot.saturating_sub(1);
    }

    /// True if we still want data for this piece.
    pub fn wants_piece(&self, piece: u32) -> bool {
        !self.download_disabled
            && !self.completed.has(piece as usize)
            && self.pieces[piece as usize].priority.wanted()
            && !self.pieces[piece as usize].hashing
            && !self.pieces[piece as usize].queued_for_hash
    }

    /// Bytes not yet dirtied or verified for one piece; zero once the
    /// piece completes.
    pub fn piece_bytes_left(&self, piece: u32) -> u64 {
        if self.completed.has(piece as usize) {
            return 0;
        }
        let p = &self.pieces[piece as usize];
        (0..self.layout.chunk_count(piece))
            .filter(|&c| !p.dirty.has(c as usize))
            .map(|c| self.layout.chunk_len(piece, c) as u64)
            .sum()
    }

    pub fn bytes_left(&self) -> u64 {
        (0..self.layout.piece_count)
            .map(|i| self.piece_bytes_left(i))
            .sum()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.swarm.banned_ips.contains(ip)
    }
}

/// Shared handle to a torrent's state.
///
/// `with_write` drains the deferred-action queue after the guard drops,
/// on the unlocking thread, so observers never run under the lock.
/// Writers additionally serialize on an ordering mutex held across the
/// drain, so a queued batch of observers always finishes before the
/// next writer mutates anything. Observers may take the read lock but
/// must never call `with_write`.
#[derive(Clone)]
pub struct Shared {
    inner: Arc<RwLock<TorrentState>>,
    write_order: Arc<Mutex<()>>,
}

impl Shared {
    pub fn new(state: TorrentState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
            write_order: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_read<R>(&self, f: impl FnOnce(&TorrentState) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn with_write<R>(&self, f: impl FnOnce(&mut TorrentState) -> R) -> R {
        let order = self.write_order.lock();
        let (ret, deferred) = {
            let mut guard = self.inner.write();
            let ret = f(&mut guard);
            let deferred = guard.take_deferred();
            (ret, deferred)
        };
        for action in deferred {
            action();
        }
        drop(order);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn layout() -> TorrentLayout {
        TorrentLayout {
            piece_count: 4,
            piece_length: 64 * 1024,
            last_piece_length: 24 * 1024,
            chunk_size: 16 * 1024,
        }
    }

    #[test]
    fn request_index_round_trip() {
        let l = layout();
        assert_eq!(l.chunks_per_piece(), 4);
        for piece in 0..l.piece_count {
            for chunk in 0..l.chunk_count(piece) {
                let r = l.request_index(piece, chunk);
                assert_eq!(l.piece_of(r), piece);
                assert_eq!(l.chunk_of(r), chunk);
                let b = l.block_ref(r);
                assert_eq!(l.request_index_of(&b), Some(r));
            }
        }
    }

    #[test]
    fn last_piece_has_short_tail() {
        let l = layout();
        assert_eq!(l.chunk_count(3), 2);
        assert_eq!(l.chunk_len(3, 0), 16 * 1024);
        assert_eq!(l.chunk_len(3, 1), 8 * 1024);
        assert_eq!(l.total_bytes(), 3 * 64 * 1024 + 24 * 1024);
    }

    fn small_state() -> TorrentState {
        let l = layout();
        TorrentState::new(
            [1u8; 20],
            l,
            vec![[0u8; 20]; l.piece_count as usize],
            Arc::new(crate::config::Config::default()),
            Arc::new(MemoryStorage::new(
                l.piece_count,
                l.piece_length,
                l.last_piece_length,
            )),
            Arc::new(crate::events::Hooks::default()),
            Arc::new(crate::events::Metrics::default()),
        )
    }

    #[test]
    fn deferred_actions_finish_before_the_next_writer() {
        let shared = Shared::new(small_state());
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let first = {
            let shared = shared.clone();
            let log = log.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                shared.with_write(|s| {
                    barrier.wait();
                    let log = log.clone();
                    s.defer(move || {
                        // Let the competing writer pile up on the lock.
                        std::thread::sleep(Duration::from_millis(50));
                        log.lock().push("deferred");
                    });
                });
            })
        };
        barrier.wait();
        shared.with_write(|_| log.lock().push("second writer"));
        first.join().unwrap();

        assert_eq!(&*log.lock(), &["deferred", "second writer"]);
    }

    #[test]
    fn shared_handle_moves_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Shared>();
        assert_send_sync::<TorrentState>();
    }

    #[test]
    fn misaligned_block_is_not_a_request_index() {
        let l = layout();
        let b = BlockRef::new(0, 100, 16 * 1024);
        assert_eq!(l.request_index_of(&b), None);
        assert!(l.range_in_piece(&b));
        let too_long = BlockRef::new(3, 16 * 1024, 16 * 1024);
        assert!(!l.range_in_piece(&too_long));
    }
}
