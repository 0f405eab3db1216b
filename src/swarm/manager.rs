use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{Hooks, Metrics, PeerEvent};
use crate::peer::{PeerCore, PeerSession};
use crate::piece;
use crate::scheduler::{self, UpdateReason};
use crate::storage::TorrentStorage;
use crate::swarm::{dial, priority};
use crate::torrent::{Peer, PeerInfo, PeerKey, PeerSource, Shared, TorrentLayout, TorrentState};
use crate::webseed::{self, WebseedPeer};

/// Swarm-wide connection bookkeeping, part of the torrent state.
pub struct SwarmState {
    /// Known, dialable, not-yet-connected peers.
    pub reserve: Vec<PeerInfo>,
    /// Every address we currently know about, connected or not.
    pub known: HashSet<SocketAddr>,
    /// IPs banned for serving data that failed verification.
    pub banned_ips: HashSet<IpAddr>,
    /// Addresses with a dial in flight.
    pub half_open: HashSet<SocketAddr>,
    /// Engine-wide half-open count, shared across torrents.
    pub global_half_open: Arc<AtomicUsize>,
    /// Our advertised listen port, for extension handshakes.
    pub listen_port: Option<u16>,
    /// Woken when the dialer may have work.
    pub dial_wakeup: Arc<Notify>,
}

impl Default for SwarmState {
    fn default() -> Self {
        Self {
            reserve: Vec::new(),
            known: HashSet::new(),
            banned_ips: HashSet::new(),
            half_open: HashSet::new(),
            global_half_open: Arc::new(AtomicUsize::new(0)),
            listen_port: None,
            dial_wakeup: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("torrent closed")]
    Closed,
    #[error("ip is banned")]
    Banned,
    #[error("already connected to this address")]
    DuplicateAddress,
    #[error("already connected to this peer id")]
    DuplicatePeerId,
    #[error("connection table full of better peers")]
    AtCapacity,
}

/// Everything the dial/accept path learned during the handshake.
pub struct HandshakeOutcome {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub peer_id: crate::peer::PeerId,
    pub fast_enabled: bool,
    pub extension_enabled: bool,
    pub outgoing: bool,
    pub source: PeerSource,
    pub trusted: bool,
}

/// Strict total eviction order, worst first: peers that have been
/// useful outrank those that haven't, then most-recently-useful, then
/// most-recently-handshaken, then higher BEP-40 priority, then the
/// younger key. Every comparison is a strict tiebreak of the previous,
/// so the order is total and eviction deterministic.
fn eviction_rank(core: &PeerCore) -> (bool, Option<Instant>, Option<Instant>, u32, u64) {
    let useful = core.last_useful_chunk_at.is_some() || core.peer_interested;
    (
        useful,
        core.last_useful_chunk_at,
        core.completed_handshake_at,
        core.bep40_priority,
        core.key.0,
    )
}

fn worst_wire_peer(state: &TorrentState) -> Option<(PeerKey, (bool, Option<Instant>, Option<Instant>, u32, u64))> {
    state
        .peers
        .values()
        .filter_map(|p| p.as_wire())
        .map(|s| (s.core.key, eviction_rank(&s.core)))
        .min_by(|a, b| a.1.cmp(&b.1))
}

fn wire_peer_count(state: &TorrentState) -> usize {
    state.peers.values().filter(|p| p.as_wire().is_some()).count()
}

/// Admits a freshly handshaken wire connection, evicting a worse peer
/// if the table is full. Queues the post-handshake messages on the new
/// session's writer.
pub fn admit_wire_peer(
    state: &mut TorrentState,
    outcome: HandshakeOutcome,
) -> Result<PeerKey, AdmitError> {
    if state.closed {
        return Err(AdmitError::Closed);
    }
    if state.is_banned(&outcome.remote_addr.ip()) {
        return Err(AdmitError::Banned);
    }
    if state
        .peers
        .values()
        .filter_map(|p| p.as_wire())
        .any(|s| s.core.remote_addr == outcome.remote_addr)
    {
        return Err(AdmitError::DuplicateAddress);
    }

    // One connection per peer id; an outgoing connection wins over an
    // incoming one to the same peer, otherwise first in stays.
    let same_id = state
        .peers
        .values()
        .filter_map(|p| p.as_wire())
        .find(|s| s.core.peer_id.as_ref() == Some(&outcome.peer_id))
        .map(|s| (s.core.key, s.core.outgoing));
    if let Some((existing, existing_outgoing)) = same_id {
        if outcome.outgoing && !existing_outgoing {
            drop_peer(state, existing, "replaced by outgoing connection");
        } else {
            return Err(AdmitError::DuplicatePeerId);
        }
    }

    let bep40 = priority::bep40_priority(outcome.local_addr, outcome.remote_addr);
    if wire_peer_count(state) >= state.config.max_established_conns {
        let candidate_rank = (false, None, Some(Instant::now()), bep40, u64::MAX);
        match worst_wire_peer(state) {
            Some((worst, worst_rank)) if worst_rank < candidate_rank => {
                Metrics::bump(&state.metrics.conns_evicted);
                drop_peer(state, worst, "evicted for a better connection");
            }
            _ => return Err(AdmitError::AtCapacity),
        }
    }

    let key = state.alloc_peer_key();
    let mut core = PeerCore::new(
        key,
        outcome.remote_addr,
        outcome.source,
        outcome.outgoing,
        state.layout.piece_count,
        &state.config,
    );
    core.peer_id = Some(outcome.peer_id);
    core.fast_enabled = outcome.fast_enabled;
    core.extension_enabled = outcome.extension_enabled;
    core.trusted = outcome.trusted;
    core.bep40_priority = bep40;
    core.completed_handshake_at = Some(Instant::now());

    let mut session = PeerSession::new(core);
    queue_post_handshake(state, &mut session);
    state.swarm.known.insert(outcome.remote_addr);
    state.peers.insert(key, Peer::Wire(session));
    Metrics::bump(&state.metrics.conns_admitted);

    let hooks = state.hooks.clone();
    let event = PeerEvent {
        key,
        addr: outcome.remote_addr,
        peer_id: Some(outcome.peer_id),
    };
    state.defer(move || {
        hooks.peer_added.emit(&event);
        hooks.handshake_completed.emit(&event);
    });
    info!(%key, addr = %outcome.remote_addr, outgoing = outcome.outgoing, "peer admitted");
    Ok(key)
}

/// First messages on a fresh connection: our piece inventory, the
/// extension handshake, and the peer's allowed-fast set.
fn queue_post_handshake(state: &TorrentState, session: &mut PeerSession) {
    use crate::peer::Message;

    if session.core.fast_enabled {
        if state.completed.is_empty() {
            session.writer.write(&Message::HaveNone);
        } else if state.completed.is_full() {
            session.writer.write(&Message::HaveAll);
        } else {
            session.writer.write(&Message::Bitfield(state.completed.to_bytes()));
        }
    } else if !state.completed.is_empty() {
        session
            .writer
            .write(&Message::Bitfield(state.completed.to_bytes()));
    }

    if session.core.extension_enabled {
        let hs = crate::peer::ExtensionHandshake::ours(state.swarm.listen_port);
        match hs.encode() {
            Ok(payload) => {
                session.writer.write(&Message::Extended { id: 0, payload });
            }
            Err(err) => warn!(%err, "failed to encode extension handshake"),
        }
    }

    if session.core.fast_enabled {
        let set = crate::peer::generate_allowed_fast_set(
            &state.info_hash,
            session.core.remote_addr.ip(),
            state.layout.piece_count,
            crate::constants::ALLOWED_FAST_SET_SIZE,
        );
        for piece in set {
            session.core.fast.allowed_fast_outgoing.insert(piece);
            session.writer.write(&Message::AllowedFast { piece });
        }
    }
}

/// Removes a peer: its requests return to the pool, availability is
/// decremented for everything it claimed, and its backend is shut down.
pub fn drop_peer(state: &mut TorrentState, key: PeerKey, reason: &str) {
    if state.peers.get(&key).is_none() {
        return;
    }
    // Mark closed first so rescheduling triggered by the released
    // requests skips this peer.
    if let Some(peer) = state.peers.get_mut(&key) {
        peer.backend_mut().on_close();
    }
    scheduler::release_peer_requests(state, key);

    let Some(peer) = state.peers.remove(&key) else {
        return;
    };
    let core = peer.backend().core();
    if core.has_all {
        for piece in 0..state.layout.piece_count {
            state.availability_dec(piece);
        }
    } else {
        let claimed: Vec<usize> = core.claimed.iter_set().collect();
        for piece in claimed {
            state.availability_dec(piece as u32);
        }
    }
    state.swarm.known.remove(&core.remote_addr);
    debug!(%key, addr = %core.remote_addr, reason, "peer dropped");

    let hooks = state.hooks.clone();
    let event = PeerEvent {
        key,
        addr: core.remote_addr,
        peer_id: core.peer_id,
    };
    state.defer(move || hooks.peer_closed.emit(&event));
    state.swarm.dial_wakeup.notify_one();
}

/// One torrent's swarm engine: owns the shared state and drives dialing
/// and hashing. Connection tasks are spawned as peers come and go.
pub struct Swarm {
    shared: Shared,
}

impl Swarm {
    pub fn new(
        info_hash: [u8; 20],
        layout: TorrentLayout,
        piece_hashes: Vec<[u8; 20]>,
        config: Config,
        storage: Arc<dyn TorrentStorage>,
        hooks: Hooks,
    ) -> Self {
        let state = TorrentState::new(
            info_hash,
            layout,
            piece_hashes,
            Arc::new(config),
            storage,
            Arc::new(hooks),
            Arc::new(Metrics::default()),
        );
        let swarm = Self {
            shared: Shared::new(state),
        };
        // Pick up pieces the storage already holds.
        swarm.shared.with_write(|s| {
            for piece in 0..s.layout.piece_count {
                piece::recheck_completion(s, piece);
            }
        });
        swarm
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.with_read(|s| s.metrics.clone())
    }

    pub fn set_listen_port(&self, port: u16) {
        self.shared.with_write(|s| s.swarm.listen_port = Some(port));
    }

    pub fn is_complete(&self) -> bool {
        self.shared.with_read(|s| s.completed.is_full())
    }

    pub fn bytes_left(&self) -> u64 {
        self.shared.with_read(|s| s.bytes_left())
    }

    /// Sets the download priority of one piece, rescheduling requests
    /// against it. Readers use this for their "now" and readahead
    /// windows.
    pub fn set_piece_priority(&self, piece: u32, priority: piece::PiecePriority) {
        self.shared
            .with_write(|s| scheduler::set_piece_priority(s, piece, priority));
    }

    /// Feeds addresses into the dial reserve.
    pub fn add_peers(&self, peers: Vec<PeerInfo>) {
        self.shared.with_write(|s| {
            for info in peers {
                if s.is_banned(&info.addr.ip()) || !s.swarm.known.insert(info.addr) {
                    continue;
                }
                s.swarm.reserve.push(info);
            }
            s.swarm.dial_wakeup.notify_one();
        });
    }

    /// Registers a webseed URL and starts fetching from it.
    pub fn add_webseed(&self, url: String) -> PeerKey {
        let key = self.shared.with_write(|s| {
            let key = s.alloc_peer_key();
            let core = PeerCore::new(
                key,
                WebseedPeer::placeholder_addr(),
                PeerSource::User,
                true,
                s.layout.piece_count,
                &s.config,
            );
            let ws = WebseedPeer::new(core, url);
            s.peers.insert(key, Peer::Webseed(ws));
            for piece in 0..s.layout.piece_count {
                s.availability_inc(piece);
            }
            scheduler::update_requests(s, key, UpdateReason::PeerBitfield);
            key
        });
        tokio::spawn(webseed::drive_webseed(self.shared.clone(), key));
        tokio::spawn(dial::watchdog_loop(self.shared.clone(), key));
        key
    }

    /// Hands an accepted inbound connection to the swarm.
    pub async fn handle_incoming(&self, stream: TcpStream) {
        if let Err(err) = dial::establish_incoming(self.shared.clone(), stream).await {
            debug!(%err, "incoming connection failed");
        }
    }

    /// Runs the dialer and the hashing pipeline until the swarm closes.
    pub async fn run(&self) {
        let (hash_wakeup, dial_wakeup) = self
            .shared
            .with_read(|s| (s.hash_wakeup.clone(), s.swarm.dial_wakeup.clone()));
        dial::fill_dials(&self.shared);
        loop {
            if self.shared.with_read(|s| s.closed) {
                return;
            }
            tokio::select! {
                _ = hash_wakeup.notified() => piece::drive_hashing(&self.shared).await,
                _ = dial_wakeup.notified() => dial::fill_dials(&self.shared),
                _ = tokio::time::sleep(Duration::from_secs(10)) => dial::fill_dials(&self.shared),
            }
        }
    }

    /// Shuts the swarm down: closes every peer backend and wakes all
    /// waiting tasks so they can exit.
    pub fn close(&self) {
        self.shared.with_write(|s| {
            s.closed = true;
            for peer in s.peers.values_mut() {
                peer.backend_mut().on_close();
            }
            s.hash_wakeup.notify_one();
            s.swarm.dial_wakeup.notify_one();
        });
    }
}
