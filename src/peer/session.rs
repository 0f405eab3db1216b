//! Wire-protocol peer sessions.
//!
//! A [`PeerSession`] is the lock-guarded state machine for one TCP peer.
//! The connection's read loop decodes frames and feeds them through
//! [`handle_message`] under the torrent lock; anything that needs a
//! socket or storage comes back out as a [`SessionAction`] and runs off
//! the lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::constants::UT_PEX_ID;
use crate::events::{MessageEvent, Metrics, RequestEvent};
use crate::peer::backend::{PeerBackend, PeerCore};
use crate::peer::error::PeerError;
use crate::peer::extension::{tolerates_extension_id_misuse, ExtensionHandshake};
use crate::peer::message::{BlockRef, Message};
use crate::peer::writer::OutboundWriter;
use crate::piece::{self, ChunkDisposition, WriteJob};
use crate::scheduler::{self, UpdateReason};
use crate::torrent::{PeerKey, TorrentState};

/// Ceiling on a single incoming block request.
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Clamp for absurd remote `reqq` advertisements.
const MAX_ADVERTISED_REQQ: usize = 2048;

/// A connected wire peer. Socket I/O lives in the connection's tasks;
/// everything here mutates under the torrent lock only.
pub struct PeerSession {
    pub core: PeerCore,
    pub writer: OutboundWriter,
    /// Block requests the remote has queued against us, FIFO.
    pub peer_requests: VecDeque<BlockRef>,
    /// Swarm addresses already announced to this peer via PEX.
    pub pex_sent: std::collections::HashSet<std::net::SocketAddr>,
    /// Fired by `on_close` so the read loop unblocks without waiting
    /// out its idle deadline.
    shutdown: Arc<Notify>,
}

impl PeerSession {
    pub fn new(core: PeerCore) -> Self {
        Self {
            core,
            writer: OutboundWriter::new(),
            peer_requests: VecDeque::new(),
            pex_sent: std::collections::HashSet::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle for the read loop to select on alongside socket reads.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Announces a newly verified piece, skipping peers that already
    /// claim it.
    pub fn send_have(&mut self, piece: u32) {
        if !self.core.claims_piece(piece) {
            self.writer.write(&Message::Have { piece });
        }
    }

    /// Chokes the remote, flushing its queued requests. With the fast
    /// extension each dropped request is explicitly rejected.
    pub fn choke(&mut self) {
        if self.core.choking {
            return;
        }
        self.core.choking = true;
        self.writer.write(&Message::Choke);
        let queued: Vec<BlockRef> = self.peer_requests.drain(..).collect();
        if self.core.fast_enabled {
            for block in queued {
                self.writer.write(&Message::Reject(block));
            }
        }
    }

    pub fn unchoke(&mut self) {
        if !self.core.choking {
            return;
        }
        self.core.choking = false;
        self.writer.write(&Message::Unchoke);
    }
}

impl PeerBackend for PeerSession {
    fn core(&self) -> &PeerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeerCore {
        &mut self.core
    }

    fn issue_request(&mut self, block: BlockRef) {
        self.writer.write(&Message::Request(block));
    }

    fn cancel_request(&mut self, block: BlockRef) -> bool {
        self.writer.write(&Message::Cancel(block));
        self.core.fast_enabled
    }

    fn declare_interest(&mut self, interested: bool) {
        self.core.interested = interested;
        self.writer.write(if interested {
            &Message::Interested
        } else {
            &Message::NotInterested
        });
    }

    fn writable_request_budget(&self) -> usize {
        self.writer.request_budget()
    }

    fn on_close(&mut self) {
        self.core.closed = true;
        self.writer.close();
        // notify_one stores a permit, so a read loop that is not parked
        // yet still sees the shutdown on its next wait.
        self.shutdown.notify_one();
    }
}

/// Work the read loop must perform off the lock after a message.
#[derive(Debug)]
pub enum SessionAction {
    /// Persist a received chunk, then report via
    /// [`piece::chunk_write_finished`].
    Persist(WriteJob),
    /// Read a block from storage and upload it to the peer.
    Serve(BlockRef),
}

fn wire_mut<'a>(
    state: &'a mut TorrentState,
    key: PeerKey,
) -> Result<&'a mut PeerSession, PeerError> {
    state
        .peers
        .get_mut(&key)
        .and_then(|p| p.as_wire_mut())
        .ok_or_else(|| PeerError::InternalInvariant(format!("no wire session for {key}")))
}

/// Applies one decoded message to a session. Returns follow-up actions
/// for the read loop; an error closes the connection.
pub fn handle_message(
    state: &mut TorrentState,
    key: PeerKey,
    msg: Message,
) -> Result<Vec<SessionAction>, PeerError> {
    if state.peers.get(&key).is_none() || state.closed {
        return Ok(Vec::new());
    }
    let message_id = msg.id();
    {
        let session = wire_mut(state, key)?;
        if let Some(id) = message_id {
            if id.requires_fast_extension() && !session.core.fast_enabled {
                return Err(PeerError::FastExtensionDisabled(id as u8));
            }
        }
    }
    if !state.hooks.message_read.is_empty() {
        let hooks = state.hooks.clone();
        state.defer(move || hooks.message_read.emit(&MessageEvent { key, message_id }));
    }

    let mut actions = Vec::new();
    match msg {
        Message::KeepAlive => {}
        Message::Choke => on_choke(state, key)?,
        Message::Unchoke => {
            wire_mut(state, key)?.core.peer_choking = false;
            scheduler::update_requests(state, key, UpdateReason::Unchoke);
        }
        Message::Interested => {
            let session = wire_mut(state, key)?;
            session.core.peer_interested = true;
            // Serve everyone who asks; no upload choking algorithm.
            session.unchoke();
        }
        Message::NotInterested => {
            let session = wire_mut(state, key)?;
            session.core.peer_interested = false;
            session.choke();
        }
        Message::Have { piece } => on_have(state, key, piece)?,
        Message::Bitfield(bytes) => on_bitfield(state, key, &bytes)?,
        Message::HaveAll => on_have_all(state, key)?,
        Message::HaveNone => on_have_none(state, key)?,
        Message::Request(block) => {
            if let Some(action) = on_peer_request(state, key, block)? {
                actions.push(action);
            }
        }
        Message::Piece { piece, offset, data } => {
            if let Some(job) = on_chunk(state, key, piece, offset, data)? {
                actions.push(SessionAction::Persist(job));
            }
        }
        Message::Cancel(block) => on_peer_cancel(state, key, block)?,
        Message::Reject(block) => on_reject(state, key, block)?,
        Message::Suggest { piece } => {
            check_piece_index(state, piece)?;
            wire_mut(state, key)?.core.fast.add_suggested(piece);
        }
        Message::AllowedFast { piece } => {
            check_piece_index(state, piece)?;
            wire_mut(state, key)?
                .core
                .fast
                .allowed_fast_incoming
                .insert(piece);
            scheduler::update_requests(state, key, UpdateReason::PeerHave);
        }
        Message::Extended { id, payload } => on_extended(state, key, id, &payload)?,
        Message::Port(_) => {
            // No DHT; acknowledged and ignored.
        }
    }
    Ok(actions)
}

fn check_piece_index(state: &TorrentState, piece: u32) -> Result<(), PeerError> {
    if piece >= state.layout.piece_count {
        return Err(PeerError::ProtocolViolation(format!(
            "piece index {piece} out of range"
        )));
    }
    Ok(())
}

/// A remote choke without the fast extension forfeits every outstanding
/// request; with it, the remote will reject them individually.
fn on_choke(state: &mut TorrentState, key: PeerKey) -> Result<(), PeerError> {
    let fast = {
        let session = wire_mut(state, key)?;
        session.core.peer_choking = true;
        session.core.fast_enabled
    };
    if !fast {
        scheduler::release_peer_requests(state, key);
    }
    scheduler::update_requests(state, key, UpdateReason::Choked);
    Ok(())
}

fn on_have(state: &mut TorrentState, key: PeerKey, piece: u32) -> Result<(), PeerError> {
    check_piece_index(state, piece)?;
    let newly_claimed = {
        let session = wire_mut(state, key)?;
        if session.core.claims_piece(piece) {
            false
        } else {
            session.core.claimed.set(piece as usize);
            true
        }
    };
    // Repeated Haves for the same piece must not skew availability.
    if newly_claimed {
        state.availability_inc(piece);
        if state.wants_piece(piece) {
            scheduler::update_requests(state, key, UpdateReason::PeerHave);
        }
    }
    Ok(())
}

fn on_bitfield(state: &mut TorrentState, key: PeerKey, bytes: &Bytes) -> Result<(), PeerError> {
    let piece_count = state.layout.piece_count as usize;
    let expected_len = piece_count.div_ceil(8);
    if bytes.len() != expected_len {
        return Err(PeerError::ProtocolViolation(format!(
            "bitfield length {} for {piece_count} pieces",
            bytes.len()
        )));
    }
    // Spare bits in the trailing byte must be zero.
    for bit in piece_count..bytes.len() * 8 {
        if bytes[bit / 8] & (0x80 >> (bit % 8)) != 0 {
            return Err(PeerError::ProtocolViolation(
                "bitfield has spare bits set".into(),
            ));
        }
    }

    // A replacement bitfield may claim and un-claim pieces at once;
    // availability must track both directions.
    let mut newly_claimed = Vec::new();
    let mut released = Vec::new();
    {
        let session = wire_mut(state, key)?;
        let fresh = crate::peer::Bitfield::from_bytes(bytes, piece_count);
        for piece in 0..piece_count {
            let had = session.core.claims_piece(piece as u32);
            if fresh.has(piece) && !had {
                newly_claimed.push(piece as u32);
            } else if !fresh.has(piece) && had {
                released.push(piece as u32);
            }
        }
        session.core.has_all = false;
        session.core.claimed = fresh;
    }
    for piece in &newly_claimed {
        state.availability_inc(*piece);
    }
    for piece in &released {
        state.availability_dec(*piece);
    }
    if !newly_claimed.is_empty() {
        scheduler::update_requests(state, key, UpdateReason::PeerBitfield);
    }
    Ok(())
}

fn on_have_none(state: &mut TorrentState, key: PeerKey) -> Result<(), PeerError> {
    let piece_count = state.layout.piece_count;
    let released: Vec<u32> = {
        let session = wire_mut(state, key)?;
        let released = (0..piece_count)
            .filter(|&p| session.core.claims_piece(p))
            .collect();
        session.core.has_all = false;
        session.core.claimed.clear_all();
        released
    };
    for piece in &released {
        state.availability_dec(*piece);
    }
    Ok(())
}

fn on_have_all(state: &mut TorrentState, key: PeerKey) -> Result<(), PeerError> {
    let piece_count = state.layout.piece_count;
    let newly_claimed: Vec<u32> = {
        let session = wire_mut(state, key)?;
        let fresh: Vec<u32> = (0..piece_count)
            .filter(|&p| !session.core.claims_piece(p))
            .collect();
        session.core.has_all = true;
        fresh
    };
    for piece in &newly_claimed {
        state.availability_inc(*piece);
    }
    if !newly_claimed.is_empty() {
        scheduler::update_requests(state, key, UpdateReason::PeerBitfield);
    }
    Ok(())
}

/// Validates and queues an incoming block request, or answers it with a
/// Reject where the fast extension allows saying no politely.
fn on_peer_request(
    state: &mut TorrentState,
    key: PeerKey,
    block: BlockRef,
) -> Result<Option<SessionAction>, PeerError> {
    if block.length > MAX_REQUEST_LENGTH {
        return Err(PeerError::ProtocolViolation(format!(
            "requested block of {} bytes",
            block.length
        )));
    }
    if !state.layout.range_in_piece(&block) {
        return Err(PeerError::ProtocolViolation(format!(
            "request outside piece bounds: {block:?}"
        )));
    }
    let have_piece = state.completed.has(block.piece as usize);
    let max_queue = state.config.max_peer_requests;

    let session = wire_mut(state, key)?;
    let fast = session.core.fast_enabled;

    if !have_piece {
        if fast {
            session.writer.write(&Message::Reject(block));
            return Ok(None);
        }
        return Err(PeerError::ProtocolViolation(format!(
            "request for piece {} we don't have",
            block.piece
        )));
    }
    if session.core.choking {
        if fast && session.core.fast.should_serve_while_choking(block.piece) {
            // Allowed-fast pieces are served through the choke.
        } else {
            if fast {
                session.writer.write(&Message::Reject(block));
            }
            return Ok(None);
        }
    }
    if session.peer_requests.len() >= max_queue {
        if fast {
            session.writer.write(&Message::Reject(block));
            return Ok(None);
        }
        return Err(PeerError::ProtocolViolation(
            "request queue overflow".into(),
        ));
    }
    if session.peer_requests.contains(&block) {
        return Ok(None);
    }
    session.peer_requests.push_back(block);
    Ok(Some(SessionAction::Serve(block)))
}

fn on_peer_cancel(state: &mut TorrentState, key: PeerKey, block: BlockRef) -> Result<(), PeerError> {
    let found = {
        let session = wire_mut(state, key)?;
        match session.peer_requests.iter().position(|b| *b == block) {
            Some(pos) => {
                session.peer_requests.remove(pos);
                // The fast extension requires every request be
                // answered, even a cancelled one.
                if session.core.fast_enabled {
                    session.writer.write(&Message::Reject(block));
                }
                true
            }
            None => false,
        }
    };
    if !found {
        // Likely raced with our upload of the block.
        trace!(%key, ?block, "cancel for request not queued");
        Metrics::bump(&state.metrics.unexpected_cancels);
    }
    Ok(())
}

/// An incoming chunk. Valid receives are matched against the
/// valid-receive multiset so late data for cancelled requests is still
/// accepted; anything unmatched counts as unexpected and is dropped.
fn on_chunk(
    state: &mut TorrentState,
    key: PeerKey,
    piece: u32,
    offset: u32,
    data: Bytes,
) -> Result<Option<WriteJob>, PeerError> {
    let block = BlockRef::new(piece, offset, data.len() as u32);
    let mapped = state.layout.request_index_of(&block);
    let matched = {
        let session = wire_mut(state, key)?;
        session.core.bytes_downloaded += data.len() as u64;
        match mapped {
            None => None,
            Some(r) => {
                let valid = match session.core.valid_receive_chunks.get_mut(&r) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        if *n == 0 {
                            session.core.valid_receive_chunks.remove(&r);
                        }
                        true
                    }
                    _ => false,
                };
                if valid {
                    session.core.last_useful_chunk_at = Some(Instant::now());
                    Some(r)
                } else {
                    None
                }
            }
        }
    };
    let Some(r) = matched else {
        debug!(%key, ?block, "chunk we never asked for");
        Metrics::bump(&state.metrics.chunks_received_unexpected);
        return Ok(None);
    };
    Metrics::bump(&state.metrics.chunks_received);

    let was_ours = {
        let core = wire_mut(state, key)?.core();
        core.requests.contains(&r) || core.cancelled.contains(&r)
    };
    if was_ours {
        scheduler::delete_request(state, key, r);
        let hooks = state.hooks.clone();
        state.defer(move || hooks.request_satisfied.emit(&RequestEvent { key, request: r }));
    }

    match piece::chunk_received(state, key, r, data) {
        ChunkDisposition::Accepted(job) => Ok(Some(job)),
        ChunkDisposition::Wasted => Ok(None),
    }
}

/// A Reject must answer something we actually have in flight; anything
/// else is a protocol error.
fn on_reject(state: &mut TorrentState, key: PeerKey, block: BlockRef) -> Result<(), PeerError> {
    let Some(r) = state.layout.request_index_of(&block) else {
        return Err(PeerError::ProtocolViolation(format!(
            "reject for malformed block {block:?}"
        )));
    };
    let (outstanding, cancelled) = {
        let core = wire_mut(state, key)?.core();
        (core.requests.contains(&r), core.cancelled.contains(&r))
    };
    if !outstanding && !cancelled {
        Metrics::bump(&state.metrics.invalid_rejects);
        return Err(PeerError::InvalidReject(r));
    }
    scheduler::delete_request(state, key, r);
    if outstanding {
        scheduler::update_requests(state, key, UpdateReason::Rejected);
    }
    Ok(())
}

fn on_extended(
    state: &mut TorrentState,
    key: PeerKey,
    id: u8,
    payload: &[u8],
) -> Result<(), PeerError> {
    let extension_enabled = wire_mut(state, key)?.core.extension_enabled;
    if !extension_enabled {
        return Err(PeerError::Extension(
            "extended message without negotiation".into(),
        ));
    }
    if id == 0 {
        let hs = ExtensionHandshake::decode(payload)?;
        let session = wire_mut(state, key)?;
        if let Some(reqq) = hs.reqq {
            if reqq > 0 {
                session.core.peer_max_requests = (reqq as usize).min(MAX_ADVERTISED_REQQ);
            }
        }
        session.core.pex_id = hs.extension_id("ut_pex");
        if let Some(v) = &hs.v {
            trace!(%key, client = %v, "extension handshake");
        }
        return Ok(());
    }
    if id == UT_PEX_ID {
        return crate::pex::handle_pex_message(state, key, payload);
    }
    let tolerant = wire_mut(state, key)?
        .core
        .peer_id
        .as_ref()
        .map(tolerates_extension_id_misuse)
        .unwrap_or(false);
    if tolerant {
        debug!(%key, id, "ignoring bogus extended message id from quirky client");
        Ok(())
    } else {
        Err(PeerError::Extension(format!("unknown extended id {id}")))
    }
}
