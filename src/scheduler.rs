//! Block-level request scheduling.
//!
//! The scheduler decides, per peer, which request indexes should be
//! outstanding and applies that decision against the peer's live state.
//! It runs on demand (tagged reasons, not every event) plus a periodic
//! starvation watchdog per connection.

mod pending;
mod picker;
#[cfg(test)]
mod tests;

pub use pending::PendingRequests;
pub use picker::{plan, Pick, Plan};

use tracing::{trace, warn};

use crate::events::{Metrics, RequestEvent};
use crate::piece::PiecePriority;
use crate::torrent::{PeerKey, TorrentState};

/// Flattened `(piece, chunk)` identifier: `piece * chunks_per_piece + chunk`.
pub type RequestIndex = u32;

/// Why a request-state re-evaluation was triggered. Used for tracing and
/// for tuning decisions, never for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    PiecePriority,
    PeerHave,
    PeerBitfield,
    Unchoke,
    Choked,
    Rejected,
    RequestsReleased,
    WriterDrained,
    PieceCompleted,
    PieceIncomplete,
    Watchdog,
}

/// Recomputes and applies the desired outstanding-request set for one
/// peer.
pub fn update_requests(state: &mut TorrentState, key: PeerKey, reason: UpdateReason) {
    if state.closed {
        return;
    }
    let Some(peer) = state.peers.get(&key) else {
        return;
    };
    if peer.backend().core().closed {
        return;
    }

    let plan = picker::plan(state, key);
    trace!(%key, ?reason, picks = plan.picks.len(), interested = plan.interested, "updating requests");
    apply_plan(state, key, plan);
}

fn apply_plan(state: &mut TorrentState, key: PeerKey, plan: Plan) {
    // Interest is declared before the first request goes out.
    {
        let Some(peer) = state.peers.get_mut(&key) else {
            return;
        };
        let backend = peer.backend_mut();
        if backend.core().interested != plan.interested {
            backend.declare_interest(plan.interested);
        }
    }

    let mut issued = 0usize;
    for pick in &plan.picks {
        if !revalidate_pick(state, key, pick) {
            continue;
        }
        if let Some(victim) = pick.steal_from {
            cancel_peer_request(state, victim, pick.r);
            Metrics::bump(&state.metrics.requests_stolen);
        }
        if issue_request(state, key, pick.r) {
            issued += 1;
        }
    }

    if let Some(peer) = state.peers.get_mut(&key) {
        let core = peer.backend_mut().core_mut();
        let outstanding = core.requests.len();
        if issued > 0 && outstanding > core.peak_requests {
            // High-water mark; the window grows toward twice this and
            // shrinks only when requests get cancelled or stolen.
            core.peak_requests = outstanding;
        }
    }
}

/// Candidate generation and application are separated by a re-borrow, so
/// a pick can go stale in between. A stale pick here means candidate
/// generation was wrong; treat it as a defensive fault.
fn revalidate_pick(state: &TorrentState, key: PeerKey, pick: &Pick) -> bool {
    let piece = state.layout.piece_of(pick.r);
    let Some(peer) = state.peers.get(&key) else {
        return false;
    };
    let core = peer.backend().core();

    let p = &state.pieces[piece as usize];
    if p.hashing || p.queued_for_hash || state.completed.has(piece as usize) {
        debug_assert!(false, "picked chunk of piece {piece} in hash pipeline");
        warn!(%key, piece, "stale pick: piece entered hash pipeline");
        return false;
    }
    if !core.claims_piece(piece) {
        debug_assert!(false, "picked chunk of piece {piece} the peer doesn't claim");
        warn!(%key, piece, "stale pick: peer does not claim piece");
        return false;
    }
    if core.requests.contains(&pick.r) || core.cancelled.contains(&pick.r) {
        return false;
    }
    if core.peer_choking && !core.fast.can_request_while_choked(piece) {
        return false;
    }
    match state.pending.owner(pick.r) {
        Some(owner) if Some(owner) != pick.steal_from => {
            debug_assert!(false, "pick owner changed under us");
            warn!(%key, r = pick.r, "stale pick: owner changed");
            false
        }
        _ => true,
    }
}

/// Issues one request to a peer: records ownership, bumps the
/// valid-receive multiset, and writes the wire message.
fn issue_request(state: &mut TorrentState, key: PeerKey, r: RequestIndex) -> bool {
    if let Err(owner) = state.pending.claim(r, key) {
        debug_assert!(false, "request {r} already owned by {owner}");
        warn!(%key, r, %owner, "refusing to double-assign request");
        return false;
    }
    let block = state.layout.block_ref(r);
    let Some(peer) = state.peers.get_mut(&key) else {
        state.pending.release(r, key);
        return false;
    };
    let backend = peer.backend_mut();
    let core = backend.core_mut();
    core.requests.insert(r);
    *core.valid_receive_chunks.entry(r).or_insert(0) += 1;
    backend.issue_request(block);

    Metrics::bump(&state.metrics.requests_sent);
    let hooks = state.hooks.clone();
    state.defer(move || hooks.request_sent.emit(&RequestEvent { key, request: r }));
    true
}

/// Changes a piece's download priority and re-evaluates every peer that
/// could act on it. Dropping a piece to `Skip` instead cancels its
/// outstanding requests.
pub fn set_piece_priority(state: &mut TorrentState, piece: u32, priority: PiecePriority) {
    if piece >= state.layout.piece_count {
        return;
    }
    if state.pieces[piece as usize].priority == priority {
        return;
    }
    state.pieces[piece as usize].priority = priority;
    if !priority.wanted() {
        let layout = state.layout;
        for chunk in 0..layout.chunk_count(piece) {
            cancel_request(state, layout.request_index(piece, chunk));
        }
        return;
    }
    let claimers: Vec<PeerKey> = state
        .peers
        .values()
        .map(|p| p.backend().core())
        .filter(|c| c.claims_piece(piece))
        .map(|c| c.key)
        .collect();
    for key in claimers {
        update_requests(state, key, UpdateReason::PiecePriority);
    }
}

/// Cancels whichever peer currently owns `r`, if any.
pub fn cancel_request(state: &mut TorrentState, r: RequestIndex) {
    if let Some(owner) = state.pending.owner(r) {
        cancel_peer_request(state, owner, r);
    }
}

/// Cancels an outstanding request held by `key`. With the fast extension
/// the request moves to the cancelled set until the peer acknowledges
/// with Reject or Piece; without it the request is simply dropped.
pub fn cancel_peer_request(state: &mut TorrentState, key: PeerKey, r: RequestIndex) {
    let Some(peer) = state.peers.get_mut(&key) else {
        return;
    };
    let backend = peer.backend_mut();
    if !backend.core_mut().requests.remove(&r) {
        debug_assert!(false, "cancelling request {r} not outstanding to {key}");
        warn!(%key, r, "cancel of request we don't hold");
        return;
    }
    let block = state.layout.block_ref(r);
    let ack_expected = backend.cancel_request(block);
    let core = backend.core_mut();
    if ack_expected {
        core.cancelled.insert(r);
    }
    core.peak_requests = core.peak_requests.saturating_sub(1);
    state.pending.release(r, key);

    let hooks = state.hooks.clone();
    state.defer(move || hooks.request_deleted.emit(&RequestEvent { key, request: r }));
}

/// Removes a request that reached a terminal state at the peer
/// (satisfied by a chunk or acknowledged-rejected). Does not write
/// anything to the wire.
pub fn delete_request(state: &mut TorrentState, key: PeerKey, r: RequestIndex) {
    let Some(peer) = state.peers.get_mut(&key) else {
        return;
    };
    let core = peer.backend_mut().core_mut();
    let was_outstanding = core.requests.remove(&r);
    let was_cancelled = core.cancelled.remove(&r);
    if !was_outstanding && !was_cancelled {
        return;
    }
    if was_outstanding {
        state.pending.release(r, key);
    }
    let hooks = state.hooks.clone();
    state.defer(move || hooks.request_deleted.emit(&RequestEvent { key, request: r }));
}

/// Releases every request a departing peer held back to the pool and
/// re-evaluates the peers that could pick them up.
pub fn release_peer_requests(state: &mut TorrentState, key: PeerKey) {
    let requests: Vec<RequestIndex> = {
        let Some(peer) = state.peers.get_mut(&key) else {
            return;
        };
        let core = peer.backend_mut().core_mut();
        core.cancelled.clear();
        core.requests.drain().collect()
    };
    for r in &requests {
        state.pending.release(*r, key);
    }
    if requests.is_empty() {
        return;
    }
    let others: Vec<PeerKey> = state.peers.keys().copied().filter(|&k| k != key).collect();
    for other in others {
        update_requests(state, other, UpdateReason::RequestsReleased);
    }
}

/// True when a peer could usefully hold more requests than it does; the
/// starvation watchdog checks this.
pub fn is_low_on_requests(state: &TorrentState, key: PeerKey) -> bool {
    state
        .peers
        .get(&key)
        .map(|p| {
            let core = p.backend().core();
            core.requests.is_empty() && core.cancelled.is_empty()
        })
        .unwrap_or(false)
}
