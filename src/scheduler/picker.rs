use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use crate::piece::PiecePriority;
use crate::scheduler::RequestIndex;
use crate::torrent::{PeerKey, TorrentState};

/// Desired additions to one peer's outstanding-request set, computed
/// read-only and applied in a second pass.
#[derive(Debug)]
pub struct Plan {
    pub interested: bool,
    pub picks: Vec<Pick>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pick {
    pub r: RequestIndex,
    /// Current owner to cancel first, when this pick is a steal.
    pub steal_from: Option<PeerKey>,
}

struct Candidate {
    r: RequestIndex,
    priority: PiecePriority,
    availability: u32,
    allowed_fast: bool,
    steal_from: Option<PeerKey>,
}

#[derive(Clone, Copy)]
struct OwnerInfo {
    load: usize,
    last_useful: Option<Instant>,
}

/// Computes the request plan for `key` without mutating anything.
///
/// Candidate order, best first: under choke only allowed-fast chunks
/// qualify at all; then piece priority descending, unowned chunks
/// before steals, steals from the most loaded then stalest owner
/// first, rarest piece first, and index order for stability. Victim
/// loads are tracked across picks so one pass cannot strip an owner
/// below the steal margin.
pub fn plan(state: &TorrentState, key: PeerKey) -> Plan {
    let Some(peer) = state.peers.get(&key) else {
        return Plan {
            interested: false,
            picks: Vec::new(),
        };
    };
    let backend = peer.backend();
    let core = backend.core();

    if state.download_disabled || state.closed || core.closed {
        return Plan {
            interested: core.interested,
            picks: Vec::new(),
        };
    }

    let budget = request_budget(state, key);
    let outstanding = core.requests.len();
    // Keep total unverified data bounded across the whole swarm.
    let room = budget
        .saturating_sub(outstanding)
        .min(global_request_room(state));
    let my_last_useful = core.last_useful_chunk_at;

    let mut interested = false;
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut owners: HashMap<PeerKey, OwnerInfo> = HashMap::new();

    for piece in 0..state.layout.piece_count {
        if !state.wants_piece(piece) || !core.claims_piece(piece) {
            continue;
        }
        interested = true;
        let allowed_fast = core.fast.can_request_while_choked(piece);
        if core.peer_choking && !allowed_fast {
            continue;
        }
        let p = &state.pieces[piece as usize];
        for chunk in 0..state.layout.chunk_count(piece) {
            if p.dirty.has(chunk as usize) {
                continue;
            }
            let r = state.layout.request_index(piece, chunk);
            if core.requests.contains(&r) || core.cancelled.contains(&r) {
                continue;
            }
            let steal = match state.pending.owner(r) {
                None => None,
                Some(owner) if owner == key => continue,
                Some(owner) => Some(owner),
            };
            if let Some(owner) = steal {
                owners.entry(owner).or_insert_with(|| {
                    state
                        .peers
                        .get(&owner)
                        .map(|o| {
                            let oc = o.backend().core();
                            OwnerInfo {
                                load: oc.requests.len(),
                                last_useful: oc.last_useful_chunk_at,
                            }
                        })
                        .unwrap_or(OwnerInfo {
                            load: 0,
                            last_useful: None,
                        })
                });
            }
            candidates.push(Candidate {
                r,
                priority: p.priority,
                availability: state.availability[piece as usize],
                allowed_fast,
                steal_from: steal,
            });
        }
    }

    candidates.sort_by(|a, b| compare(a, b, &owners, core.peer_choking));

    let margin = state.config.steal_margin as i64;
    let mut picks = Vec::new();
    for c in candidates {
        if picks.len() >= room {
            break;
        }
        if let Some(owner) = c.steal_from {
            let allowed = owners
                .get(&owner)
                .is_some_and(|info| {
                    steal_allowed(outstanding + picks.len(), info, my_last_useful, margin)
                });
            if !allowed {
                continue;
            }
            if let Some(info) = owners.get_mut(&owner) {
                info.load -= 1;
            }
        }
        picks.push(Pick {
            r: c.r,
            steal_from: c.steal_from,
        });
    }

    Plan { interested, picks }
}

fn compare(
    a: &Candidate,
    b: &Candidate,
    owners: &HashMap<PeerKey, OwnerInfo>,
    remote_choking: bool,
) -> Ordering {
    if remote_choking {
        // Only allowed-fast chunks survive generation under choke, but
        // keep the bias explicit for mixed sets.
        match b.allowed_fast.cmp(&a.allowed_fast) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    let owner = |c: &Candidate| {
        c.steal_from
            .and_then(|o| owners.get(&o))
            .map(|i| (i.load, i.last_useful))
            .unwrap_or((0, None))
    };
    let (a_load, a_useful) = owner(a);
    let (b_load, b_useful) = owner(b);
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.steal_from.is_some().cmp(&b.steal_from.is_some()))
        .then_with(|| b_load.cmp(&a_load))
        .then_with(|| compare_staleness(a_useful, b_useful))
        .then_with(|| a.availability.cmp(&b.availability))
        .then_with(|| a.r.cmp(&b.r))
}

/// Stalest owner first. An owner that never produced a chunk counts as
/// infinitely stale.
fn compare_staleness(a: Option<Instant>, b: Option<Instant>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

/// A steal moves a request from its owner to the beneficiary. It is
/// allowed when the beneficiary ends up below the victim's remainder
/// plus the configured margin, or lands exactly on the margin while
/// having produced a useful chunk more recently than the victim.
fn steal_allowed(
    beneficiary_load: usize,
    victim: &OwnerInfo,
    beneficiary_last_useful: Option<Instant>,
    margin: i64,
) -> bool {
    if victim.load == 0 {
        return false;
    }
    let after_mine = beneficiary_load as i64 + 1;
    let after_theirs = victim.load as i64 - 1;
    let diff = after_mine - after_theirs;
    if diff < margin {
        return true;
    }
    if diff > margin {
        return false;
    }
    compare_staleness(victim.last_useful, beneficiary_last_useful) == Ordering::Less
}

/// Per-peer outstanding cap: the advertised (or assumed) queue limit,
/// twice the observed peak so the window can grow, and whatever the
/// outbound buffer can absorb, floored at one.
fn request_budget(state: &TorrentState, key: PeerKey) -> usize {
    let Some(peer) = state.peers.get(&key) else {
        return 0;
    };
    let backend = peer.backend();
    let core = backend.core();
    core.peer_max_requests
        .min((2 * core.peak_requests).max(1))
        .min(backend.writable_request_budget())
        .max(1)
}

/// How many more requests the whole torrent may have outstanding before
/// unverified data exceeds the configured (or storage-imposed) bound.
fn global_request_room(state: &TorrentState) -> usize {
    let mut limit = state.config.max_unverified_bytes;
    if let Some(cap) = state.storage.capacity() {
        limit = limit.min(cap);
    }
    let slots = (limit / state.layout.chunk_size as u64) as usize;
    slots.saturating_sub(state.pending.len())
}
