use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::events::{Hooks, Metrics};
use crate::piece::PiecePriority;
use crate::peer::{PeerCore, PeerSession};
use crate::scheduler::{self, UpdateReason};
use crate::storage::MemoryStorage;
use crate::torrent::{Peer, PeerKey, PeerSource, TorrentLayout, TorrentState};

fn make_state(piece_count: u32, piece_length: u32) -> TorrentState {
    let layout = TorrentLayout {
        piece_count,
        piece_length,
        last_piece_length: piece_length,
        chunk_size: 16 * 1024,
    };
    let storage = Arc::new(MemoryStorage::new(piece_count, piece_length, piece_length));
    TorrentState::new(
        [7u8; 20],
        layout,
        vec![[0u8; 20]; piece_count as usize],
        Arc::new(Config::default()),
        storage,
        Arc::new(Hooks::default()),
        Arc::new(Metrics::default()),
    )
}

fn add_seed(state: &mut TorrentState, unchoked: bool) -> PeerKey {
    let key = state.alloc_peer_key();
    let addr: SocketAddr = format!("10.0.0.{}:6881", key.0).parse().unwrap();
    let mut core = PeerCore::new(
        key,
        addr,
        PeerSource::Tracker,
        true,
        state.layout.piece_count,
        &state.config,
    );
    core.has_all = true;
    core.peer_choking = !unchoked;
    core.completed_handshake_at = Some(Instant::now());
    state.peers.insert(key, Peer::Wire(PeerSession::new(core)));
    for piece in 0..state.layout.piece_count {
        state.availability_inc(piece);
    }
    key
}

fn outstanding(state: &TorrentState, key: PeerKey) -> usize {
    state.peers[&key].backend().core().requests.len()
}

fn set_peak(state: &mut TorrentState, key: PeerKey, peak: usize) {
    state
        .peers
        .get_mut(&key)
        .unwrap()
        .backend_mut()
        .core_mut()
        .peak_requests = peak;
}

#[test]
fn window_starts_at_one_and_doubles() {
    let mut state = make_state(4, 64 * 1024);
    let key = add_seed(&mut state, true);

    scheduler::update_requests(&mut state, key, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, key), 1);

    // Satisfying the request leaves the peak in place, so the next
    // evaluation may hold twice as many.
    let r = *state.peers[&key]
        .backend()
        .core()
        .requests
        .iter()
        .next()
        .unwrap();
    scheduler::delete_request(&mut state, key, r);
    // The satisfied chunk is still missing, so it is requestable again.
    scheduler::update_requests(&mut state, key, UpdateReason::Watchdog);
    assert_eq!(outstanding(&state, key), 2);
}

#[test]
fn requests_have_a_single_owner_across_peers() {
    let mut state = make_state(2, 64 * 1024);
    let a = add_seed(&mut state, true);
    let b = add_seed(&mut state, true);
    set_peak(&mut state, a, 64);
    set_peak(&mut state, b, 64);

    scheduler::update_requests(&mut state, a, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, a), 8);
    scheduler::update_requests(&mut state, b, UpdateReason::Unchoke);

    // Stealing rebalanced the pieces; every pending request has exactly
    // one owner and that owner agrees.
    let total = outstanding(&state, a) + outstanding(&state, b);
    assert_eq!(total, 8);
    assert_eq!(state.pending.len(), 8);
    for r in 0..8u32 {
        let owner = state.pending.owner(r).expect("every chunk requested");
        let core = state.peers[&owner].backend().core();
        assert!(core.requests.contains(&r));
        let other = if owner == a { b } else { a };
        assert!(!state.peers[&other].backend().core().requests.contains(&r));
    }
}

#[test]
fn steal_balances_load_between_peers() {
    let mut state = make_state(1, 64 * 1024);
    let a = add_seed(&mut state, true);
    let b = add_seed(&mut state, true);
    set_peak(&mut state, a, 64);
    set_peak(&mut state, b, 64);

    scheduler::update_requests(&mut state, a, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, a), 4);
    scheduler::update_requests(&mut state, b, UpdateReason::Unchoke);

    assert_eq!(outstanding(&state, a), 2);
    assert_eq!(outstanding(&state, b), 2);
    assert!(Metrics::get(&state.metrics.requests_stolen) >= 2);
}

#[test]
fn steal_at_margin_requires_fresher_beneficiary() {
    // Three chunks per piece so the margin case is reachable.
    let mut state = make_state(1, 48 * 1024);
    let a = add_seed(&mut state, true);
    let b = add_seed(&mut state, true);
    set_peak(&mut state, a, 64);
    set_peak(&mut state, b, 64);

    scheduler::update_requests(&mut state, a, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, a), 3);

    // Equal staleness: the margin steal is suppressed.
    scheduler::update_requests(&mut state, b, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, b), 1);
    assert_eq!(outstanding(&state, a), 2);

    // A fresher beneficiary may land exactly on the margin.
    state
        .peers
        .get_mut(&b)
        .unwrap()
        .backend_mut()
        .core_mut()
        .last_useful_chunk_at = Some(Instant::now());
    scheduler::update_requests(&mut state, b, UpdateReason::Watchdog);
    assert_eq!(outstanding(&state, b), 2);
    assert_eq!(outstanding(&state, a), 1);
}

#[test]
fn remote_choke_gates_everything_but_allowed_fast() {
    let mut state = make_state(4, 64 * 1024);
    let key = add_seed(&mut state, false);
    set_peak(&mut state, key, 64);

    scheduler::update_requests(&mut state, key, UpdateReason::PeerBitfield);
    assert_eq!(outstanding(&state, key), 0);
    // Interest is still declared so the remote may unchoke us.
    assert!(state.peers[&key].backend().core().interested);

    state
        .peers
        .get_mut(&key)
        .unwrap()
        .backend_mut()
        .core_mut()
        .fast
        .allowed_fast_incoming
        .insert(2);
    scheduler::update_requests(&mut state, key, UpdateReason::PeerHave);

    let core = state.peers[&key].backend().core();
    assert_eq!(core.requests.len(), 4);
    for &r in &core.requests {
        assert_eq!(state.layout.piece_of(r), 2);
    }
}

#[test]
fn priority_boost_steers_the_next_requests() {
    let mut state = make_state(4, 64 * 1024);
    let key = add_seed(&mut state, true);
    set_peak(&mut state, key, 2);

    // Raising a piece triggers rescheduling, and the whole window lands
    // on it ahead of lower-priority pieces.
    scheduler::set_piece_priority(&mut state, 2, PiecePriority::Now);
    let core = state.peers[&key].backend().core();
    assert_eq!(core.requests.len(), 4);
    for &r in &core.requests {
        assert_eq!(state.layout.piece_of(r), 2);
    }
}

#[test]
fn skip_priority_cancels_outstanding_requests() {
    let mut state = make_state(2, 64 * 1024);
    let key = add_seed(&mut state, true);
    set_peak(&mut state, key, 64);

    scheduler::update_requests(&mut state, key, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, key), 8);

    scheduler::set_piece_priority(&mut state, 0, PiecePriority::Skip);
    let core = state.peers[&key].backend().core();
    assert_eq!(core.requests.len(), 4);
    for &r in &core.requests {
        assert_eq!(state.layout.piece_of(r), 1);
    }
    assert!(!state.wants_piece(0));
    assert_eq!(state.pending.len(), 4);
}

#[test]
fn released_requests_flow_to_other_peers() {
    let mut state = make_state(1, 64 * 1024);
    let a = add_seed(&mut state, true);
    let b = add_seed(&mut state, true);
    set_peak(&mut state, a, 64);
    set_peak(&mut state, b, 64);

    scheduler::update_requests(&mut state, a, UpdateReason::Unchoke);
    assert_eq!(outstanding(&state, a), 4);

    scheduler::release_peer_requests(&mut state, a);
    assert_eq!(outstanding(&state, a), 0);
    // The release re-evaluated b, which picked the forfeited chunks up.
    assert_eq!(outstanding(&state, b), 4);
    assert_eq!(state.pending.len(), 4);
}
