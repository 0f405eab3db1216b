use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::config::Config;
use crate::events::{Hooks, Metrics};
use crate::peer::message::{BlockRef, Message};
use crate::peer::{handle_message, PeerCore, PeerError, PeerSession, SessionAction};
use crate::scheduler;
use crate::storage::MemoryStorage;
use crate::torrent::{Peer, PeerKey, PeerSource, TorrentLayout, TorrentState};

const PIECE_LEN: u32 = 64 * 1024;
const CHUNK: u32 = 16 * 1024;

fn make_state(piece_count: u32) -> TorrentState {
    let layout = TorrentLayout {
        piece_count,
        piece_length: PIECE_LEN,
        last_piece_length: PIECE_LEN,
        chunk_size: CHUNK,
    };
    let storage = Arc::new(MemoryStorage::new(piece_count, PIECE_LEN, PIECE_LEN));
    TorrentState::new(
        [3u8; 20],
        layout,
        vec![[0u8; 20]; piece_count as usize],
        Arc::new(Config::default()),
        storage,
        Arc::new(Hooks::default()),
        Arc::new(Metrics::default()),
    )
}

fn add_session(state: &mut TorrentState, fast: bool) -> PeerKey {
    let key = state.alloc_peer_key();
    let addr: SocketAddr = format!("10.1.0.{}:6881", key.0).parse().unwrap();
    let mut core = PeerCore::new(
        key,
        addr,
        PeerSource::Tracker,
        true,
        state.layout.piece_count,
        &state.config,
    );
    core.fast_enabled = fast;
    core.completed_handshake_at = Some(Instant::now());
    state.peers.insert(key, Peer::Wire(PeerSession::new(core)));
    key
}

fn core(state: &TorrentState, key: PeerKey) -> &PeerCore {
    state.peers[&key].backend().core()
}

#[test]
fn have_is_idempotent_for_availability() {
    let mut state = make_state(4);
    let key = add_session(&mut state, false);

    handle_message(&mut state, key, Message::Have { piece: 1 }).unwrap();
    assert_eq!(state.availability[1], 1);
    handle_message(&mut state, key, Message::Have { piece: 1 }).unwrap();
    assert_eq!(state.availability[1], 1);
    assert!(core(&state, key).claims_piece(1));
}

#[test]
fn have_out_of_range_is_a_protocol_error() {
    let mut state = make_state(4);
    let key = add_session(&mut state, false);
    let err = handle_message(&mut state, key, Message::Have { piece: 4 }).unwrap_err();
    assert!(matches!(err, PeerError::ProtocolViolation(_)));
}

#[test]
fn bitfield_with_spare_bits_is_rejected() {
    let mut state = make_state(4);
    let key = add_session(&mut state, false);
    // Four pieces fit one byte; the low nibble is spare.
    let err = handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0xff])))
        .unwrap_err();
    assert!(matches!(err, PeerError::ProtocolViolation(_)));

    handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0xa0]))).unwrap();
    assert!(core(&state, key).claims_piece(0));
    assert!(!core(&state, key).claims_piece(1));
    assert!(core(&state, key).claims_piece(2));
    assert_eq!(state.availability, vec![1, 0, 1, 0]);
}

#[test]
fn fast_messages_require_negotiation() {
    let mut state = make_state(4);
    let key = add_session(&mut state, false);
    let err = handle_message(&mut state, key, Message::HaveAll).unwrap_err();
    assert!(matches!(err, PeerError::FastExtensionDisabled(_)));

    let fast_key = add_session(&mut state, true);
    handle_message(&mut state, fast_key, Message::HaveAll).unwrap();
    assert!(core(&state, fast_key).claims_piece(3));
    assert_eq!(state.availability, vec![1, 1, 1, 1]);
}

#[test]
fn have_none_releases_availability() {
    let mut state = make_state(2);
    let key = add_session(&mut state, true);
    handle_message(&mut state, key, Message::HaveAll).unwrap();
    assert_eq!(state.availability, vec![1, 1]);

    handle_message(&mut state, key, Message::HaveNone).unwrap();
    assert_eq!(state.availability, vec![0, 0]);
    assert!(!core(&state, key).claims_piece(0));
    assert!(!core(&state, key).has_all);
}

#[test]
fn replacement_bitfield_releases_dropped_pieces() {
    let mut state = make_state(4);
    let key = add_session(&mut state, false);
    handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0xf0]))).unwrap();
    assert_eq!(state.availability, vec![1, 1, 1, 1]);

    handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0xc0]))).unwrap();
    assert_eq!(state.availability, vec![1, 1, 0, 0]);
    assert!(core(&state, key).claims_piece(1));
    assert!(!core(&state, key).claims_piece(2));
}

#[test]
fn choke_without_fast_forfeits_outstanding_requests() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0x80]))).unwrap();
    handle_message(&mut state, key, Message::Unchoke).unwrap();
    assert!(!core(&state, key).requests.is_empty());

    handle_message(&mut state, key, Message::Choke).unwrap();
    assert!(core(&state, key).requests.is_empty());
    assert!(state.pending.is_empty());
}

#[test]
fn choke_with_fast_keeps_requests_pending_rejection() {
    let mut state = make_state(1);
    let key = add_session(&mut state, true);
    handle_message(&mut state, key, Message::HaveAll).unwrap();
    handle_message(&mut state, key, Message::Unchoke).unwrap();
    let held: Vec<u32> = core(&state, key).requests.iter().copied().collect();
    assert!(!held.is_empty());

    handle_message(&mut state, key, Message::Choke).unwrap();
    for r in &held {
        assert_eq!(state.pending.owner(*r), Some(key));
    }

    // The remote then rejects one; it leaves the pool.
    let block = state.layout.block_ref(held[0]);
    handle_message(&mut state, key, Message::Reject(block)).unwrap();
    assert_eq!(state.pending.owner(held[0]), None);
}

#[test]
fn reject_for_nothing_outstanding_is_fatal() {
    let mut state = make_state(2);
    let key = add_session(&mut state, true);
    let block = BlockRef::new(1, 0, CHUNK);
    let err = handle_message(&mut state, key, Message::Reject(block)).unwrap_err();
    assert!(matches!(err, PeerError::InvalidReject(_)));
    assert_eq!(Metrics::get(&state.metrics.invalid_rejects), 1);
}

#[test]
fn unrequested_chunk_is_counted_and_dropped() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    let data = Bytes::from(vec![0u8; CHUNK as usize]);
    let actions = handle_message(
        &mut state,
        key,
        Message::Piece {
            piece: 0,
            offset: 0,
            data,
        },
    )
    .unwrap();
    assert!(actions.is_empty());
    assert_eq!(Metrics::get(&state.metrics.chunks_received_unexpected), 1);
    assert!(state.pieces[0].dirty.is_empty());
}

#[test]
fn requested_chunk_flows_into_a_write_job() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    handle_message(&mut state, key, Message::Bitfield(Bytes::from_static(&[0x80]))).unwrap();
    handle_message(&mut state, key, Message::Unchoke).unwrap();
    let r = *core(&state, key).requests.iter().next().unwrap();
    let block = state.layout.block_ref(r);

    let actions = handle_message(
        &mut state,
        key,
        Message::Piece {
            piece: block.piece,
            offset: block.offset,
            data: Bytes::from(vec![9u8; block.length as usize]),
        },
    )
    .unwrap();
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], SessionAction::Persist(job) if job.request == r));
    assert!(state.pieces[0].dirty.has(state.layout.chunk_of(r) as usize));
    assert_eq!(state.pending.owner(r), None);
    assert_eq!(Metrics::get(&state.metrics.chunks_received), 1);
    assert!(core(&state, key).last_useful_chunk_at.is_some());
}

#[test]
fn late_chunk_for_cancelled_request_is_still_valid() {
    let mut state = make_state(1);
    let key = add_session(&mut state, true);
    handle_message(&mut state, key, Message::HaveAll).unwrap();
    handle_message(&mut state, key, Message::Unchoke).unwrap();
    let r = *core(&state, key).requests.iter().next().unwrap();

    scheduler::cancel_peer_request(&mut state, key, r);
    assert!(core(&state, key).cancelled.contains(&r));

    let block = state.layout.block_ref(r);
    let actions = handle_message(
        &mut state,
        key,
        Message::Piece {
            piece: block.piece,
            offset: block.offset,
            data: Bytes::from(vec![1u8; block.length as usize]),
        },
    )
    .unwrap();
    // Data answered the cancel; the cancelled entry retires and the
    // chunk is used.
    assert_eq!(actions.len(), 1);
    assert!(!core(&state, key).cancelled.contains(&r));
    assert_eq!(Metrics::get(&state.metrics.chunks_received), 1);
}

#[test]
fn upload_requires_a_verified_piece() {
    let mut state = make_state(1);
    let key = add_session(&mut state, true);
    {
        let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
        session.core.peer_interested = true;
        session.unchoke();
        session.writer.take_ready();
    }
    let block = BlockRef::new(0, 0, CHUNK);
    let actions = handle_message(&mut state, key, Message::Request(block)).unwrap();
    assert!(actions.is_empty());
    // Fast extension: the refusal is an explicit Reject frame.
    let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
    let bytes = session.writer.take_ready().unwrap();
    assert_eq!(bytes[4], 16);

    // With the piece verified the request queues for upload.
    state.storage.mark_complete(0).unwrap();
    crate::piece::recheck_completion(&mut state, 0);
    let actions = handle_message(&mut state, key, Message::Request(block)).unwrap();
    assert!(matches!(&actions[..], [SessionAction::Serve(b)] if *b == block));
}

#[test]
fn cancel_retires_a_queued_upload() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    state.storage.mark_complete(0).unwrap();
    crate::piece::recheck_completion(&mut state, 0);
    {
        let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
        session.core.peer_interested = true;
        session.unchoke();
    }
    let block = BlockRef::new(0, 0, CHUNK);
    handle_message(&mut state, key, Message::Request(block)).unwrap();
    assert_eq!(
        state.peers[&key].as_wire().unwrap().peer_requests.len(),
        1
    );

    handle_message(&mut state, key, Message::Cancel(block)).unwrap();
    assert!(state.peers[&key].as_wire().unwrap().peer_requests.is_empty());

    // A cancel for nothing we hold is merely counted.
    handle_message(&mut state, key, Message::Cancel(block)).unwrap();
    assert_eq!(Metrics::get(&state.metrics.unexpected_cancels), 1);
}

#[tokio::test]
async fn close_releases_a_parked_read_wait() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    let shutdown = state.peers[&key].as_wire().unwrap().shutdown_signal();

    state.peers.get_mut(&key).unwrap().backend_mut().on_close();
    // The permit outlives the close, so a waiter arriving afterwards
    // returns at once instead of sitting out an idle deadline.
    tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.notified())
        .await
        .expect("shutdown signal was not delivered");
}

#[test]
fn interest_drives_our_choke_state() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    assert!(core(&state, key).choking);

    handle_message(&mut state, key, Message::Interested).unwrap();
    assert!(!core(&state, key).choking);
    assert!(core(&state, key).peer_interested);

    handle_message(&mut state, key, Message::NotInterested).unwrap();
    assert!(core(&state, key).choking);
    assert!(!core(&state, key).peer_interested);
}

#[test]
fn extension_handshake_overrides_request_queue_depth() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    {
        let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
        session.core.extension_enabled = true;
    }
    let mut hs = crate::peer::ExtensionHandshake::new();
    hs.reqq = Some(64);
    hs.m.insert("ut_pex".to_string(), 2);
    let payload = hs.encode().unwrap();

    handle_message(
        &mut state,
        key,
        Message::Extended {
            id: 0,
            payload,
        },
    )
    .unwrap();
    let core = core(&state, key);
    assert_eq!(core.peer_max_requests, 64);
    assert_eq!(core.pex_id, Some(2));
}

#[test]
fn update_after_unchoke_declares_interest_before_requesting() {
    let mut state = make_state(1);
    let key = add_session(&mut state, false);
    // Claim directly so the only update happens at unchoke time.
    {
        let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
        session.core.claimed.set(0);
    }
    state.availability_inc(0);
    handle_message(&mut state, key, Message::Unchoke).unwrap();

    let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
    let bytes = session.writer.take_ready().unwrap();
    // Interested frame, then a request frame.
    assert_eq!(&bytes[..5], &[0, 0, 0, 1, 2]);
    assert_eq!(bytes[8], 13);
    assert_eq!(bytes[9], 6);
}
