use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::events::{Hooks, Metrics};
use crate::peer::{handle_message, Message, PeerId, SessionAction};
use crate::piece;
use crate::storage::{MemoryStorage, TorrentStorage};
use crate::swarm::{admit_wire_peer, drop_peer, AdmitError, HandshakeOutcome};
use crate::torrent::{TorrentLayout, TorrentState};

const PIECE_LEN: u32 = 64 * 1024;
const CHUNK: u32 = 16 * 1024;

fn make_state(piece_count: u32, config: Config) -> TorrentState {
    let layout = TorrentLayout {
        piece_count,
        piece_length: PIECE_LEN,
        last_piece_length: PIECE_LEN,
        chunk_size: CHUNK,
    };
    let storage = Arc::new(MemoryStorage::new(piece_count, PIECE_LEN, PIECE_LEN));
    TorrentState::new(
        [7u8; 20],
        layout,
        vec![[0u8; 20]; piece_count as usize],
        Arc::new(config),
        storage,
        Arc::new(Hooks::default()),
        Arc::new(Metrics::default()),
    )
}

fn outcome(addr: &str, id_tag: u8, outgoing: bool) -> HandshakeOutcome {
    let mut id = [b'a'; 20];
    id[19] = id_tag;
    HandshakeOutcome {
        remote_addr: addr.parse().unwrap(),
        local_addr: "192.168.1.2:6881".parse().unwrap(),
        peer_id: PeerId(id),
        fast_enabled: true,
        extension_enabled: false,
        outgoing,
        source: crate::torrent::PeerSource::Tracker,
        trusted: false,
    }
}

#[test]
fn duplicate_address_is_rejected() {
    let mut state = make_state(4, Config::default());
    admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    let err = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 2, true)).unwrap_err();
    assert_eq!(err, AdmitError::DuplicateAddress);
}

#[test]
fn outgoing_connection_replaces_incoming_with_same_id() {
    let mut state = make_state(4, Config::default());
    let incoming = admit_wire_peer(&mut state, outcome("10.0.0.1:50000", 1, false)).unwrap();

    // A second incoming claiming the same id loses.
    let err = admit_wire_peer(&mut state, outcome("10.0.0.2:50001", 1, false)).unwrap_err();
    assert_eq!(err, AdmitError::DuplicatePeerId);
    assert!(state.peers.contains_key(&incoming));

    // Our own dial to that peer wins.
    let dialed = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    assert!(!state.peers.contains_key(&incoming));
    assert!(state.peers.contains_key(&dialed));

    // And an incoming cannot displace the outgoing one.
    let err = admit_wire_peer(&mut state, outcome("10.0.0.3:50002", 1, false)).unwrap_err();
    assert_eq!(err, AdmitError::DuplicatePeerId);
}

#[test]
fn full_table_evicts_a_never_useful_peer() {
    let config = Config {
        max_established_conns: 1,
        ..Config::default()
    };
    let mut state = make_state(4, config);
    let idle = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    state
        .peers
        .get_mut(&idle)
        .unwrap()
        .backend_mut()
        .core_mut()
        .completed_handshake_at = Some(Instant::now() - Duration::from_secs(30));

    let fresh = admit_wire_peer(&mut state, outcome("10.0.0.2:6881", 2, true)).unwrap();
    assert!(!state.peers.contains_key(&idle));
    assert!(state.peers.contains_key(&fresh));
    assert_eq!(Metrics::get(&state.metrics.conns_evicted), 1);
}

#[test]
fn useful_peers_are_not_evicted() {
    let config = Config {
        max_established_conns: 1,
        ..Config::default()
    };
    let mut state = make_state(4, config);
    let useful = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    state
        .peers
        .get_mut(&useful)
        .unwrap()
        .backend_mut()
        .core_mut()
        .last_useful_chunk_at = Some(Instant::now());

    let err = admit_wire_peer(&mut state, outcome("10.0.0.2:6881", 2, true)).unwrap_err();
    assert_eq!(err, AdmitError::AtCapacity);
    assert!(state.peers.contains_key(&useful));
}

#[test]
fn banned_ip_cannot_connect() {
    let mut state = make_state(4, Config::default());
    state.swarm.banned_ips.insert("10.0.0.1".parse().unwrap());
    let err = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap_err();
    assert_eq!(err, AdmitError::Banned);
}

#[test]
fn drop_peer_returns_requests_and_availability() {
    let mut state = make_state(2, Config::default());
    let key = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    handle_message(&mut state, key, Message::HaveAll).unwrap();
    handle_message(&mut state, key, Message::Unchoke).unwrap();
    assert_eq!(state.availability, vec![1, 1]);
    assert!(!state.pending.is_empty());
    assert!(state.swarm.known.contains(&"10.0.0.1:6881".parse::<SocketAddr>().unwrap()));

    drop_peer(&mut state, key, "test");
    assert!(!state.peers.contains_key(&key));
    assert!(state.pending.is_empty());
    assert_eq!(state.availability, vec![0, 0]);
    assert!(!state.swarm.known.contains(&"10.0.0.1:6881".parse::<SocketAddr>().unwrap()));
}

#[test]
fn post_handshake_advertises_inventory() {
    let mut state = make_state(2, Config::default());
    state.storage.mark_complete(0).unwrap();
    state.storage.mark_complete(1).unwrap();
    for piece in 0..2 {
        piece::recheck_completion(&mut state, piece);
    }
    let key = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();

    let session = state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap();
    let bytes = session.writer.take_ready().unwrap();
    // Seeding with the fast extension leads with HaveAll.
    assert_eq!(&bytes[..5], &[0, 0, 0, 1, 14]);
}

/// Downloads one piece end to end: chunks arrive, writes land, the piece
/// hashes, and completion fans out to the other connection.
#[test]
fn piece_completion_fans_out() {
    let piece_data = vec![5u8; PIECE_LEN as usize];
    let hash: [u8; 20] = {
        use sha1::{Digest, Sha1};
        Sha1::digest(&piece_data).into()
    };
    let layout = TorrentLayout {
        piece_count: 1,
        piece_length: PIECE_LEN,
        last_piece_length: PIECE_LEN,
        chunk_size: CHUNK,
    };
    let storage = Arc::new(MemoryStorage::new(1, PIECE_LEN, PIECE_LEN));
    let mut state = TorrentState::new(
        [7u8; 20],
        layout,
        vec![hash],
        Arc::new(Config::default()),
        storage.clone(),
        Arc::new(Hooks::default()),
        Arc::new(Metrics::default()),
    );

    let seed = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    let other = admit_wire_peer(&mut state, outcome("10.0.0.2:6881", 2, true)).unwrap();
    handle_message(&mut state, seed, Message::HaveAll).unwrap();

    // Feed all four chunks through the seed, performing each write job
    // inline the way the connection task would.
    for round in 0..4 {
        handle_message(&mut state, seed, Message::Unchoke).unwrap();
        let requests: Vec<u32> = state.peers[&seed]
            .backend()
            .core()
            .requests
            .iter()
            .copied()
            .collect();
        assert!(!requests.is_empty(), "no requests issued in round {round}");
        for r in requests {
            let block = state.layout.block_ref(r);
            let actions = handle_message(
                &mut state,
                seed,
                Message::Piece {
                    piece: block.piece,
                    offset: block.offset,
                    data: Bytes::from(
                        piece_data[block.offset as usize..(block.offset + block.length) as usize]
                            .to_vec(),
                    ),
                },
            )
            .unwrap();
            for action in actions {
                let SessionAction::Persist(job) = action else {
                    panic!("unexpected action");
                };
                let result = storage.write_at(job.piece, &job.data, job.offset);
                piece::chunk_write_finished(&mut state, job.request, result);
            }
        }
        if state.pieces[0].queued_for_hash {
            break;
        }
    }
    assert!(state.pieces[0].queued_for_hash);

    // Run the hashing steps the way drive_hashing sequences them.
    let piece = piece::next_piece_to_hash(&mut state).unwrap();
    assert_eq!(piece, 0);
    let result = piece::apply_hash_result(&mut state, piece, true, false);
    assert!(result.passed);
    assert!(result.banned.is_none());
    storage.mark_complete(piece).unwrap();
    for key in [seed, other] {
        state.peers.get_mut(&key).unwrap().as_wire_mut().unwrap().writer.take_ready();
    }
    piece::finish_marking(&mut state, piece, true);

    assert!(state.completed.has(0));
    assert_eq!(state.bytes_left(), 0);
    // The non-seeding peer is told about the new piece.
    let session = state.peers.get_mut(&other).unwrap().as_wire_mut().unwrap();
    let bytes = session.writer.take_ready().unwrap();
    assert_eq!(&bytes[..5], &[0, 0, 0, 5, 4]);
    // The seed already claims it; it sees interest withdrawn instead.
    let session = state.peers.get_mut(&seed).unwrap().as_wire_mut().unwrap();
    let bytes = session.writer.take_ready().unwrap();
    assert_eq!(&bytes[..5], &[0, 0, 0, 1, 3]);
}

#[test]
fn attributable_hash_failure_bans_the_contributor() {
    let mut state = make_state(1, Config::default());
    let bad = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    handle_message(&mut state, bad, Message::HaveAll).unwrap();
    handle_message(&mut state, bad, Message::Unchoke).unwrap();

    // Mark the piece fully dirty by this peer, then score it twice so
    // the failure counts (the first hash of a piece never scores).
    for chunk in 0..state.layout.chunk_count(0) {
        state.pieces[0].dirty.set(chunk as usize);
    }
    state.pieces[0].dirtiers.insert(bad);
    state.pieces[0].completion.ok = true;

    let result = piece::apply_hash_result(&mut state, 0, false, false);
    assert!(!result.passed);
    let (banned_key, banned_ip) = result.banned.unwrap();
    assert_eq!(banned_key, bad);
    assert_eq!(banned_ip, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert!(!state.peers.contains_key(&bad));
    assert!(state.is_banned(&banned_ip));
    assert_eq!(Metrics::get(&state.metrics.peers_banned), 1);
    assert_eq!(Metrics::get(&state.metrics.pieces_hashed_bad), 1);

    // The same address never gets back in.
    let err = admit_wire_peer(&mut state, outcome("10.0.0.1:9999", 3, true)).unwrap_err();
    assert_eq!(err, AdmitError::Banned);
}

#[test]
fn trusted_contributors_are_never_banned() {
    let mut state = make_state(1, Config::default());
    let key = admit_wire_peer(&mut state, outcome("10.0.0.1:6881", 1, true)).unwrap();
    state
        .peers
        .get_mut(&key)
        .unwrap()
        .backend_mut()
        .core_mut()
        .trusted = true;
    for chunk in 0..state.layout.chunk_count(0) {
        state.pieces[0].dirty.set(chunk as usize);
    }
    state.pieces[0].dirtiers.insert(key);
    state.pieces[0].completion.ok = true;

    let result = piece::apply_hash_result(&mut state, 0, false, false);
    assert!(result.banned.is_none());
    assert!(state.peers.contains_key(&key));
}
