//! Piece verification pipeline.
//!
//! Chunks arrive from peer sessions, get written to storage
//! asynchronously, and once a piece is fully dirty with no writes in
//! flight it queues for hashing. At most
//! [`crate::constants::MAX_ACTIVE_PIECE_HASHES`] pieces hash at a time.
//! Hash results feed back into request scheduling, peer credit/blame,
//! and the completed bitmap.

use std::net::IpAddr;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::events::{Metrics, PieceEvent};
use crate::scheduler::{self, RequestIndex, UpdateReason};
use crate::storage::StorageError;
use crate::swarm;
use crate::torrent::{PeerKey, Shared, TorrentState};

/// What became of a received chunk.
#[derive(Debug)]
pub enum ChunkDisposition {
    /// The chunk dirtied its piece; dispatch this write to storage and
    /// report back via [`chunk_write_finished`].
    Accepted(WriteJob),
    /// Duplicate or no-longer-wanted data; dropped.
    Wasted,
}

#[derive(Debug)]
pub struct WriteJob {
    pub request: RequestIndex,
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// Outcome of applying a hash result under the lock.
#[derive(Debug, Clone, Copy)]
pub struct HashOutcome {
    pub passed: bool,
    /// Contributor banned for an attributable hash failure.
    pub banned: Option<(PeerKey, IpAddr)>,
}

/// Accepts a verified-receive chunk from a peer session.
///
/// Increments `pending_writes` before the caller dispatches the storage
/// write, so hashing cannot start while the write is in flight.
pub fn chunk_received(
    state: &mut TorrentState,
    key: PeerKey,
    r: RequestIndex,
    data: Bytes,
) -> ChunkDisposition {
    let piece = state.layout.piece_of(r);
    let chunk = state.layout.chunk_of(r);
    let p = &mut state.pieces[piece as usize];

    if state.completed.has(piece as usize)
        || p.hashing
        || p.queued_for_hash
        || p.dirty.has(chunk as usize)
    {
        return ChunkDisposition::Wasted;
    }

    p.dirty.set(chunk as usize);
    p.dirtiers.insert(key);
    p.pending_writes += 1;
    ChunkDisposition::Accepted(WriteJob {
        request: r,
        piece,
        offset: chunk * state.layout.chunk_size,
        data,
    })
}

/// Completes an async chunk write.
///
/// A failed write un-pends the chunk (making it requestable again) and,
/// by default, disables further download for the torrent until an
/// operator re-enables it. The last successful write of a fully dirty
/// piece queues it for hashing.
pub fn chunk_write_finished(
    state: &mut TorrentState,
    r: RequestIndex,
    result: Result<(), StorageError>,
) {
    let piece = state.layout.piece_of(r);
    let chunk = state.layout.chunk_of(r);
    let halt = state.config.halt_on_write_error;
    let p = &mut state.pieces[piece as usize];

    debug_assert!(p.pending_writes > 0, "pending_writes underflow");
    p.pending_writes = p.pending_writes.saturating_sub(1);

    match result {
        Ok(()) => {
            Metrics::bump(&state.metrics.chunks_written);
            let p = &state.pieces[piece as usize];
            if p.all_chunks_dirty()
                && p.pending_writes == 0
                && !p.queued_for_hash
                && !p.hashing
                && !state.completed.has(piece as usize)
            {
                queue_for_hash(state, piece);
            }
        }
        Err(err) => {
            warn!(piece, chunk, %err, "chunk write failed");
            p.dirty.clear(chunk as usize);
            if halt {
                state.download_disabled = true;
            }
        }
    }
}

fn queue_for_hash(state: &mut TorrentState, piece: u32) {
    let p = &mut state.pieces[piece as usize];
    debug_assert!(!p.queued_for_hash && !p.hashing);
    p.queued_for_hash = true;
    state.hash_queue.push(piece);
    state.hash_wakeup.notify_one();
}

/// Claims the next piece for hashing if a slot is free.
pub fn next_piece_to_hash(state: &mut TorrentState) -> Option<u32> {
    if state.closed || state.active_piece_hashes >= state.config.max_active_piece_hashes {
        return None;
    }
    let piece = if state.hash_queue.is_empty() {
        return None;
    } else {
        state.hash_queue.remove(0)
    };
    let p = &mut state.pieces[piece as usize];
    p.queued_for_hash = false;
    p.hashing = true;
    state.active_piece_hashes += 1;
    Some(piece)
}

/// Applies a hash result under the lock.
///
/// On success, good-write credit goes to every contributing peer. On an
/// attributable failure (all chunks peer-contributed, hash input read
/// cleanly) the contributors are blamed and the single least-trusted one
/// is banned by IP and dropped. A storage-caused failure clears data
/// without blame.
pub fn apply_hash_result(
    state: &mut TorrentState,
    piece: u32,
    passed: bool,
    read_failed: bool,
) -> HashOutcome {
    let p = &mut state.pieces[piece as usize];
    p.marking = true;
    let dirtiers: Vec<PeerKey> = p.dirtiers.drain().collect();
    let attributable = !passed && !read_failed && state.pieces[piece as usize].all_chunks_dirty();

    // Don't score the first time a piece is hashed, it could be an
    // initial check against pre-existing data.
    let scoring = state.pieces[piece as usize].completion.ok;
    if scoring {
        if passed {
            Metrics::bump(&state.metrics.pieces_hashed_good);
        } else {
            debug!(
                piece,
                contributors = dirtiers.len(),
                "piece failed hash check"
            );
            Metrics::bump(&state.metrics.pieces_hashed_bad);
        }
    }

    let mut banned = None;
    if passed {
        for key in &dirtiers {
            if let Some(peer) = state.peers.get_mut(key) {
                peer.backend_mut().core_mut().pieces_dirtied_good += 1;
            }
        }
    } else if attributable && !dirtiers.is_empty() {
        for key in &dirtiers {
            if let Some(peer) = state.peers.get_mut(key) {
                peer.backend_mut().core_mut().pieces_dirtied_bad += 1;
            }
        }
        if let Some((key, ip)) = least_trusted_contributor(state, &dirtiers) {
            warn!(piece, %key, %ip, "banning least-trusted contributor after hash failure");
            state.swarm.banned_ips.insert(ip);
            Metrics::bump(&state.metrics.peers_banned);
            swarm::drop_peer(state, key, "banned for bad data");
            banned = Some((key, ip));
        }
    }

    let hooks = state.hooks.clone();
    state.defer(move || hooks.piece_hashed.emit(&PieceEvent { piece, passed }));

    HashOutcome { passed, banned }
}

/// Bannable contributor with the worst trust standing: untrusted peers
/// only, lowest net good-piece credit first.
fn least_trusted_contributor(
    state: &TorrentState,
    dirtiers: &[PeerKey],
) -> Option<(PeerKey, IpAddr)> {
    dirtiers
        .iter()
        .filter_map(|&key| {
            let core = state.peers.get(&key)?.backend().core();
            if core.trusted {
                return None;
            }
            let net = core.pieces_dirtied_good as i64 - core.pieces_dirtied_bad as i64;
            Some((net, key, core.remote_addr.ip()))
        })
        .min_by_key(|&(net, key, _)| (net, key))
        .map(|(_, key, ip)| (key, ip))
}

/// Finishes the pipeline after completion status was written to storage
/// (off the lock). Releases the hashing slot and fans out the result.
pub fn finish_marking(state: &mut TorrentState, piece: u32, passed: bool) {
    {
        let p = &mut state.pieces[piece as usize];
        p.marking = false;
        p.hashing = false;
    }
    debug_assert!(state.active_piece_hashes > 0);
    state.active_piece_hashes = state.active_piece_hashes.saturating_sub(1);

    recheck_completion(state, piece);

    if passed && state.completed.has(piece as usize) {
        on_piece_completed(state, piece);
    } else {
        on_incomplete_piece(state, piece);
    }

    // A queued piece may have been waiting for this hashing slot.
    if !state.hash_queue.is_empty() {
        state.hash_wakeup.notify_one();
    }
}

/// Refreshes the cached storage completion for a piece. Returns whether
/// the cache changed.
pub fn recheck_completion(state: &mut TorrentState, piece: u32) -> bool {
    let fresh = state.storage.completion(piece);
    let p = &mut state.pieces[piece as usize];
    let changed = fresh != p.completion;
    p.completion = fresh;
    if fresh.complete && fresh.ok {
        state.completed.set(piece as usize);
    } else {
        state.completed.clear(piece as usize);
    }
    changed
}

/// A piece verified and was durably marked complete: clear its dirty
/// range, drop now-redundant requests, and announce it to every peer.
fn on_piece_completed(state: &mut TorrentState, piece: u32) {
    state.pieces[piece as usize].dirty.clear_all();
    cancel_requests_for_piece(state, piece);

    let keys: Vec<PeerKey> = state.peers.keys().copied().collect();
    for key in keys {
        if let Some(peer) = state.peers.get_mut(&key) {
            if let Some(session) = peer.as_wire_mut() {
                session.send_have(piece);
            }
        }
        scheduler::update_requests(state, key, UpdateReason::PieceCompleted);
    }
}

/// A piece failed verification or lost completion: its chunks return to
/// the requestable pool and peers holding it are re-evaluated.
fn on_incomplete_piece(state: &mut TorrentState, piece: u32) {
    state.pieces[piece as usize].dirty.clear_all();
    if !state.wants_piece(piece) {
        return;
    }
    let keys: Vec<PeerKey> = state.peers.keys().copied().collect();
    for key in keys {
        let claims = state
            .peers
            .get(&key)
            .is_some_and(|p| p.backend().core().claims_piece(piece));
        if claims {
            scheduler::update_requests(state, key, UpdateReason::PieceIncomplete);
        }
    }
}

fn cancel_requests_for_piece(state: &mut TorrentState, piece: u32) {
    let start = state.layout.request_index(piece, 0);
    let end = start + state.layout.chunk_count(piece);
    for r in start..end {
        scheduler::cancel_request(state, r);
    }
}

/// Dispatches one accepted chunk to storage off the lock and reports
/// the outcome back under it.
pub async fn persist_chunk(shared: &Shared, job: WriteJob) {
    let storage = shared.with_read(|s| s.storage.clone());
    let r = job.request;
    let written = tokio::task::spawn_blocking(move || {
        storage.write_at(job.piece, &job.data, job.offset)
    })
    .await;
    let result = match written {
        Ok(inner) => inner,
        Err(err) => Err(StorageError::Io(std::io::Error::other(err))),
    };
    shared.with_write(|s| chunk_write_finished(s, r, result));
}

/// Drains the hash queue: reads and hashes pieces off the lock, then
/// applies results. Returns when no hashing slot or queued piece is
/// available.
pub async fn drive_hashing(shared: &Shared) {
    loop {
        let Some((piece, storage, len, expected)) = shared.with_write(|s| {
            next_piece_to_hash(s).map(|piece| {
                (
                    piece,
                    s.storage.clone(),
                    s.layout.piece_len(piece) as usize,
                    s.pieces[piece as usize].hash,
                )
            })
        }) else {
            return;
        };

        let read_storage = storage.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_storage.read_at(piece, &mut buf, 0)?;
            let digest: [u8; 20] = Sha1::digest(&buf).into();
            Ok::<_, StorageError>(digest)
        })
        .await;

        let (passed, read_failed) = match hashed {
            Ok(Ok(digest)) => (digest == expected, false),
            Ok(Err(err)) => {
                warn!(piece, %err, "failed to read piece for hashing");
                (false, true)
            }
            Err(err) => {
                warn!(piece, %err, "hashing task failed");
                (false, true)
            }
        };

        let outcome = shared.with_write(|s| apply_hash_result(s, piece, passed, read_failed));

        let mark = {
            let storage = storage.clone();
            tokio::task::spawn_blocking(move || {
                if outcome.passed {
                    storage.mark_complete(piece)
                } else {
                    storage.mark_not_complete(piece)
                }
            })
            .await
        };
        if let Ok(Err(err)) = &mark {
            warn!(piece, %err, "failed to mark piece completion");
        }

        shared.with_write(|s| finish_marking(s, piece, outcome.passed));
    }
}
