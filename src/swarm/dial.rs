//! Dialing, handshakes, and the per-connection task set.
//!
//! Each established connection runs three tasks: a read loop decoding
//! frames into the lock-guarded session, a flush loop draining the
//! session's outbound buffer, and a watchdog that re-arms request
//! scheduling and paces PEX.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::events::Metrics;
use crate::peer::{
    self, Handshake, Message, PeerError, PeerReader, PeerTransport, PeerWriteHalf, SessionAction,
};
use crate::pex;
use crate::piece;
use crate::scheduler::{self, UpdateReason};
use crate::swarm::manager::{admit_wire_peer, drop_peer, HandshakeOutcome};
use crate::torrent::{PeerInfo, PeerKey, PeerSource, Shared};

/// Scales the dial timeout down as the reserve backs up behind the
/// half-open limit, so a deep queue of candidates drains faster.
pub fn reduced_dial_timeout(
    nominal: Duration,
    floor: Duration,
    half_open_limit: usize,
    pending_peers: usize,
) -> Duration {
    let limit = half_open_limit.max(1);
    let divisor = ((pending_peers + limit) / limit) as u32;
    let reduced = nominal / divisor.max(1);
    reduced.max(floor)
}

/// Starts dials until a limit binds: per-torrent half-open, global
/// half-open, or the established-connection cap.
pub fn fill_dials(shared: &Shared) {
    let jobs = shared.with_write(|s| {
        let mut jobs = Vec::new();
        if s.closed {
            return jobs;
        }
        loop {
            if s.swarm.half_open.len() >= s.config.torrent_half_open_limit
                || s.swarm.global_half_open.load(Ordering::Relaxed)
                    >= s.config.global_half_open_limit
                || s.peers.len() + s.swarm.half_open.len() >= s.config.max_established_conns
            {
                break;
            }
            let Some(info) = next_candidate(s) else { break };
            s.swarm.half_open.insert(info.addr);
            s.swarm.global_half_open.fetch_add(1, Ordering::Relaxed);
            let timeout = reduced_dial_timeout(
                s.config.nominal_dial_timeout,
                s.config.min_dial_timeout,
                s.config.torrent_half_open_limit,
                s.swarm.reserve.len(),
            );
            jobs.push((info, timeout));
        }
        jobs
    });
    for (info, timeout) in jobs {
        let shared = shared.clone();
        tokio::spawn(async move { dial_peer(shared, info, timeout).await });
    }
}

fn next_candidate(s: &mut crate::torrent::TorrentState) -> Option<PeerInfo> {
    while let Some(info) = s.swarm.reserve.pop() {
        if s.is_banned(&info.addr.ip()) || s.swarm.half_open.contains(&info.addr) {
            continue;
        }
        let connected = s
            .peers
            .values()
            .filter_map(|p| p.as_wire())
            .any(|w| w.core.remote_addr == info.addr);
        if connected {
            continue;
        }
        return Some(info);
    }
    None
}

async fn dial_peer(shared: Shared, info: PeerInfo, dial_timeout: Duration) {
    let connected = tokio::time::timeout(dial_timeout, TcpStream::connect(info.addr)).await;
    shared.with_write(|s| {
        s.swarm.half_open.remove(&info.addr);
        s.swarm.global_half_open.fetch_sub(1, Ordering::Relaxed);
    });
    let stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(addr = %info.addr, %err, "dial failed");
            forget_address(&shared, &info);
            return;
        }
        Err(_) => {
            debug!(addr = %info.addr, "dial timed out");
            forget_address(&shared, &info);
            return;
        }
    };
    if let Err(err) = establish_outgoing(shared.clone(), stream, info.clone()).await {
        debug!(addr = %info.addr, %err, "outgoing connection failed");
        forget_address(&shared, &info);
    }
}

fn forget_address(shared: &Shared, info: &PeerInfo) {
    shared.with_write(|s| {
        s.swarm.known.remove(&info.addr);
        s.swarm.dial_wakeup.notify_one();
    });
}

async fn establish_outgoing(
    shared: Shared,
    stream: TcpStream,
    info: PeerInfo,
) -> Result<(), PeerError> {
    stream.set_nodelay(true).ok();
    let mut transport = PeerTransport::new(stream);
    let (info_hash, local_peer_id, handshake_deadline) = shared.with_read(|s| {
        (
            s.info_hash,
            s.local_peer_id,
            s.config.nominal_dial_timeout,
        )
    });

    transport
        .send_handshake(&Handshake::new(info_hash, *local_peer_id.as_bytes()))
        .await?;
    let theirs = transport.receive_handshake(handshake_deadline).await?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    finish_establish(shared, transport, theirs, true, info.source, info.trusted).await
}

/// Handshakes an inbound connection. We answer only after the remote's
/// info hash checks out.
pub async fn establish_incoming(shared: Shared, stream: TcpStream) -> Result<(), PeerError> {
    stream.set_nodelay(true).ok();
    let mut transport = PeerTransport::new(stream);
    let (info_hash, local_peer_id, handshake_deadline) = shared.with_read(|s| {
        (
            s.info_hash,
            s.local_peer_id,
            s.config.nominal_dial_timeout,
        )
    });

    let theirs = transport.receive_handshake(handshake_deadline).await?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    transport
        .send_handshake(&Handshake::new(info_hash, *local_peer_id.as_bytes()))
        .await?;
    finish_establish(shared, transport, theirs, false, PeerSource::Incoming, false).await
}

async fn finish_establish(
    shared: Shared,
    transport: PeerTransport,
    theirs: Handshake,
    outgoing: bool,
    source: PeerSource,
    trusted: bool,
) -> Result<(), PeerError> {
    let remote_addr = transport.peer_addr()?;
    let local_addr = transport.local_addr()?;
    let peer_id = peer::PeerId::from_bytes(&theirs.peer_id)
        .ok_or(PeerError::InvalidHandshake)?;

    let (fast_enabled, extension_enabled) = shared.with_read(|s| {
        (
            s.config.fast_extension && theirs.supports_fast_extension(),
            s.config.extension_protocol && theirs.supports_extension_protocol(),
        )
    });

    let outcome = HandshakeOutcome {
        remote_addr,
        local_addr,
        peer_id,
        fast_enabled,
        extension_enabled,
        outgoing,
        source,
        trusted,
    };
    let admitted = shared.with_write(|s| admit_wire_peer(s, outcome));
    let key = match admitted {
        Ok(key) => key,
        Err(err) => {
            debug!(addr = %remote_addr, %err, "connection refused");
            return Ok(());
        }
    };

    let (reader, write_half) = transport.into_parts();
    spawn_connection_tasks(shared, key, reader, write_half);
    Ok(())
}

fn spawn_connection_tasks(shared: Shared, key: PeerKey, reader: PeerReader, write_half: PeerWriteHalf) {
    {
        let shared = shared.clone();
        tokio::spawn(async move {
            let reason = match read_loop(&shared, key, reader).await {
                Ok(()) => "connection closed".to_string(),
                Err(err) => err.to_string(),
            };
            shared.with_write(|s| drop_peer(s, key, &reason));
        });
    }
    {
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = write_loop(&shared, key, write_half).await {
                trace!(%key, %err, "write loop ended");
                shared.with_write(|s| drop_peer(s, key, "write failure"));
            }
        });
    }
    tokio::spawn(watchdog_loop(shared, key));
}

async fn read_loop(shared: &Shared, key: PeerKey, mut reader: PeerReader) -> Result<(), PeerError> {
    let (idle, shutdown) = shared.with_read(|s| {
        (
            s.config.read_idle_timeout,
            s.peers
                .get(&key)
                .and_then(|p| p.as_wire())
                .map(|w| w.shutdown_signal()),
        )
    });
    let Some(shutdown) = shutdown else {
        return Ok(());
    };
    loop {
        // Eviction, banning and swarm close must not leave the task
        // parked on the socket until the idle deadline.
        let msg = tokio::select! {
            res = reader.receive_message(idle) => res?,
            _ = shutdown.notified() => return Err(PeerError::ConnectionClosed),
        };
        let actions = shared.with_write(|s| {
            if s.closed || s.peers.get(&key).is_none() {
                return Err(PeerError::ConnectionClosed);
            }
            peer::handle_message(s, key, msg)
        })?;
        for action in actions {
            match action {
                SessionAction::Persist(job) => {
                    let shared = shared.clone();
                    tokio::spawn(async move { piece::persist_chunk(&shared, job).await });
                }
                SessionAction::Serve(block) => {
                    let shared = shared.clone();
                    tokio::spawn(async move { serve_block(&shared, key, block).await });
                }
            }
        }
    }
}

/// Reads a requested block off the lock and queues it for upload, if
/// the request is still live by then.
async fn serve_block(shared: &Shared, key: PeerKey, block: crate::peer::BlockRef) {
    let storage = shared.with_read(|s| s.storage.clone());
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; block.length as usize];
        storage.read_at(block.piece, &mut buf, block.offset)?;
        Ok::<_, crate::storage::StorageError>(buf)
    })
    .await;

    let data = match read {
        Ok(Ok(buf)) => bytes::Bytes::from(buf),
        Ok(Err(err)) => {
            debug!(%key, ?block, %err, "upload read failed");
            // The piece may have vanished from storage underneath us.
            shared.with_write(|s| {
                piece::recheck_completion(s, block.piece);
            });
            return;
        }
        Err(err) => {
            debug!(%key, ?block, %err, "upload read task failed");
            return;
        }
    };

    shared.with_write(|s| {
        let Some(session) = s.peers.get_mut(&key).and_then(|p| p.as_wire_mut()) else {
            return;
        };
        // A Cancel or a choke may have retired the request meanwhile.
        let Some(pos) = session.peer_requests.iter().position(|b| *b == block) else {
            return;
        };
        session.peer_requests.remove(pos);
        session.core.bytes_uploaded += block.length as u64;
        // Bulk lane: our own requests must not sit behind upload data.
        session.writer.write_bulk(&Message::Piece {
            piece: block.piece,
            offset: block.offset,
            data,
        });
    });
}

async fn write_loop(shared: &Shared, key: PeerKey, mut half: PeerWriteHalf) -> Result<(), PeerError> {
    let keepalive = shared.with_read(|s| s.config.keepalive_interval);
    let notify = shared.with_read(|s| {
        s.peers
            .get(&key)
            .and_then(|p| p.as_wire())
            .map(|w| w.writer.notifier())
    });
    let Some(notify) = notify else {
        return Ok(());
    };

    loop {
        let (chunk, closed) = shared.with_write(|s| {
            match s.peers.get_mut(&key).and_then(|p| p.as_wire_mut()) {
                None => (None, true),
                Some(session) => (session.writer.take_ready(), session.writer.is_closed()),
            }
        });
        if let Some(bytes) = chunk {
            half.write_all(&bytes).await?;
            refill_writer(shared, key);
            continue;
        }
        if closed {
            return Ok(());
        }
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(keepalive) => {
                // A connection no longer worth keeping is left to lapse
                // instead of being kept alive.
                if shared.with_read(|s| connection_worth_keeping(s, key)) {
                    half.write_all(&Message::KeepAlive.encode()).await?;
                    shared.with_read(|s| Metrics::bump(&s.metrics.keepalives_sent));
                }
            }
        }
    }
}

fn connection_worth_keeping(s: &crate::torrent::TorrentState, key: PeerKey) -> bool {
    s.peers
        .get(&key)
        .map(|p| {
            let core = p.backend().core();
            core.interested || core.peer_interested || core.last_useful_chunk_at.is_some()
        })
        .unwrap_or(false)
}

/// Drain-triggered refill: once a flush brings the buffer under its low
/// mark, top it up with requests first, then the PEX delta. Upload
/// frames already queue behind both in the writer's bulk lane.
fn refill_writer(shared: &Shared, key: PeerKey) {
    shared.with_write(|s| {
        let below = s
            .peers
            .get(&key)
            .and_then(|p| p.as_wire())
            .map(|w| w.writer.below_low_water())
            .unwrap_or(false);
        if !below {
            return;
        }
        if scheduler::is_low_on_requests(s, key) {
            scheduler::update_requests(s, key, UpdateReason::WriterDrained);
        }
        pex::share_step(s, key);
    });
}

/// Periodic per-peer maintenance: re-arms request scheduling when the
/// peer starves and paces the PEX share step. Also used for webseeds,
/// which have no unchoke events to wake the scheduler.
pub async fn watchdog_loop(shared: Shared, key: PeerKey) {
    let interval = shared.with_read(|s| s.config.request_update_interval);
    let pex_every = (pex::SHARE_INTERVAL.as_secs() / interval.as_secs().max(1)).max(1);
    let mut ticks: u64 = 0;
    loop {
        tokio::time::sleep(interval).await;
        ticks += 1;
        let share_pex = ticks % pex_every == 0;
        let gone = shared.with_write(|s| {
            if s.closed || s.peers.get(&key).is_none() {
                return true;
            }
            if scheduler::is_low_on_requests(s, key) {
                scheduler::update_requests(s, key, UpdateReason::Watchdog);
            }
            if share_pex {
                pex::share_step(s, key);
            }
            false
        });
        if gone {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_timeout_shrinks_under_backlog() {
        let nominal = Duration::from_secs(20);
        let floor = Duration::from_secs(5);
        assert_eq!(reduced_dial_timeout(nominal, floor, 25, 0), nominal);
        assert_eq!(reduced_dial_timeout(nominal, floor, 25, 25), nominal / 2);
        assert_eq!(reduced_dial_timeout(nominal, floor, 25, 75), floor);
        // Never below the floor, no matter the backlog.
        assert_eq!(reduced_dial_timeout(nominal, floor, 25, 100_000), floor);
    }
}
