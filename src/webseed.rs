//! HTTP webseed peers (BEP-19).
//!
//! A webseed behaves like a peer that always has every piece and never
//! chokes. Requests queue on the backend and an async driver satisfies
//! them with HTTP range requests, feeding the results through the same
//! chunk pipeline as wire peers.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::constants::{WEBSEED_CONNECT_TIMEOUT, WEBSEED_MAX_REQUESTS, WEBSEED_READ_TIMEOUT};
use crate::events::{Metrics, RequestEvent};
use crate::peer::{BlockRef, PeerBackend, PeerCore};
use crate::piece::{self, ChunkDisposition, WriteJob};
use crate::scheduler::{self, RequestIndex, UpdateReason};
use crate::torrent::{PeerKey, Shared, TorrentState};

/// Pause after a failed fetch before the scheduler retries the webseed.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// A single-URL webseed serving the torrent's content as one contiguous
/// byte range.
pub struct WebseedPeer {
    pub core: PeerCore,
    pub url: String,
    queue: VecDeque<BlockRef>,
    wake: Arc<Notify>,
}

impl WebseedPeer {
    pub fn new(mut core: PeerCore, url: String) -> Self {
        // A webseed is a full, never-choking source we opted into.
        core.has_all = true;
        core.peer_choking = false;
        core.trusted = true;
        core.peer_max_requests = WEBSEED_MAX_REQUESTS;
        Self {
            core,
            url,
            queue: VecDeque::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Placeholder address for the core; webseeds have no socket.
    pub fn placeholder_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

impl PeerBackend for WebseedPeer {
    fn core(&self) -> &PeerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeerCore {
        &mut self.core
    }

    fn issue_request(&mut self, block: BlockRef) {
        self.queue.push_back(block);
        self.wake.notify_one();
    }

    fn cancel_request(&mut self, block: BlockRef) -> bool {
        // Still-queued fetches can be dropped; in-flight ones complete
        // and land as late valid chunks. No acknowledgement either way.
        if let Some(pos) = self.queue.iter().position(|b| *b == block) {
            self.queue.remove(pos);
        }
        false
    }

    fn declare_interest(&mut self, interested: bool) {
        self.core.interested = interested;
    }

    fn writable_request_budget(&self) -> usize {
        WEBSEED_MAX_REQUESTS
    }

    fn on_close(&mut self) {
        self.core.closed = true;
        self.queue.clear();
        self.wake.notify_one();
    }
}

enum Next {
    Fetch(BlockRef, String),
    Idle(Arc<Notify>),
    Gone,
}

fn next_block(state: &mut TorrentState, key: PeerKey) -> Next {
    if state.closed {
        return Next::Gone;
    }
    let Some(ws) = state.peers.get_mut(&key).and_then(|p| match p {
        crate::torrent::Peer::Webseed(w) => Some(w),
        _ => None,
    }) else {
        return Next::Gone;
    };
    if ws.core.closed {
        return Next::Gone;
    }
    match ws.queue.pop_front() {
        Some(block) => Next::Fetch(block, ws.url.clone()),
        None => Next::Idle(ws.wake.clone()),
    }
}

/// Drives one webseed: pops queued blocks, fetches them over HTTP, and
/// feeds the data through the chunk pipeline. Returns when the peer is
/// dropped or the torrent closes.
pub async fn drive_webseed(shared: Shared, key: PeerKey) {
    let client = match reqwest::Client::builder()
        .connect_timeout(WEBSEED_CONNECT_TIMEOUT)
        .timeout(WEBSEED_READ_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            warn!(%key, %err, "failed to build webseed client");
            shared.with_write(|s| crate::swarm::drop_peer(s, key, "webseed client error"));
            return;
        }
    };

    loop {
        let next = shared.with_write(|s| next_block(s, key));
        let (block, url) = match next {
            Next::Gone => return,
            Next::Idle(wake) => {
                wake.notified().await;
                continue;
            }
            Next::Fetch(block, url) => (block, url),
        };

        match fetch_block(&client, &url, &shared, block).await {
            Ok(data) => {
                if let Some(job) = shared.with_write(|s| accept_chunk(s, key, block, data)) {
                    piece::persist_chunk(&shared, job).await;
                }
            }
            Err(err) => {
                debug!(%key, ?block, %err, "webseed fetch failed");
                shared.with_write(|s| {
                    if let Some(r) = s.layout.request_index_of(&block) {
                        scheduler::delete_request(s, key, r);
                    }
                });
                tokio::time::sleep(FAILURE_BACKOFF).await;
            }
        }
    }
}

async fn fetch_block(
    client: &reqwest::Client,
    url: &str,
    shared: &Shared,
    block: BlockRef,
) -> Result<Bytes, String> {
    let start = shared.with_read(|s| {
        s.layout.piece_length as u64 * block.piece as u64 + block.offset as u64
    });
    let end = start + block.length as u64 - 1;

    let resp = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(format!("unexpected status {}", resp.status()));
    }
    let body = resp.bytes().await.map_err(|e| e.to_string())?;
    if body.len() != block.length as usize {
        return Err(format!(
            "range length mismatch: wanted {}, got {}",
            block.length,
            body.len()
        ));
    }
    Ok(body)
}

/// Books a fetched block in the same way a wire chunk is booked.
fn accept_chunk(
    state: &mut TorrentState,
    key: PeerKey,
    block: BlockRef,
    data: Bytes,
) -> Option<WriteJob> {
    let Some(r) = state.layout.request_index_of(&block) else {
        return None;
    };
    let consumed = consume_valid_receive(state, key, r, data.len() as u64);
    if !consumed {
        Metrics::bump(&state.metrics.chunks_received_unexpected);
        return None;
    }
    Metrics::bump(&state.metrics.chunks_received);

    let was_ours = state
        .peers
        .get(&key)
        .map(|p| {
            let core = p.backend().core();
            core.requests.contains(&r) || core.cancelled.contains(&r)
        })
        .unwrap_or(false);
    if was_ours {
        scheduler::delete_request(state, key, r);
        let hooks = state.hooks.clone();
        state.defer(move || hooks.request_satisfied.emit(&RequestEvent { key, request: r }));
    }

    match piece::chunk_received(state, key, r, data) {
        ChunkDisposition::Accepted(job) => Some(job),
        ChunkDisposition::Wasted => {
            // Keep the scheduler moving; webseeds have no unchoke
            // events to retrigger it.
            scheduler::update_requests(state, key, UpdateReason::Watchdog);
            None
        }
    }
}

fn consume_valid_receive(
    state: &mut TorrentState,
    key: PeerKey,
    r: RequestIndex,
    len: u64,
) -> bool {
    let Some(peer) = state.peers.get_mut(&key) else {
        return false;
    };
    let core = peer.backend_mut().core_mut();
    core.bytes_downloaded += len;
    match core.valid_receive_chunks.get_mut(&r) {
        Some(n) if *n > 0 => {
            *n -= 1;
            if *n == 0 {
                core.valid_receive_chunks.remove(&r);
            }
            core.last_useful_chunk_at = Some(std::time::Instant::now());
            true
        }
        _ => false,
    }
}
