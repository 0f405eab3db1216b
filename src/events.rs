//! Observability hooks and engine metrics.
//!
//! Hooks are typed, ordered observer lists invoked synchronously after
//! the torrent lock is released; arguments are never retained past the
//! call. Metrics are plain atomic counters owned by the engine instance,
//! so there is no process-wide mutable state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::peer::PeerId;
use crate::scheduler::RequestIndex;
use crate::torrent::PeerKey;

/// An ordered list of observers for one event kind.
pub struct ObserverList<E> {
    observers: Vec<Box<dyn Fn(&E) + Send + Sync>>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
        }
    }
}

impl<E> ObserverList<E> {
    /// Appends an observer; observers run in subscription order.
    pub fn subscribe(&mut self, f: impl Fn(&E) + Send + Sync + 'static) {
        self.observers.push(Box::new(f));
    }

    pub fn emit(&self, event: &E) {
        for f in &self.observers {
            f(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// A peer joined, completed its handshake, or left.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
}

/// A message was read from a peer.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub key: PeerKey,
    pub message_id: Option<crate::peer::MessageId>,
}

/// A request was sent, satisfied, or deleted.
#[derive(Debug, Clone, Copy)]
pub struct RequestEvent {
    pub key: PeerKey,
    pub request: RequestIndex,
}

/// A piece passed or failed verification.
#[derive(Debug, Clone, Copy)]
pub struct PieceEvent {
    pub piece: u32,
    pub passed: bool,
}

/// All hook points exposed by the engine.
#[derive(Default)]
pub struct Hooks {
    pub handshake_completed: ObserverList<PeerEvent>,
    pub message_read: ObserverList<MessageEvent>,
    pub request_sent: ObserverList<RequestEvent>,
    pub request_satisfied: ObserverList<RequestEvent>,
    pub request_deleted: ObserverList<RequestEvent>,
    pub peer_added: ObserverList<PeerEvent>,
    pub peer_closed: ObserverList<PeerEvent>,
    pub piece_hashed: ObserverList<PieceEvent>,
}

/// Per-engine counters. Cheap to bump under the lock, readable without it.
#[derive(Debug, Default)]
pub struct Metrics {
    pub chunks_received: AtomicU64,
    pub chunks_received_unexpected: AtomicU64,
    pub chunks_written: AtomicU64,
    pub requests_sent: AtomicU64,
    pub requests_stolen: AtomicU64,
    pub invalid_rejects: AtomicU64,
    pub unexpected_cancels: AtomicU64,
    pub pieces_hashed_good: AtomicU64,
    pub pieces_hashed_bad: AtomicU64,
    pub conns_admitted: AtomicU64,
    pub conns_evicted: AtomicU64,
    pub peers_banned: AtomicU64,
    pub keepalives_sent: AtomicU64,
}

impl Metrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn observers_run_in_order() {
        let mut list = ObserverList::<u32>::default();
        let seen = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let seen = seen.clone();
            list.subscribe(move |_| {
                // Each observer requires the previous ones already ran.
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), i);
            });
        }
        list.emit(&7);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
