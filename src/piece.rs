//! Per-piece state and the verification pipeline.

mod tracker;

pub use tracker::{
    apply_hash_result, chunk_received, chunk_write_finished, drive_hashing, finish_marking,
    next_piece_to_hash, persist_chunk, recheck_completion, ChunkDisposition, HashOutcome,
    WriteJob,
};

use std::collections::HashSet;

use crate::peer::Bitfield;
use crate::storage::Completion;
use crate::torrent::PeerKey;

/// Download priority of a piece. Reader-driven "now" outranks readahead,
/// which outranks the default; `Skip` excludes a piece entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PiecePriority {
    Skip,
    #[default]
    Normal,
    Readahead,
    Now,
    High,
}

impl PiecePriority {
    pub fn wanted(self) -> bool {
        self != PiecePriority::Skip
    }
}

/// Observable lifecycle position of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Empty,
    PartiallyDirty,
    FullyDirty,
    QueuedForHash,
    Hashing,
    Complete,
}

/// One piece of the torrent.
pub struct Piece {
    pub hash: [u8; 20],
    /// Chunks received but not yet verified.
    pub dirty: Bitfield,
    /// Chunk writes dispatched to storage but not yet finished. Hashing
    /// waits for this to reach zero.
    pub pending_writes: u32,
    pub hashing: bool,
    pub queued_for_hash: bool,
    /// Set while completion status is being written to storage.
    pub marking: bool,
    /// Peers that contributed chunks since the last hash check.
    pub dirtiers: HashSet<PeerKey>,
    pub priority: PiecePriority,
    /// Cached storage completion; `ok` is false until first queried.
    pub completion: Completion,
}

impl Piece {
    pub fn new(chunk_count: u32, hash: [u8; 20]) -> Self {
        Self {
            hash,
            dirty: Bitfield::new(chunk_count as usize),
            pending_writes: 0,
            hashing: false,
            queued_for_hash: false,
            marking: false,
            dirtiers: HashSet::new(),
            priority: PiecePriority::default(),
            completion: Completion::default(),
        }
    }

    pub fn all_chunks_dirty(&self) -> bool {
        self.dirty.is_full()
    }

    pub fn state(&self) -> PieceState {
        if self.completion.complete && self.completion.ok {
            PieceState::Complete
        } else if self.hashing {
            PieceState::Hashing
        } else if self.queued_for_hash {
            PieceState::QueuedForHash
        } else if self.all_chunks_dirty() {
            PieceState::FullyDirty
        } else if self.dirty.is_empty() {
            PieceState::Empty
        } else {
            PieceState::PartiallyDirty
        }
    }
}
