//! The consumed storage contract.
//!
//! The engine never implements a storage backend; it drives one through
//! this narrow per-piece read/write/completion interface. Calls are
//! synchronous and are dispatched off the torrent lock (the hashing and
//! chunk-write paths wrap them in blocking tasks).

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("read/write out of piece bounds: piece {piece}, offset {offset}, len {len}")]
    OutOfBounds { piece: u32, offset: u32, len: usize },

    #[error("storage capacity exhausted")]
    CapacityExhausted,
}

/// Cached answer to "is this piece already complete on disk, and do we
/// trust that answer".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub complete: bool,
    /// False when the backend could not determine completion; complete
    /// is then meaningless.
    pub ok: bool,
}

/// Per-torrent storage, opened by the embedding application.
pub trait TorrentStorage: Send + Sync {
    /// Reads into `buf` starting at `offset` within `piece`. Short reads
    /// are errors at this layer.
    fn read_at(&self, piece: u32, buf: &mut [u8], offset: u32) -> Result<(), StorageError>;

    /// Writes `data` at `offset` within `piece`.
    fn write_at(&self, piece: u32, data: &[u8], offset: u32) -> Result<(), StorageError>;

    /// Durably records that `piece` verified.
    fn mark_complete(&self, piece: u32) -> Result<(), StorageError>;

    /// Records that `piece` failed verification or was invalidated.
    fn mark_not_complete(&self, piece: u32) -> Result<(), StorageError>;

    fn completion(&self, piece: u32) -> Completion;

    /// Remaining capacity in bytes, if the backend can report one. The
    /// scheduler uses this to cap unverified bytes outstanding.
    fn capacity(&self) -> Option<u64> {
        None
    }
}

/// In-memory storage backend, for tests and small swarms.
pub struct MemoryStorage {
    pieces: RwLock<Vec<PieceBuf>>,
    piece_length: u32,
    last_piece_length: u32,
}

struct PieceBuf {
    data: Vec<u8>,
    complete: bool,
}

impl MemoryStorage {
    pub fn new(piece_count: u32, piece_length: u32, last_piece_length: u32) -> Self {
        let pieces = (0..piece_count)
            .map(|i| PieceBuf {
                data: vec![
                    0;
                    if i + 1 == piece_count {
                        last_piece_length as usize
                    } else {
                        piece_length as usize
                    }
                ],
                complete: false,
            })
            .collect();
        Self {
            pieces: RwLock::new(pieces),
            piece_length,
            last_piece_length,
        }
    }

    pub fn piece_length(&self, piece: u32) -> u32 {
        let guard = self.pieces.read();
        if piece as usize + 1 == guard.len() {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    fn check_bounds(
        data_len: usize,
        offset: u32,
        len: usize,
        piece: u32,
    ) -> Result<(), StorageError> {
        if offset as usize + len > data_len {
            return Err(StorageError::OutOfBounds { piece, offset, len });
        }
        Ok(())
    }
}

impl TorrentStorage for MemoryStorage {
    fn read_at(&self, piece: u32, buf: &mut [u8], offset: u32) -> Result<(), StorageError> {
        let guard = self.pieces.read();
        let p = guard
            .get(piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        Self::check_bounds(p.data.len(), offset, buf.len(), piece)?;
        buf.copy_from_slice(&p.data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn write_at(&self, piece: u32, data: &[u8], offset: u32) -> Result<(), StorageError> {
        let mut guard = self.pieces.write();
        let p = guard
            .get_mut(piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        Self::check_bounds(p.data.len(), offset, data.len(), piece)?;
        p.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn mark_complete(&self, piece: u32) -> Result<(), StorageError> {
        let mut guard = self.pieces.write();
        let p = guard
            .get_mut(piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        p.complete = true;
        Ok(())
    }

    fn mark_not_complete(&self, piece: u32) -> Result<(), StorageError> {
        let mut guard = self.pieces.write();
        let p = guard
            .get_mut(piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        p.complete = false;
        Ok(())
    }

    fn completion(&self, piece: u32) -> Completion {
        let guard = self.pieces.read();
        match guard.get(piece as usize) {
            Some(p) => Completion {
                complete: p.complete,
                ok: true,
            },
            None => Completion::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new(2, 32, 16);
        storage.write_at(0, b"hello", 3).unwrap();
        let mut buf = [0u8; 5];
        storage.read_at(0, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"hello");

        assert!(!storage.completion(0).complete);
        storage.mark_complete(0).unwrap();
        let c = storage.completion(0);
        assert!(c.complete && c.ok);
        storage.mark_not_complete(0).unwrap();
        assert!(!storage.completion(0).complete);
    }

    #[test]
    fn memory_storage_bounds() {
        let storage = MemoryStorage::new(2, 32, 16);
        // Last piece is shorter.
        assert!(storage.write_at(1, &[0u8; 32], 0).is_err());
        assert!(storage.write_at(1, &[0u8; 16], 0).is_ok());
        assert!(matches!(
            storage.read_at(5, &mut [0u8; 1], 0),
            Err(StorageError::InvalidPieceIndex(5))
        ));
    }
}
