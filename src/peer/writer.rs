use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::constants::{REQUEST_MSG_LEN, WRITE_BUFFER_HIGH_WATER, WRITE_BUFFER_LOW_WATER};
use crate::peer::message::Message;

/// Per-connection outbound message buffer.
///
/// Sessions append pre-encoded messages under the torrent lock; the
/// connection's flush task is notified and drains the buffer onto the
/// socket off the lock. Control traffic and requests share one lane;
/// upload frames queue in a second lane that only flushes when the
/// first is empty, so a queued block can never delay a request.
pub struct OutboundWriter {
    buf: BytesMut,
    /// Upload frames, one per entry, flushed after everything in `buf`.
    bulk: VecDeque<Bytes>,
    bulk_bytes: usize,
    notify: Arc<Notify>,
    closed: bool,
}

impl OutboundWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(WRITE_BUFFER_LOW_WATER),
            bulk: VecDeque::new(),
            bulk_bytes: 0,
            notify: Arc::new(Notify::new()),
            closed: false,
        }
    }

    /// Handle for the flush task to wait on.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Queues a message. Returns true while the buffer stays below its
    /// high-water mark; callers producing bulk data should stop when it
    /// doesn't.
    pub fn write(&mut self, msg: &Message) -> bool {
        if self.closed {
            return false;
        }
        msg.encode_into(&mut self.buf);
        self.notify.notify_one();
        self.buffered() < WRITE_BUFFER_HIGH_WATER
    }

    /// Queues an upload frame in the bulk lane, behind all control
    /// traffic. Same advisory high-water signal as [`write`].
    ///
    /// [`write`]: OutboundWriter::write
    pub fn write_bulk(&mut self, msg: &Message) -> bool {
        if self.closed {
            return false;
        }
        let mut frame = BytesMut::new();
        msg.encode_into(&mut frame);
        self.bulk_bytes += frame.len();
        self.bulk.push_back(frame.freeze());
        self.notify.notify_one();
        self.buffered() < WRITE_BUFFER_HIGH_WATER
    }

    /// Takes the next batch to flush: all queued control traffic, or one
    /// upload frame once the control lane is empty. None when idle.
    pub fn take_ready(&mut self) -> Option<Bytes> {
        if !self.buf.is_empty() {
            return Some(self.buf.split().freeze());
        }
        let frame = self.bulk.pop_front()?;
        self.bulk_bytes -= frame.len();
        Some(frame)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len() + self.bulk_bytes
    }

    /// True once a flush has brought the buffer under its low-water
    /// mark, which is the signal to top it back up.
    pub fn below_low_water(&self) -> bool {
        self.buffered() < WRITE_BUFFER_LOW_WATER
    }

    /// How many request messages fit before the buffer hits its
    /// high-water mark. The scheduler caps its window with this so a
    /// slow socket applies backpressure to requesting.
    pub fn request_budget(&self) -> usize {
        WRITE_BUFFER_HIGH_WATER.saturating_sub(self.buffered()) / REQUEST_MSG_LEN
    }

    /// Stops accepting writes and wakes the flush task so it can drain
    /// and exit.
    pub fn close(&mut self) {
        self.closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for OutboundWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::BlockRef;

    #[test]
    fn backpressure_kicks_in_at_high_water() {
        let mut w = OutboundWriter::new();
        let block = BlockRef::new(0, 0, 16 * 1024);
        let mut accepted = 0usize;
        while w.write(&Message::Request(block)) {
            accepted += 1;
            assert!(accepted < 10_000, "high-water mark never reached");
        }
        assert!(w.buffered() >= WRITE_BUFFER_HIGH_WATER);
        assert_eq!(w.request_budget(), 0);
    }

    #[test]
    fn take_ready_drains_in_order() {
        let mut w = OutboundWriter::new();
        w.write(&Message::Interested);
        w.write(&Message::Have { piece: 3 });
        let bytes = w.take_ready().unwrap();
        // Interested frame first, then the Have frame.
        assert_eq!(&bytes[..5], &[0, 0, 0, 1, 2]);
        assert_eq!(&bytes[5..10], &[0, 0, 0, 5, 4]);
        assert!(w.take_ready().is_none());
    }

    #[test]
    fn requests_flush_ahead_of_queued_uploads() {
        let mut w = OutboundWriter::new();
        w.write_bulk(&Message::Piece {
            piece: 0,
            offset: 0,
            data: bytes::Bytes::from(vec![0u8; 16 * 1024]),
        });
        w.write(&Message::Request(BlockRef::new(1, 0, 16 * 1024)));

        // The request leaves first even though the upload queued earlier.
        let first = w.take_ready().unwrap();
        assert_eq!(&first[..5], &[0, 0, 0, 13, 6]);
        let second = w.take_ready().unwrap();
        assert_eq!(second[4], 7);
        assert_eq!(second.len(), 4 + 9 + 16 * 1024);
        assert!(w.take_ready().is_none());
        assert_eq!(w.buffered(), 0);
    }
}
