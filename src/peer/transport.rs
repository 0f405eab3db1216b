use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, WRITE_TIMEOUT};

/// A whole-stream transport used during the handshake phase. Once the
/// handshake completes it splits into an owned reader and writer so the
/// read loop and the flush task can run concurrently.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.local_addr()
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self, deadline: Duration) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(deadline, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Splits into the message reader and the raw write half. Bytes
    /// already buffered past the handshake stay with the reader.
    pub fn into_parts(self) -> (PeerReader, PeerWriteHalf) {
        let (read, write) = self.stream.into_split();
        (
            PeerReader {
                read,
                read_buf: self.read_buf,
            },
            PeerWriteHalf { write },
        )
    }
}

/// The read side of an established connection. Reads are bounded by the
/// caller-supplied deadline so the session's sliding idle window stays
/// in control of liveness.
pub struct PeerReader {
    read: OwnedReadHalf,
    read_buf: BytesMut,
}

impl PeerReader {
    async fn fill(&mut self, target: usize, deadline: Duration) -> Result<(), PeerError> {
        while self.read_buf.len() < target {
            let n = timeout(deadline, self.read.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reads one length-prefixed frame.
    pub async fn receive_message(&mut self, deadline: Duration) -> Result<Message, PeerError> {
        self.fill(4, deadline).await?;
        let length = u32::from_be_bytes(self.read_buf[..4].try_into().unwrap()) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::ProtocolViolation(format!(
                "frame too large: {length}"
            )));
        }
        self.fill(4 + length, deadline).await?;
        let data = self.read_buf.split_to(4 + length);
        Message::decode(data.freeze())
    }
}

/// The write side; the flush task drains pre-encoded bytes through it.
pub struct PeerWriteHalf {
    write: OwnedWriteHalf,
}

impl PeerWriteHalf {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.write.write_all(data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
