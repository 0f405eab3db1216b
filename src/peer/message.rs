use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::constants::{
    DHT_BIT, EXTENSION_BIT, FAST_EXTENSION_BIT, HANDSHAKE_LEN, PROTOCOL_STRING,
};

/// A `(piece, offset, length)` triple as carried by Request, Cancel and
/// Reject messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRef {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl MessageId {
    /// True for the message ids introduced by the fast extension.
    pub fn requires_fast_extension(self) -> bool {
        matches!(
            self,
            MessageId::Suggest
                | MessageId::HaveAll
                | MessageId::HaveNone
                | MessageId::Reject
                | MessageId::AllowedFast
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(PeerError::UnknownMessageId(other)),
        })
    }
}

/// The fixed 68-byte connection preamble.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Builds our side of the handshake, advertising the extension
    /// protocol and the fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_BIT;
        reserved[7] |= FAST_EXTENSION_BIT;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL_STRING.len()
            || &data[1..20] != PROTOCOL_STRING
        {
            return Err(PeerError::InvalidHandshake);
        }
        let mut hs = Self {
            info_hash: [0; 20],
            peer_id: [0; 20],
            reserved: [0; 8],
        };
        hs.reserved.copy_from_slice(&data[20..28]);
        hs.info_hash.copy_from_slice(&data[28..48]);
        hs.peer_id.copy_from_slice(&data[48..68]);
        Ok(hs)
    }
}

/// A post-handshake wire message. A zero-length frame is a keepalive.
#[derive(Debug, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockRef),
    Piece { piece: u32, offset: u32, data: Bytes },
    Cancel(BlockRef),
    Port(u16),
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject(BlockRef),
    AllowedFast { piece: u32 },
    // Extension protocol
    Extended { id: u8, payload: Bytes },
}

fn put_header(buf: &mut BytesMut, body_len: u32, id: MessageId) {
    buf.put_u32(1 + body_len);
    buf.put_u8(id as u8);
}

fn put_block_ref(buf: &mut BytesMut, id: MessageId, r: &BlockRef) {
    put_header(buf, 12, id);
    buf.put_u32(r.piece);
    buf.put_u32(r.offset);
    buf.put_u32(r.length);
}

impl Message {
    /// The message id, or `None` for keepalives.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject(_) => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded message to `buf` without intermediate
    /// allocation, for the buffered writer path.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(buf, 0, MessageId::Choke),
            Message::Unchoke => put_header(buf, 0, MessageId::Unchoke),
            Message::Interested => put_header(buf, 0, MessageId::Interested),
            Message::NotInterested => put_header(buf, 0, MessageId::NotInterested),
            Message::Have { piece } => {
                put_header(buf, 4, MessageId::Have);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                put_header(buf, bits.len() as u32, MessageId::Bitfield);
                buf.put_slice(bits);
            }
            Message::Request(r) => put_block_ref(buf, MessageId::Request, r),
            Message::Piece {
                piece,
                offset,
                data,
            } => {
                put_header(buf, 8 + data.len() as u32, MessageId::Piece);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Cancel(r) => put_block_ref(buf, MessageId::Cancel, r),
            Message::Port(port) => {
                put_header(buf, 2, MessageId::Port);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => {
                put_header(buf, 4, MessageId::Suggest);
                buf.put_u32(*piece);
            }
            Message::HaveAll => put_header(buf, 0, MessageId::HaveAll),
            Message::HaveNone => put_header(buf, 0, MessageId::HaveNone),
            Message::Reject(r) => put_block_ref(buf, MessageId::Reject, r),
            Message::AllowedFast { piece } => {
                put_header(buf, 4, MessageId::AllowedFast);
                buf.put_u32(*piece);
            }
            Message::Extended { id, payload } => {
                put_header(buf, 1 + payload.len() as u32, MessageId::Extended);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    /// Decodes one length-prefixed frame.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::ProtocolViolation("frame too short".into()));
        }
        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::ProtocolViolation("incomplete frame".into()));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let body = length - 1;

        let need = |n: usize| {
            if body < n {
                Err(PeerError::ProtocolViolation(format!(
                    "{:?} body too short: {} < {}",
                    id, body, n
                )))
            } else {
                Ok(())
            }
        };
        let block_ref = |data: &mut Bytes| -> Result<BlockRef, PeerError> {
            need(12)?;
            Ok(BlockRef {
                piece: data.get_u32(),
                offset: data.get_u32(),
                length: data.get_u32(),
            })
        };

        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4)?;
                Message::Have {
                    piece: data.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(data.copy_to_bytes(body)),
            MessageId::Request => Message::Request(block_ref(&mut data)?),
            MessageId::Piece => {
                need(8)?;
                let piece = data.get_u32();
                let offset = data.get_u32();
                Message::Piece {
                    piece,
                    offset,
                    data: data.copy_to_bytes(body - 8),
                }
            }
            MessageId::Cancel => Message::Cancel(block_ref(&mut data)?),
            MessageId::Port => {
                need(2)?;
                Message::Port(data.get_u16())
            }
            MessageId::Suggest => {
                need(4)?;
                Message::Suggest {
                    piece: data.get_u32(),
                }
            }
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Reject => Message::Reject(block_ref(&mut data)?),
            MessageId::AllowedFast => {
                need(4)?;
                Message::AllowedFast {
                    piece: data.get_u32(),
                }
            }
            MessageId::Extended => {
                need(1)?;
                Message::Extended {
                    id: data.get_u8(),
                    payload: data.copy_to_bytes(body - 1),
                }
            }
        })
    }
}
