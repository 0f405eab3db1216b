//! Wire-protocol peers: framing, handshakes, per-connection state, and
//! the buffered outbound path.

pub mod backend;
pub mod bitfield;
pub mod error;
pub mod extension;
pub mod fast;
pub mod message;
pub mod peer_id;
pub mod session;
pub mod transport;
pub mod writer;
#[cfg(test)]
mod tests;

pub use backend::{PeerBackend, PeerCore};
pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::ExtensionHandshake;
pub use fast::{default_allowed_fast_set, generate_allowed_fast_set, FastState};
pub use message::{BlockRef, Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use session::{handle_message, PeerSession, SessionAction};
pub use transport::{PeerReader, PeerTransport, PeerWriteHalf};
pub use writer::OutboundWriter;
