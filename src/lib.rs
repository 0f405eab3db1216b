//! rswarm - a BitTorrent swarm engine
//!
//! The downloading core of a BitTorrent client: peer connections,
//! block-level request scheduling, piece verification, and swarm
//! connection management. Metainfo parsing, trackers, and disk layout
//! are the embedding application's business; storage is consumed
//! through the [`storage::TorrentStorage`] trait.
//!
//! # Modules
//!
//! - [`peer`] - BEP-3/6/10 peer wire protocol, fast extension, extension protocol
//! - [`scheduler`] - block request scheduling with single-owner stealing
//! - [`piece`] - piece state and the chunk-write/hash verification pipeline
//! - [`swarm`] - dialing, admission/eviction, and the per-torrent engine
//! - [`pex`] - BEP-11 peer exchange
//! - [`webseed`] - BEP-19 HTTP seeds
//! - [`storage`] - the consumed storage contract
//! - [`events`] - observer hooks and counters

pub mod config;
pub mod constants;
pub mod events;
pub mod peer;
pub mod pex;
pub mod piece;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod webseed;

pub use config::Config;
pub use events::{Hooks, Metrics, PeerEvent, PieceEvent, RequestEvent};
pub use peer::{
    Bitfield, BlockRef, ExtensionHandshake, Handshake, Message, PeerError, PeerId, PeerSession,
};
pub use piece::{Piece, PiecePriority, PieceState};
pub use scheduler::{PendingRequests, RequestIndex, UpdateReason};
pub use storage::{Completion, MemoryStorage, StorageError, TorrentStorage};
pub use swarm::{Swarm, SwarmState};
pub use torrent::{PeerInfo, PeerKey, PeerSource, Shared, TorrentLayout, TorrentState};
pub use webseed::WebseedPeer;
