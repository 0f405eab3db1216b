//! Protocol constants and tuning parameters.
//!
//! Timeouts, buffer sizes, protocol values and scheduler knobs used
//! throughout the swarm engine. Values follow the defaults of mature
//! clients (libtorrent, qBittorrent, Transmission) unless noted.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-RS0001-";

/// Client version string advertised in the extension handshake
pub const CLIENT_VERSION: &str = "rswarm/0.1.0";

// ============================================================================
// Wire protocol
// ============================================================================

/// BitTorrent protocol identifier sent in the handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total handshake length: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Extension protocol bit (BEP-10), reserved byte 5
pub const EXTENSION_BIT: u8 = 0x10;

/// Fast extension bit (BEP-6), reserved byte 7
pub const FAST_EXTENSION_BIT: u8 = 0x04;

/// DHT support bit (BEP-5), reserved byte 7
pub const DHT_BIT: u8 = 0x01;

/// Upper bound on a single wire message, guards the read path
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

// ============================================================================
// Chunks and requests
// ============================================================================

/// Standard block (chunk) size requested over the wire
pub const CHUNK_SIZE: u32 = 16 * 1024;

/// Default cap on requests outstanding to a single peer, overridden by
/// the peer's advertised `reqq`
pub const DEFAULT_PEER_MAX_REQUESTS: usize = 250;

/// Cap on requests a single peer may queue against us
pub const MAX_PEER_REQUESTS: usize = 256;

/// Size of the BEP-6 allowed-fast set we generate for each peer
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

// ============================================================================
// Outbound writer
// ============================================================================

/// Write buffer high water mark; `write` reports backpressure above this
pub const WRITE_BUFFER_HIGH_WATER: usize = 32 * 1024;

/// Write buffer low water mark; the buffer is refilled below this
pub const WRITE_BUFFER_LOW_WATER: usize = 16 * 1024;

/// Encoded length of a Request message (4 length + 1 id + 12 body)
pub const REQUEST_MSG_LEN: usize = 17;

// ============================================================================
// Timeouts and liveness
// ============================================================================

/// Sliding read deadline; silence beyond this closes the connection
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(150);

/// Quiet interval after which a keepalive is injected
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Write timeout for a single flush to the transport
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Starvation watchdog period for per-peer request re-evaluation
pub const REQUEST_UPDATE_INTERVAL: Duration = Duration::from_secs(3);

// ============================================================================
// Hashing pipeline
// ============================================================================

/// Maximum pieces hashing concurrently, torrent-wide
pub const MAX_ACTIVE_PIECE_HASHES: usize = 2;

// ============================================================================
// Connections
// ============================================================================

/// Default cap on established connections per torrent
pub const MAX_ESTABLISHED_CONNS: usize = 50;

/// Default cap on half-open (dialing) connections per torrent
pub const TORRENT_HALF_OPEN_LIMIT: usize = 25;

/// Default global cap on half-open connections
pub const GLOBAL_HALF_OPEN_LIMIT: usize = 100;

/// Nominal dial timeout before contention scaling
pub const NOMINAL_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Floor for the contention-scaled dial timeout
pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Scheduler fairness
// ============================================================================

/// A request may be stolen from another peer when the beneficiary would
/// end up with at most this many more outstanding requests than the victim
pub const DEFAULT_STEAL_MARGIN: usize = 1;

// ============================================================================
// PEX
// ============================================================================

/// ut_pex extension message ID we advertise
pub const UT_PEX_ID: u8 = 1;

/// Maximum added peers per PEX flush
pub const PEX_MAX_ADDED: usize = 50;

// ============================================================================
// Webseed
// ============================================================================

/// Connect timeout for webseed HTTP requests
pub const WEBSEED_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout for webseed HTTP requests
pub const WEBSEED_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Concurrent range requests per webseed
pub const WEBSEED_MAX_REQUESTS: usize = 16;
