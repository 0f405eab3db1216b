//! Engine configuration.
//!
//! Runtime-tunable knobs with defaults drawn from [`crate::constants`].
//! Everything here is per-engine; there is no process-wide state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Configuration for a swarm engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum established connections per torrent.
    pub max_established_conns: usize,
    /// Maximum half-open (dialing) connections per torrent.
    pub torrent_half_open_limit: usize,
    /// Global maximum half-open connections.
    pub global_half_open_limit: usize,
    /// Nominal dial timeout; shrinks under half-open contention.
    pub nominal_dial_timeout: Duration,
    /// Floor for the contention-scaled dial timeout.
    pub min_dial_timeout: Duration,
    /// Default outstanding-request cap per peer, before `reqq` override.
    pub peer_max_requests: usize,
    /// Cap on requests a single peer may queue against us.
    pub max_peer_requests: usize,
    /// Extra outstanding requests the beneficiary of a steal may hold
    /// over the victim.
    pub steal_margin: usize,
    /// Sliding read deadline for peer connections.
    pub read_idle_timeout: Duration,
    /// Quiet interval after which a keepalive is injected.
    pub keepalive_interval: Duration,
    /// Starvation watchdog period for request re-evaluation.
    pub request_update_interval: Duration,
    /// Maximum pieces hashing concurrently.
    pub max_active_piece_hashes: usize,
    /// Whether to advertise and honor the fast extension.
    pub fast_extension: bool,
    /// Whether to advertise the extension protocol (and PEX).
    pub extension_protocol: bool,
    /// Cap on unverified bytes outstanding when storage reports capacity.
    pub max_unverified_bytes: u64,
    /// Disable further download for the torrent after a chunk write
    /// fails, pending operator intervention.
    pub halt_on_write_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_established_conns: MAX_ESTABLISHED_CONNS,
            torrent_half_open_limit: TORRENT_HALF_OPEN_LIMIT,
            global_half_open_limit: GLOBAL_HALF_OPEN_LIMIT,
            nominal_dial_timeout: NOMINAL_DIAL_TIMEOUT,
            min_dial_timeout: MIN_DIAL_TIMEOUT,
            peer_max_requests: DEFAULT_PEER_MAX_REQUESTS,
            max_peer_requests: MAX_PEER_REQUESTS,
            steal_margin: DEFAULT_STEAL_MARGIN,
            read_idle_timeout: READ_IDLE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            request_update_interval: REQUEST_UPDATE_INTERVAL,
            max_active_piece_hashes: MAX_ACTIVE_PIECE_HASHES,
            fast_extension: true,
            extension_protocol: true,
            max_unverified_bytes: 64 * 1024 * 1024,
            halt_on_write_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.max_established_conns, MAX_ESTABLISHED_CONNS);
        assert_eq!(cfg.max_active_piece_hashes, 2);
        assert_eq!(cfg.steal_margin, 1);
        assert!(cfg.fast_extension);
    }
}
