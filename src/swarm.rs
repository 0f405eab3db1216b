//! Connection lifecycle: dialing, admission, eviction, and the swarm
//! engine that ties the torrent's tasks together.

pub mod dial;
pub mod manager;
pub mod priority;
#[cfg(test)]
mod tests;

pub use dial::{establish_incoming, fill_dials, reduced_dial_timeout};
pub use manager::{admit_wire_peer, drop_peer, AdmitError, HandshakeOutcome, Swarm, SwarmState};
pub use priority::bep40_priority;
