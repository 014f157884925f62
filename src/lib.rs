//! Client for the Baichuan camera protocol: UDP discovery and NAT traversal, a sequence-numbered
//!  reliable datagram channel, the control message layer with its login handshake, and a
//!  demultiplexer that turns binary video records into an H.264 elementary stream.
//!
//! Layering, bottom-up:
//! * [crypto] checksum and the two XOR ciphers
//! * [transport] one UDP socket per session: discovery, fragmentation, acks and retransmission
//! * [control] message framing, login, per-message binary mode, payload decryption
//! * [media] binary frame records to elementary stream
//! * [camera] the per-camera session runner and its reconnecting supervisor
//! * [registry] named sessions with idle eviction

pub mod camera;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod media;
pub mod registry;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;
