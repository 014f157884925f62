//! Stateless primitives of the protocol: the datagram checksum for discovery / P2P signaling,
//!  and two XOR obfuscation ciphers. Both ciphers are their own inverse.

mod checksum;
mod xor;

pub use checksum::checksum;
pub use xor::{offset_xor, tid_xor};
