//! The control message layer on top of the transport: message headers, the login handshake and
//!  reassembly of fragments into text and binary payloads.

pub mod login;
pub mod message_header;
pub mod messages;
pub mod session;
