use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::runtime::{Builder, Runtime};

use crate::config::SessionConfig;
use crate::control::message_header::{MessageClass, MessageHeader};
use crate::error::BaichuanError;
use crate::media::frame::FrameMagic;
use crate::transport::headers::{AckDatagram, DatagramHeader, DiscoveryDatagram, UdpTag};
use crate::transport::socket::{Broadcaster, DatagramSocket, RelayResolver};
use crate::transport::{FragmentTransport, Transport, TransportIo};


pub const CLIENT_ID: u32 = 0x1234_5678;
pub const DEVICE_ID: u32 = 0x0000_a1b2;
pub const TID: u32 = 1234;
pub const LOCAL_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 50)), 40000);
pub const DEVICE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 20)), 6000);

pub fn paused_runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

pub fn test_config() -> SessionConfig {
    SessionConfig::new("UID", "admin", "secret")
}


enum Inbound {
    Datagram(Vec<u8>, SocketAddr),
    /// the receive call consuming this entry never completes, so the caller's timeout fires
    Silence,
}

/// In-memory stand-in for the session socket: a queue of scripted inbound datagrams, and a
///  record of everything sent. A receive with nothing queued waits forever.
pub struct ScriptedSocket {
    local_addr: SocketAddr,
    inbound: Mutex<VecDeque<Inbound>>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl ScriptedSocket {
    pub fn new() -> ScriptedSocket {
        Self::with_local_addr(LOCAL_ADDR)
    }

    pub fn with_local_addr(local_addr: SocketAddr) -> ScriptedSocket {
        ScriptedSocket {
            local_addr,
            inbound: Default::default(),
            sent: Default::default(),
        }
    }

    pub fn push_inbound(&self, datagram: Vec<u8>, from: SocketAddr) {
        self.inbound.lock().unwrap().push_back(Inbound::Datagram(datagram, from));
    }

    pub fn push_silence(&self) {
        self.inbound.lock().unwrap().push_back(Inbound::Silence);
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatagramSocket for ScriptedSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((buf.to_vec(), to));
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let next = self.inbound.lock().unwrap().pop_front();
        match next {
            Some(Inbound::Datagram(datagram, from)) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), from))
            }
            Some(Inbound::Silence) | None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}


pub struct NoopBroadcaster {}
#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn broadcast(&self, _source_port: u16, _to: SocketAddr, _datagram: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

pub struct UnresolvableRelays {}
#[async_trait]
impl RelayResolver for UnresolvableRelays {
    async fn resolve(&self, _hostname: &str, _port: u16) -> Option<SocketAddr> {
        None
    }
}


pub fn discovery_datagram(xml: &str, tid: u32) -> Vec<u8> {
    DiscoveryDatagram::encode(xml, tid).to_vec()
}

pub fn local_discovery_reply(client_id: u32, device_id: u32) -> Vec<u8> {
    discovery_datagram(&format!("<P2P>\n<D2C_C_R>\n<timer/>\n<rsp>0</rsp>\n<cid>{}</cid>\n<did>{}</did>\n</D2C_C_R>\n</P2P>\n", client_id, device_id), 99)
}

/// a transport datagram as the device sends it
pub fn control_datagram(client_id: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    DatagramHeader {
        connection_id: client_id,
        seq,
        payload_len: payload.len() as u32,
    }.ser(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn ack_datagram(client_id: u32, seq: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    AckDatagram {
        connection_id: client_id,
        acked_seq: seq,
    }.ser(&mut buf);
    buf.to_vec()
}

pub fn is_ack(datagram: &[u8]) -> bool {
    UdpTag::peek(datagram) == Some(UdpTag::Ack)
}

pub fn unbound_transport(socket: Arc<ScriptedSocket>, broadcaster: Arc<dyn Broadcaster>, resolver: Arc<dyn RelayResolver>) -> Transport {
    Transport::new(Arc::new(test_config()), TransportIo {
        socket,
        broadcaster,
        resolver,
    }, CLIENT_ID, TID)
}

/// a transport that finished discovery, talking to [DEVICE_ADDR]
pub fn bound_transport(socket: Arc<ScriptedSocket>) -> Transport {
    let config = test_config();
    let receive_timeout = config.local_receive_timeout;
    let mut transport = unbound_transport(socket, Arc::new(NoopBroadcaster {}), Arc::new(UnresolvableRelays {}));
    transport.bind(DEVICE_ADDR, DEVICE_ID, receive_timeout);
    transport
}


/// Message-level fake for control layer tests: hands out scripted fragments and records sent
///  messages
pub struct ScriptedFragments {
    pub inbound: VecDeque<Bytes>,
    pub sent: Vec<Vec<u8>>,
}

impl ScriptedFragments {
    pub fn new(fragments: Vec<Vec<u8>>) -> ScriptedFragments {
        ScriptedFragments {
            inbound: fragments.into_iter().map(Bytes::from).collect(),
            sent: Vec::new(),
        }
    }
}

#[async_trait]
impl FragmentTransport for ScriptedFragments {
    async fn send_message(&mut self, message: &[u8]) -> Result<(), BaichuanError> {
        self.sent.push(message.to_vec());
        Ok(())
    }

    async fn receive_fragment(&mut self) -> Result<Bytes, BaichuanError> {
        self.inbound.pop_front()
            .ok_or(BaichuanError::Timeout("a scripted fragment"))
    }
}


/// a binary video record as the device sends it
pub fn video_record(magic: FrameMagic, codec: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(magic.into());
    buf.put_u32_le(codec);
    buf.put_u32_le(payload.len() as u32);
    buf.put_bytes(0, 12);
    if magic == FrameMagic::IFrame {
        buf.put_u32_le(1_700_000_000);
        buf.put_u32_le(0);
    }
    buf.put_slice(payload);
    buf.to_vec()
}

/// a control message as the device sends it, header and payload
pub fn control_message(message_id: u32, class: MessageClass, encryption_offset: u32, encrypted: bool, bin_offset: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    MessageHeader {
        message_id,
        message_len: payload.len() as u32,
        encryption_offset,
        encrypted,
        unknown: 0,
        class,
        bin_offset,
    }.ser(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}
