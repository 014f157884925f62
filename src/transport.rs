//! The UDP layer of a camera session. One [Transport] owns one socket and goes through two phases:
//!
//! * discovery (see [discovery]): find the device on the local network, or through the P2P relays,
//!    and learn the device id and address
//! * a reliable channel: outbound messages are split into sequence-numbered datagrams that are
//!    kept until acknowledged; inbound datagrams are accepted strictly in order and acknowledged
//!    right away
//!
//! Acks are processed inline while receiving, so retransmission only happens as a side effect of
//!  waiting for data from the peer. If the peer goes silent, nothing is re-sent until the next
//!  receive returns; the control layer's periodic pings keep that from stalling a session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::config::SessionConfig;
use crate::error::BaichuanError;
use crate::transport::discovery::TransportState;
use crate::transport::headers::{AckDatagram, DatagramHeader, UdpTag};
use crate::transport::reliable::PendingAcks;
use crate::transport::socket::{Broadcaster, DatagramSocket, DnsRelayResolver, RelayResolver, UdpBroadcaster};

pub mod discovery;
pub mod headers;
pub mod p2p_messages;
pub mod reliable;
pub mod socket;


pub const MAX_DATAGRAM_LEN: usize = 4096;

/// The message-level view of the transport that the control layer works with
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FragmentTransport: Send {
    /// Splits a message into datagrams and sends them in sequence
    async fn send_message(&mut self, message: &[u8]) -> Result<(), BaichuanError>;

    /// Waits for the next in-order datagram and returns its payload
    async fn receive_fragment(&mut self) -> Result<Bytes, BaichuanError>;
}

/// The I/O a transport needs
pub struct TransportIo {
    pub socket: Arc<dyn DatagramSocket>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub resolver: Arc<dyn RelayResolver>,
}
impl TransportIo {
    pub async fn udp(config: &SessionConfig) -> Result<TransportIo, BaichuanError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        debug!("session socket bound to {:?}", socket.local_addr()?);
        Ok(TransportIo {
            socket: Arc::new(socket),
            broadcaster: Arc::new(UdpBroadcaster::new(config.bind_addr.ip())),
            resolver: Arc::new(DnsRelayResolver {}),
        })
    }
}

pub struct Transport {
    config: Arc<SessionConfig>,
    io: TransportIo,

    client_id: u32,
    tid: u32,
    device_id: Option<u32>,
    connection_id: Option<u32>,
    target: Option<SocketAddr>,

    state: TransportState,
    receive_timeout: Duration,
    next_discovery_port: u16,

    next_send_seq: u32,
    last_received_seq: Option<u32>,
    pending_acks: PendingAcks,
}

impl Transport {
    pub fn new(config: Arc<SessionConfig>, io: TransportIo, client_id: u32, tid: u32) -> Transport {
        Transport {
            client_id,
            tid,
            device_id: None,
            connection_id: None,
            target: None,
            state: TransportState::Idle,
            receive_timeout: config.local_receive_timeout,
            next_discovery_port: *config.discovery_source_ports.start(),
            next_send_seq: 0,
            last_received_seq: None,
            pending_acks: PendingAcks::new(config.stale_ack_threshold),
            config,
            io,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn set_receive_timeout(&mut self, receive_timeout: Duration) {
        self.receive_timeout = receive_timeout;
    }

    fn bound_peer(&self) -> Result<(SocketAddr, u32), BaichuanError> {
        match (self.state, self.target, self.device_id) {
            (TransportState::Bound, Some(target), Some(device_id)) => Ok((target, device_id)),
            _ => Err(BaichuanError::Protocol(format!("transport is not bound to a device (state {:?})", self.state))),
        }
    }

    async fn send_ack(&self, target: SocketAddr, device_id: u32, seq: u32) -> Result<(), BaichuanError> {
        let mut buf = BytesMut::with_capacity(AckDatagram::SERIALIZED_LEN);
        AckDatagram {
            connection_id: device_id,
            acked_seq: seq,
        }.ser(&mut buf);
        self.io.socket.send_to(&buf, target).await?;
        Ok(())
    }

    async fn on_ack(&mut self, datagram: &[u8], target: SocketAddr) -> Result<(), BaichuanError> {
        let mut buf = datagram;
        let ack = match AckDatagram::deser(&mut buf) {
            Ok(ack) => ack,
            Err(e) => {
                debug!("dropping malformed ack: {}", e);
                return Ok(());
            }
        };
        if ack.connection_id != self.client_id {
            trace!("ack for client {} rather than {} - ignoring", ack.connection_id, self.client_id);
            return Ok(());
        }

        for datagram in self.pending_acks.on_ack(ack.acked_seq) {
            self.io.socket.send_to(&datagram, target).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FragmentTransport for Transport {
    async fn send_message(&mut self, message: &[u8]) -> Result<(), BaichuanError> {
        let (target, device_id) = self.bound_peer()?;

        for chunk in message.chunks(self.config.max_fragment_len) {
            let seq = self.next_send_seq;

            let mut buf = BytesMut::with_capacity(DatagramHeader::SERIALIZED_LEN + chunk.len());
            DatagramHeader {
                connection_id: device_id,
                seq,
                payload_len: chunk.len() as u32,
            }.ser(&mut buf);
            buf.put_slice(chunk);
            let datagram = buf.freeze();

            self.pending_acks.on_sent(seq, datagram.clone());
            self.io.socket.send_to(&datagram, target).await?;
            self.next_send_seq = seq.wrapping_add(1);
        }
        Ok(())
    }

    async fn receive_fragment(&mut self) -> Result<Bytes, BaichuanError> {
        let (target, device_id) = self.bound_peer()?;

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, _) = match timeout(self.receive_timeout, self.io.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => return Err(BaichuanError::Timeout("a datagram from the device")),
            };
            let datagram = &buf[..len];

            match UdpTag::peek(datagram) {
                Some(UdpTag::Control) => {}
                Some(UdpTag::Ack) => {
                    self.on_ack(datagram, target).await?;
                    continue;
                }
                Some(UdpTag::Discovery) => {
                    info!("received discovery message from camera");
                    continue;
                }
                None => {
                    debug!("dropping datagram with unknown tag ({} bytes)", len);
                    continue;
                }
            }

            let mut parse_buf = datagram;
            let header = match DatagramHeader::deser(&mut parse_buf) {
                Ok(header) => header,
                Err(e) => {
                    debug!("dropping malformed datagram: {}", e);
                    continue;
                }
            };
            if header.connection_id != self.client_id {
                trace!("datagram for client {} rather than {} - ignoring", header.connection_id, self.client_id);
                continue;
            }

            let expected_seq = self.last_received_seq.map_or(0, |seq| seq.wrapping_add(1));
            if header.seq != expected_seq {
                trace!("dropping datagram {} out of sequence, expecting {}", header.seq, expected_seq);
                continue;
            }

            self.last_received_seq = Some(header.seq);
            self.send_ack(target, device_id, header.seq).await?;

            let payload_len = (header.payload_len as usize).min(parse_buf.len());
            return Ok(Bytes::copy_from_slice(&parse_buf[..payload_len]));
        }
    }
}

/// Creates a fresh transport for every connection attempt
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn open(&self, config: Arc<SessionConfig>, client_id: u32, tid: u32) -> Result<Transport, BaichuanError>;
}

pub struct UdpTransportFactory {}

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn open(&self, config: Arc<SessionConfig>, client_id: u32, tid: u32) -> Result<Transport, BaichuanError> {
        let io = TransportIo::udp(&config).await?;
        Ok(Transport::new(config, io, client_id, tid))
    }
}
