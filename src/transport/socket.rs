use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};


/// The session's UDP socket, abstracted to keep the I/O out of protocol tests
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        UdpSocket::send_to(self, buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}


/// Local discovery sends each attempt from a fresh broadcast-enabled socket with its own source
///  port, while replies arrive at the session socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    async fn broadcast(&self, source_port: u16, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

pub struct UdpBroadcaster {
    bind_ip: IpAddr,
}
impl UdpBroadcaster {
    pub fn new(bind_ip: IpAddr) -> UdpBroadcaster {
        UdpBroadcaster { bind_ip }
    }
}

#[async_trait]
impl Broadcaster for UdpBroadcaster {
    async fn broadcast(&self, source_port: u16, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, source_port)).await?;
        socket.set_broadcast(true)?;
        socket.send_to(datagram, to).await?;
        Ok(())
    }
}


/// DNS lookup for the relay host names
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayResolver: Send + Sync + 'static {
    /// `None` if the host does not resolve to an IPv4 address
    async fn resolve(&self, hostname: &str, port: u16) -> Option<SocketAddr>;
}

pub struct DnsRelayResolver {}

#[async_trait]
impl RelayResolver for DnsRelayResolver {
    async fn resolve(&self, hostname: &str, port: u16) -> Option<SocketAddr> {
        match lookup_host((hostname, port)).await {
            Ok(mut addrs) => addrs.find(|a| a.is_ipv4()),
            Err(e) => {
                debug!("relay host {} does not resolve: {}", hostname, e);
                None
            }
        }
    }
}


/// The local address the OS routes traffic to `peer` from. A connected UDP socket sends nothing,
///  but fixes the outgoing interface.
pub async fn outbound_ip(peer: SocketAddr) -> io::Result<IpAddr> {
    let probe = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    probe.connect(peer).await?;
    Ok(probe.local_addr()?.ip())
}
