//! Finding the device and learning its ids and address.
//!
//! Local discovery broadcasts `C2D_C` to the subnet (or sends it to the configured target ip)
//!  and waits for a `D2C_C_R` that echoes this session's client id. If that fails and no target
//!  ip is configured, the P2P relays are tried:
//!
//! ```ascii
//!  client                      relay                 register / log / endpoint        device
//!    | --- C2M_Q ------------->  |                          |                           |
//!    | <-- M2C_Q_R (addresses) - |                          |                           |
//!    | --- C2R_C (repeated) ---------------------------->   |                           |
//!    | <-- R2C_T (device address, connection id) ------     |                           |
//!    | --- C2D_T local ----------------------------------------------------------------> |
//!    | <-- D2C_T / D2C_CFM (device id) ------------------------------------------------  |
//!    | --- C2R_CFM --------------------------------------> log                           |
//!    | --- C2D_T map ------------------------------------> endpoint                      |
//! ```
//!
//! P2P setup is complete once both the device id and the device address are known.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::BaichuanError;
use crate::transport::headers::DiscoveryDatagram;
use crate::transport::p2p_messages::{P2pReply, P2pRequest, RelayAddresses};
use crate::transport::socket::outbound_ip;
use crate::transport::{Transport, MAX_DATAGRAM_LEN};


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportState {
    Idle,
    LocalDiscovering,
    P2PQuerying,
    P2PRegistering,
    P2PConnecting,
    Bound,
    /// terminal: this connection attempt failed
    Unreachable,
}

impl Transport {
    /// Runs local discovery and, if necessary, P2P discovery. On success the transport is
    ///  [TransportState::Bound] to the device.
    pub async fn discover(&mut self) -> Result<(), BaichuanError> {
        self.state = TransportState::LocalDiscovering;
        if let Some((peer, device_id)) = self.discover_local().await? {
            self.bind(peer, device_id, self.config.local_receive_timeout);
            return Ok(());
        }

        if self.config.target_ip.is_some() {
            info!("skipping P2P discovery because a target address is configured - local discovery only");
            self.state = TransportState::Unreachable;
            return Err(BaichuanError::Unreachable(self.config.device_uid.clone()));
        }

        match self.discover_p2p().await {
            Ok((peer, device_id)) => {
                self.bind(peer, device_id, self.config.p2p_receive_timeout);
                Ok(())
            }
            Err(e) => {
                self.state = TransportState::Unreachable;
                Err(e)
            }
        }
    }

    pub(crate) fn bind(&mut self, peer: SocketAddr, device_id: u32, receive_timeout: Duration) {
        info!("bound to device {} at {}", device_id, peer);
        self.device_id = Some(device_id);
        self.target = Some(peer);
        self.receive_timeout = receive_timeout;
        self.state = TransportState::Bound;
    }

    fn take_discovery_port(&mut self) -> u16 {
        let port = self.next_discovery_port;
        self.next_discovery_port = if port >= *self.config.discovery_source_ports.end() {
            *self.config.discovery_source_ports.start()
        }
        else {
            port + 1
        };
        port
    }

    async fn send_signaling(&self, request: P2pRequest<'_>, to: SocketAddr) -> Result<(), BaichuanError> {
        trace!("sending {:?} to {}", request, to);
        let datagram = DiscoveryDatagram::encode(&request.to_xml(), self.tid);
        self.io.socket.send_to(&datagram, to).await?;
        Ok(())
    }

    /// Waits up to `wait` for a single signaling datagram. Timeouts, damaged datagrams and
    ///  messages that do not parse all yield `None`.
    async fn recv_signaling(&self, wait: Duration) -> Option<(P2pReply, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let (len, sender) = match timeout(wait, self.io.socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!("error receiving discovery reply: {}", e);
                return None;
            }
            Err(_) => {
                trace!("no discovery reply within {:?}", wait);
                return None;
            }
        };

        let xml = match DiscoveryDatagram::decode(&buf[..len]) {
            Ok(Some(xml)) => xml,
            Ok(None) => {
                debug!("ignoring non-discovery datagram from {} during discovery", sender);
                return None;
            }
            Err(e) => {
                warn!("discarding discovery datagram from {}: {}", sender, e);
                return None;
            }
        };

        match P2pReply::parse(&xml) {
            Ok(reply) => Some((reply, sender)),
            Err(e) => {
                debug!("ignoring signaling message from {}: {}", sender, e);
                None
            }
        }
    }

    async fn discover_local(&mut self) -> Result<Option<(SocketAddr, u32)>, BaichuanError> {
        let destination = match self.config.target_ip {
            Some(ip) => SocketAddr::new(ip, self.config.discovery_port),
            None => SocketAddr::new(IpAddr::V4(self.config.broadcast_ip), self.config.discovery_port),
        };

        let request = P2pRequest::LocalConnect {
            uid: &self.config.device_uid,
            local_port: self.io.socket.local_addr()?.port(),
            client_id: self.client_id,
            mtu: self.config.advertised_mtu,
        };
        let datagram = DiscoveryDatagram::encode(&request.to_xml(), self.tid);

        for attempt in 1..=self.config.local_discovery_attempts {
            let source_port = self.take_discovery_port();
            info!("sending discovery packet (attempt {}) from port {} to {}", attempt, source_port, destination);
            if let Err(e) = self.io.broadcaster.broadcast(source_port, destination, &datagram).await {
                warn!("error sending discovery packet from port {}: {}", source_port, e);
            }

            match self.recv_signaling(self.config.local_discovery_timeout).await {
                Some((P2pReply::LocalConnected { device_id, client_id }, sender)) if client_id == self.client_id => {
                    info!("received discovery packet answer from {}, device id {}", sender, device_id);
                    return Ok(Some((sender, device_id)));
                }
                Some((reply, sender)) => {
                    debug!("ignoring discovery reply {:?} from {}", reply, sender);
                }
                None => {}
            }
        }
        info!("no local answer after {} discovery attempts", self.config.local_discovery_attempts);
        Ok(None)
    }

    async fn resolve_relays(&self) -> Vec<SocketAddr> {
        let mut relays = Vec::new();
        for hostname in &self.config.relay_hostnames {
            match self.io.resolver.resolve(hostname, self.config.relay_port).await {
                Some(addr) => relays.push(addr),
                None => debug!("skipping relay host {}", hostname),
            }
        }
        relays
    }

    async fn query_relays(&mut self) -> Result<RelayAddresses, BaichuanError> {
        self.state = TransportState::P2PQuerying;

        for relay in self.resolve_relays().await {
            info!("sending P2P discovery message to {}", relay);
            self.send_signaling(P2pRequest::RelayQuery { uid: &self.config.device_uid }, relay).await?;

            if let Some((P2pReply::RelayOffer(addresses), _)) = self.recv_signaling(self.config.relay_timeout).await {
                info!("P2P - register address found: {}", addresses.register);
                return Ok(addresses);
            }
        }
        Err(BaichuanError::RelayExhausted)
    }

    /// The address this client is reachable at, as announced to the relay
    async fn announced_local_addr(&self, towards: SocketAddr) -> Result<SocketAddr, BaichuanError> {
        let local = self.io.socket.local_addr()?;
        if !local.ip().is_unspecified() {
            return Ok(local);
        }
        match outbound_ip(towards).await {
            Ok(ip) => Ok(SocketAddr::new(ip, local.port())),
            Err(e) => {
                debug!("could not determine outbound interface towards {}: {}", towards, e);
                Ok(local)
            }
        }
    }

    async fn discover_p2p(&mut self) -> Result<(SocketAddr, u32), BaichuanError> {
        let addresses = self.query_relays().await?;

        self.state = TransportState::P2PRegistering;
        let local = self.announced_local_addr(addresses.register).await?;

        let mut device_addr = None;
        let mut device_id = None;
        for _ in 0..self.config.p2p_register_attempts {
            if device_addr.is_none() {
                self.send_signaling(P2pRequest::Register {
                    uid: &self.config.device_uid,
                    local,
                    relay: addresses.relay,
                    client_id: self.client_id,
                }, addresses.register).await?;
            }

            match self.recv_signaling(self.config.relay_timeout).await {
                Some((P2pReply::DeviceAddress { device, client_id, connection_id }, _)) if client_id == self.client_id => {
                    info!("P2P - device address received: {}", device);
                    self.state = TransportState::P2PConnecting;
                    self.connection_id = Some(connection_id);
                    device_addr = Some(device);
                    self.send_signaling(P2pRequest::LocalTransfer {
                        connection_id,
                        client_id: self.client_id,
                        mtu: self.config.advertised_mtu,
                    }, device).await?;
                }
                Some((P2pReply::DeviceIdentified { device_id: id, client_id }, _)) if client_id == self.client_id => {
                    info!("P2P - device id received: {}", id);
                    device_id = Some(id);
                }
                Some((reply, sender)) => debug!("ignoring P2P message {:?} from {}", reply, sender),
                None => {}
            }

            if let (Some(device_addr), Some(device_id)) = (device_addr, device_id) {
                let connection_id = self.connection_id.unwrap_or_default();

                // announce that we connect locally, and that we could connect remotely
                self.send_signaling(P2pRequest::RemoteConfirm {
                    connection_id,
                    client_id: self.client_id,
                    device_id,
                }, addresses.log).await?;
                self.send_signaling(P2pRequest::MapTransfer {
                    connection_id,
                    client_id: self.client_id,
                    mtu: self.config.advertised_mtu,
                }, addresses.endpoint).await?;

                return Ok((device_addr, device_id));
            }
        }

        warn!("P2P registration did not complete after {} attempts", self.config.p2p_register_attempts);
        Err(BaichuanError::Unreachable(self.config.device_uid.clone()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use mockall::Sequence;
    use crate::config::SessionConfig;
    use crate::test_util::{discovery_datagram, local_discovery_reply, paused_runtime, test_config, unbound_transport, ScriptedSocket, CLIENT_ID, DEVICE_ADDR, DEVICE_ID, LOCAL_ADDR, TID};
    use crate::transport::socket::{MockBroadcaster, MockRelayResolver};

    fn expect_broadcasts(broadcaster: &mut MockBroadcaster, ports: Vec<u16>, destination: SocketAddr) {
        let mut seq = Sequence::new();
        let expected_xml = P2pRequest::LocalConnect { uid: "UID", local_port: LOCAL_ADDR.port(), client_id: CLIENT_ID, mtu: 1350 }.to_xml();
        let expected_datagram = DiscoveryDatagram::encode(&expected_xml, TID).to_vec();
        for port in ports {
            let expected_datagram = expected_datagram.clone();
            broadcaster.expect_broadcast()
                .once()
                .in_sequence(&mut seq)
                .withf(move |p, to, datagram| *p == port && *to == destination && datagram == expected_datagram.as_slice())
                .returning(|_, _, _| Ok(()));
        }
    }

    #[test]
    fn test_local_discovery_succeeds_on_third_attempt() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());
            socket.push_silence();
            socket.push_silence();
            socket.push_inbound(local_discovery_reply(CLIENT_ID, DEVICE_ID), DEVICE_ADDR);

            let mut broadcaster = MockBroadcaster::new();
            expect_broadcasts(&mut broadcaster, vec![50000, 50001, 50002], SocketAddr::from(([255,255,255,255], 2015)));

            let mut transport = unbound_transport(socket.clone(), Arc::new(broadcaster), Arc::new(MockRelayResolver::new()));
            let started = tokio::time::Instant::now();
            transport.discover().await.unwrap();

            assert_eq!(started.elapsed(), Duration::from_millis(400));
            assert_eq!(transport.state(), TransportState::Bound);
            assert_eq!(transport.target(), Some(DEVICE_ADDR));
            assert_eq!(transport.device_id(), Some(DEVICE_ID));
            assert_eq!(transport.receive_timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn test_local_discovery_ignores_reply_for_other_client() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());
            socket.push_inbound(local_discovery_reply(CLIENT_ID + 1, DEVICE_ID), SocketAddr::from(([10,0,0,99], 3000)));
            socket.push_inbound(local_discovery_reply(CLIENT_ID, DEVICE_ID), DEVICE_ADDR);

            let mut broadcaster = MockBroadcaster::new();
            expect_broadcasts(&mut broadcaster, vec![50000, 50001], SocketAddr::from(([255,255,255,255], 2015)));

            let mut transport = unbound_transport(socket.clone(), Arc::new(broadcaster), Arc::new(MockRelayResolver::new()));
            transport.discover().await.unwrap();
            assert_eq!(transport.target(), Some(DEVICE_ADDR));
        });
    }

    #[test]
    fn test_local_discovery_with_target_ip_skips_p2p() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());

            let mut config = test_config();
            config.target_ip = Some(IpAddr::from([192,168,1,20]));
            config.local_discovery_attempts = 3;

            let mut broadcaster = MockBroadcaster::new();
            expect_broadcasts(&mut broadcaster, vec![50000, 50001, 50002], SocketAddr::from(([192,168,1,20], 2015)));
            // no expectations: P2P must not resolve relays
            let resolver = MockRelayResolver::new();

            let mut transport = Transport::new(Arc::new(config), crate::transport::TransportIo {
                socket: socket.clone(),
                broadcaster: Arc::new(broadcaster),
                resolver: Arc::new(resolver),
            }, CLIENT_ID, TID);

            assert!(matches!(transport.discover().await, Err(BaichuanError::Unreachable(_))));
            assert_eq!(transport.state(), TransportState::Unreachable);
            assert!(socket.sent().is_empty());
        });
    }

    #[test]
    fn test_discovery_source_port_wraps() {
        let mut config = test_config();
        config.discovery_source_ports = 59999..=60000;
        let socket = Arc::new(ScriptedSocket::new());
        let mut transport = Transport::new(Arc::new(config), crate::transport::TransportIo {
            socket,
            broadcaster: Arc::new(MockBroadcaster::new()),
            resolver: Arc::new(MockRelayResolver::new()),
        }, CLIENT_ID, TID);

        let ports = (0..5).map(|_| transport.take_discovery_port()).collect::<Vec<_>>();
        assert_eq!(ports, vec![59999, 60000, 59999, 60000, 59999]);
    }

    fn p2p_config() -> SessionConfig {
        let mut config = test_config();
        config.local_discovery_attempts = 1;
        config.relay_hostnames = vec!["p2p.invalid".to_string(), "p2p1.example".to_string(), "p2p2.example".to_string()];
        config
    }

    fn p2p_resolver() -> MockRelayResolver {
        let mut resolver = MockRelayResolver::new();
        resolver.expect_resolve()
            .withf(|hostname, port| hostname == "p2p.invalid" && *port == 9999)
            .returning(|_, _| None);
        resolver.expect_resolve()
            .withf(|hostname, port| hostname == "p2p1.example" && *port == 9999)
            .returning(|_, port| Some(SocketAddr::from(([1,1,1,1], port))));
        resolver.expect_resolve()
            .withf(|hostname, port| hostname == "p2p2.example" && *port == 9999)
            .returning(|_, port| Some(SocketAddr::from(([2,2,2,2], port))));
        resolver
    }

    fn any_broadcast() -> MockBroadcaster {
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast()
            .returning(|_, _, _| Ok(()));
        broadcaster
    }

    const RELAY_OFFER: &str = "<P2P>\n<M2C_Q_R>\n<reg>\n<ip>3.3.3.1</ip>\n<port>58100</port>\n</reg>\n<relay>\n<ip>3.3.3.2</ip>\n<port>58200</port>\n</relay>\n<log>\n<ip>3.3.3.3</ip>\n<port>57850</port>\n</log>\n<t>\n<ip>3.3.3.4</ip>\n<port>9996</port>\n</t>\n</M2C_Q_R>\n</P2P>\n";

    fn sent_xml(datagram: &[u8]) -> String {
        DiscoveryDatagram::decode(datagram).unwrap().unwrap()
    }

    #[test]
    fn test_p2p_discovery() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());
            socket.push_silence(); // local discovery
            socket.push_silence(); // first relay does not answer
            socket.push_inbound(discovery_datagram(RELAY_OFFER, 5), SocketAddr::from(([2,2,2,2], 9999)));
            socket.push_silence(); // first registration gets no answer
            socket.push_inbound(discovery_datagram(&format!("<P2P>\n<R2C_T>\n<dev>\n<ip>203.0.113.7</ip>\n<port>6123</port>\n</dev>\n<cid>{}</cid>\n<sid>4711</sid>\n</R2C_T>\n</P2P>\n", CLIENT_ID), 5), SocketAddr::from(([3,3,3,1], 58100)));
            socket.push_inbound(discovery_datagram(&format!("<P2P>\n<D2C_T>\n<sid>4711</sid>\n<cid>{}</cid>\n<did>{}</did>\n</D2C_T>\n</P2P>\n", CLIENT_ID, DEVICE_ID), 6), SocketAddr::from(([203,0,113,7], 6123)));

            let mut transport = Transport::new(Arc::new(p2p_config()), crate::transport::TransportIo {
                socket: socket.clone(),
                broadcaster: Arc::new(any_broadcast()),
                resolver: Arc::new(p2p_resolver()),
            }, CLIENT_ID, TID);

            transport.discover().await.unwrap();

            let device = SocketAddr::from(([203,0,113,7], 6123));
            assert_eq!(transport.state(), TransportState::Bound);
            assert_eq!(transport.target(), Some(device));
            assert_eq!(transport.device_id(), Some(DEVICE_ID));
            assert_eq!(transport.connection_id, Some(4711));
            assert_eq!(transport.receive_timeout, Duration::from_secs(1));

            let sent = socket.sent().into_iter()
                .map(|(datagram, to)| (sent_xml(&datagram), to))
                .collect::<Vec<_>>();

            let register = P2pRequest::Register { uid: "UID", local: LOCAL_ADDR, relay: SocketAddr::from(([3,3,3,2], 58200)), client_id: CLIENT_ID }.to_xml();
            assert_eq!(sent, vec![
                (P2pRequest::RelayQuery { uid: "UID" }.to_xml(), SocketAddr::from(([1,1,1,1], 9999))),
                (P2pRequest::RelayQuery { uid: "UID" }.to_xml(), SocketAddr::from(([2,2,2,2], 9999))),
                (register.clone(), SocketAddr::from(([3,3,3,1], 58100))),
                (register, SocketAddr::from(([3,3,3,1], 58100))),
                (P2pRequest::LocalTransfer { connection_id: 4711, client_id: CLIENT_ID, mtu: 1350 }.to_xml(), device),
                (P2pRequest::RemoteConfirm { connection_id: 4711, client_id: CLIENT_ID, device_id: DEVICE_ID }.to_xml(), SocketAddr::from(([3,3,3,3], 57850))),
                (P2pRequest::MapTransfer { connection_id: 4711, client_id: CLIENT_ID, mtu: 1350 }.to_xml(), SocketAddr::from(([3,3,3,4], 9996))),
            ]);
        });
    }

    #[test]
    fn test_p2p_relays_exhausted() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());

            let mut transport = Transport::new(Arc::new(p2p_config()), crate::transport::TransportIo {
                socket: socket.clone(),
                broadcaster: Arc::new(any_broadcast()),
                resolver: Arc::new(p2p_resolver()),
            }, CLIENT_ID, TID);

            let result = transport.discover().await;
            assert!(matches!(result, Err(BaichuanError::RelayExhausted)));
            assert_eq!(transport.state(), TransportState::Unreachable);
            assert_eq!(socket.sent().len(), 2);
        });
    }

    #[test]
    fn test_p2p_no_relay_resolves() {
        paused_runtime().block_on(async {
            let mut resolver = MockRelayResolver::new();
            resolver.expect_resolve()
                .times(3)
                .returning(|_, _| None);

            let mut transport = Transport::new(Arc::new(p2p_config()), crate::transport::TransportIo {
                socket: Arc::new(ScriptedSocket::new()),
                broadcaster: Arc::new(any_broadcast()),
                resolver: Arc::new(resolver),
            }, CLIENT_ID, TID);

            assert!(matches!(transport.discover().await, Err(BaichuanError::RelayExhausted)));
        });
    }

    #[test]
    fn test_p2p_registration_gives_up() {
        paused_runtime().block_on(async {
            let socket = Arc::new(ScriptedSocket::new());
            socket.push_silence();
            socket.push_inbound(discovery_datagram(RELAY_OFFER, 5), SocketAddr::from(([1,1,1,1], 9999)));

            let mut config = p2p_config();
            config.p2p_register_attempts = 3;

            let mut transport = Transport::new(Arc::new(config), crate::transport::TransportIo {
                socket: socket.clone(),
                broadcaster: Arc::new(any_broadcast()),
                resolver: Arc::new(p2p_resolver()),
            }, CLIENT_ID, TID);

            assert!(matches!(transport.discover().await, Err(BaichuanError::Unreachable(_))));
            assert_eq!(transport.state(), TransportState::Unreachable);
            // one relay query, then three registrations
            assert_eq!(socket.sent().len(), 4);
        });
    }
}
