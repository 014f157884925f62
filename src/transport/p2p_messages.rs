use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;

use crate::util::xml::XmlBody;


/// operating system the client announces itself as
pub const CLIENT_OS: &str = "WIN";


/// Signaling messages this client sends during discovery and NAT traversal. They all travel
///  as XML in [DiscoveryDatagram](crate::transport::headers::DiscoveryDatagram)s.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum P2pRequest<'a> {
    /// `C2D_C`: looks for the device on the local network
    LocalConnect { uid: &'a str, local_port: u16, client_id: u32, mtu: u32 },
    /// `C2M_Q`: asks a relay for the servers responsible for a device
    RelayQuery { uid: &'a str },
    /// `C2R_C`: registers this client with the relay so the device learns about it
    Register { uid: &'a str, local: SocketAddr, relay: SocketAddr, client_id: u32 },
    /// `C2D_T` with `conn` local: announces the client to the device address learned from the relay
    LocalTransfer { connection_id: u32, client_id: u32, mtu: u32 },
    /// `C2R_CFM`: confirms the connection to the relay's log server
    RemoteConfirm { connection_id: u32, client_id: u32, device_id: u32 },
    /// `C2D_T` with `conn` map: announces the client to the relay's endpoint server
    MapTransfer { connection_id: u32, client_id: u32, mtu: u32 },
}

impl P2pRequest<'_> {
    pub fn to_xml(&self) -> String {
        let body = match self {
            P2pRequest::LocalConnect { uid, local_port, client_id, mtu } => format!(
                "<C2D_C>\n<uid>{uid}</uid>\n<cli>\n<port>{local_port}</port>\n</cli>\n<cid>{client_id}</cid>\n<mtu>{mtu}</mtu>\n<debug>0</debug>\n<p>{CLIENT_OS}</p>\n</C2D_C>\n"
            ),
            P2pRequest::RelayQuery { uid } => format!(
                "<C2M_Q>\n<uid>{uid}</uid>\n<p>{CLIENT_OS}</p>\n</C2M_Q>\n"
            ),
            P2pRequest::Register { uid, local, relay, client_id } => format!(
                "<C2R_C>\n<uid>{uid}</uid>\n<cli>\n<ip>{}</ip>\n<port>{}</port>\n</cli>\n<relay>\n<ip>{}</ip>\n<port>{}</port>\n</relay>\n<cid>{client_id}</cid>\n<debug>0</debug>\n<family>4</family>\n<p>{CLIENT_OS}</p>\n</C2R_C>\n",
                local.ip(), local.port(), relay.ip(), relay.port(),
            ),
            P2pRequest::LocalTransfer { connection_id, client_id, mtu } => format!(
                "<C2D_T>\n<sid>{connection_id}</sid>\n<conn>local</conn>\n<cid>{client_id}</cid>\n<mtu>{mtu}</mtu>\n</C2D_T>\n"
            ),
            P2pRequest::RemoteConfirm { connection_id, client_id, device_id } => format!(
                "<C2R_CFM>\n<sid>{connection_id}</sid>\n<conn>local</conn>\n<rsp>0</rsp>\n<cid>{client_id}</cid>\n<did>{device_id}</did>\n</C2R_CFM>\n"
            ),
            P2pRequest::MapTransfer { connection_id, client_id, mtu } => format!(
                "<C2D_T>\n<sid>{connection_id}</sid>\n<conn>map</conn>\n<rsp>0</rsp>\n<cid>{client_id}</cid>\n<mtu>{mtu}</mtu>\n</C2D_T>\n"
            ),
        };
        format!("<P2P>\n{}</P2P>\n", body)
    }
}


/// Servers a relay assigns for a device
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RelayAddresses {
    pub register: SocketAddr,
    pub relay: SocketAddr,
    pub log: SocketAddr,
    pub endpoint: SocketAddr,
}

/// Signaling messages received from devices and relays
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum P2pReply {
    /// `D2C_C_R`: a device answered local discovery
    LocalConnected { device_id: u32, client_id: u32 },
    /// `M2C_Q_R`: a relay answered the query
    RelayOffer(RelayAddresses),
    /// `R2C_T`: the relay passes on the device's address
    DeviceAddress { device: SocketAddr, client_id: u32, connection_id: u32 },
    /// `D2C_T`, `D2C_CFM` or `D2C_DISC`: the device identifies itself
    DeviceIdentified { device_id: u32, client_id: u32 },
}

impl P2pReply {
    pub fn parse(xml: &str) -> anyhow::Result<P2pReply> {
        let xml = XmlBody::parse(xml)?;

        if xml.has("D2C_C_R") {
            return Ok(P2pReply::LocalConnected {
                device_id: number(&xml, "D2C_C_R/did")?,
                client_id: number(&xml, "D2C_C_R/cid")?,
            });
        }
        if xml.has("M2C_Q_R") {
            return Ok(P2pReply::RelayOffer(RelayAddresses {
                register: address(&xml, "M2C_Q_R/reg")?,
                relay: address(&xml, "M2C_Q_R/relay")?,
                log: address(&xml, "M2C_Q_R/log")?,
                endpoint: address(&xml, "M2C_Q_R/t")?,
            }));
        }
        if xml.has("R2C_T") {
            return Ok(P2pReply::DeviceAddress {
                device: address(&xml, "R2C_T/dev")?,
                client_id: number(&xml, "R2C_T/cid")?,
                connection_id: number(&xml, "R2C_T/sid")?,
            });
        }
        for element in ["D2C_T", "D2C_CFM", "D2C_DISC"] {
            if xml.has(element) {
                return Ok(P2pReply::DeviceIdentified {
                    device_id: number(&xml, &format!("{}/did", element))?,
                    client_id: number(&xml, &format!("{}/cid", element))?,
                });
            }
        }

        Err(anyhow!("unsupported P2P message"))
    }
}

fn number(xml: &XmlBody, path: &str) -> anyhow::Result<u32> {
    xml.parse_at(path)
        .ok_or_else(|| anyhow!("missing or invalid {}", path))
}

fn address(xml: &XmlBody, path: &str) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = xml.parse_at(&format!("{}/ip", path))
        .ok_or_else(|| anyhow!("missing or invalid {}/ip", path))?;
    let port: u16 = xml.parse_at(&format!("{}/port", path))
        .ok_or_else(|| anyhow!("missing or invalid {}/port", path))?;
    Ok(SocketAddr::new(ip, port))
}
