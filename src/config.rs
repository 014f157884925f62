use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::Deserialize;


/// Public relay servers that broker connections to cameras behind NAT
pub const DEFAULT_RELAY_HOSTNAMES: [&str; 10] = [
    "p2p.reolink.com",
    "p2p1.reolink.com",
    "p2p2.reolink.com",
    "p2p3.reolink.com",
    "p2p14.reolink.com",
    "p2p15.reolink.com",
    "p2p6.reolink.com",
    "p2p7.reolink.com",
    "p2p8.reolink.com",
    "p2p9.reolink.com",
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamKind {
    Main,
    Sub,
}
impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Main => "mainStream",
            StreamKind::Sub => "subStream",
        }
    }
}

/// What the demuxer does with a binary record whose magic it does not recognize
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnknownFramePolicy {
    /// append the record verbatim to the elementary stream. Firmware splits large frames into
    ///  continuation records without a header of their own, so this is the default.
    PassThrough,
    Drop,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// device UID as printed on the camera, used to address it during discovery
    pub device_uid: String,
    pub username: String,
    pub password: String,

    /// Known camera address. If set, local discovery is sent directly to this address instead of
    ///  the broadcast address, and P2P discovery is skipped.
    pub target_ip: Option<IpAddr>,
    /// local address of the session socket
    pub bind_addr: SocketAddr,

    pub broadcast_ip: Ipv4Addr,
    pub discovery_port: u16,
    /// every discovery broadcast is sent from a fresh socket, bound to the next port from this range
    pub discovery_source_ports: RangeInclusive<u16>,
    pub local_discovery_attempts: usize,
    pub local_discovery_timeout: Duration,

    pub relay_hostnames: Vec<String>,
    pub relay_port: u16,
    pub relay_timeout: Duration,
    /// upper bound for registration round trips with the relay before giving up
    pub p2p_register_attempts: usize,

    /// receive timeout once a device was found on the local network
    pub local_receive_timeout: Duration,
    /// receive timeout once a device was reached through a relay
    pub p2p_receive_timeout: Duration,
    /// receive timeout while streaming
    pub video_receive_timeout: Duration,

    /// maximum payload of a single transport datagram
    pub max_fragment_len: usize,
    /// MTU advertised to the device during discovery
    pub advertised_mtu: u32,
    /// number of acks trailing the send sequence that are tolerated before pending datagrams are
    ///  sent again
    pub stale_ack_threshold: u32,
    /// a ping is sent after every n-th received message while streaming
    pub ping_every_n_messages: u64,

    pub stream: StreamKind,
    pub unknown_frames: UnknownFramePolicy,

    /// pause before reconnecting after a protocol or discovery failure
    pub reconnect_backoff: Duration,
    /// pause before reconnecting after a timeout, a socket error or a damaged message
    pub transient_backoff: Duration,
}

impl SessionConfig {
    pub fn new(device_uid: &str, username: &str, password: &str) -> SessionConfig {
        SessionConfig {
            device_uid: device_uid.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            target_ip: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            broadcast_ip: Ipv4Addr::BROADCAST,
            discovery_port: 2015,
            discovery_source_ports: 50000..=60000,
            local_discovery_attempts: 25,
            local_discovery_timeout: Duration::from_millis(200),
            relay_hostnames: DEFAULT_RELAY_HOSTNAMES.iter().map(|h| h.to_string()).collect(),
            relay_port: 9999,
            relay_timeout: Duration::from_millis(500),
            p2p_register_attempts: 40,
            local_receive_timeout: Duration::from_secs(30),
            p2p_receive_timeout: Duration::from_secs(1),
            video_receive_timeout: Duration::from_secs(5),
            max_fragment_len: 1330,
            advertised_mtu: 1350,
            stale_ack_threshold: 10,
            ping_every_n_messages: 16,
            stream: StreamKind::Main,
            unknown_frames: UnknownFramePolicy::PassThrough,
            reconnect_backoff: Duration::from_secs(1),
            transient_backoff: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_uid.is_empty() {
            bail!("device UID must not be empty");
        }
        if self.discovery_source_ports.is_empty() {
            bail!("discovery source port range {:?} is empty", self.discovery_source_ports);
        }
        if self.local_discovery_attempts == 0 {
            bail!("at least one local discovery attempt is required");
        }
        if self.max_fragment_len == 0 || self.max_fragment_len > 1400 {
            bail!("fragment length {} must be between 1 and 1400", self.max_fragment_len);
        }
        if self.stale_ack_threshold == 0 {
            bail!("stale ack threshold must be positive");
        }
        if self.ping_every_n_messages == 0 {
            bail!("ping interval must be positive");
        }
        if self.reconnect_backoff.is_zero() || self.transient_backoff.is_zero() {
            bail!("reconnect back-off must be positive");
        }
        Ok(())
    }
}


/// Settings for the [SessionRegistry](crate::registry::SessionRegistry)
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// sessions that were not accessed for this long are stopped
    pub idle_timeout: Duration,
    pub eviction_poll_interval: Duration,
    /// number of events buffered per session for slow subscribers
    pub event_capacity: usize,
}

impl RegistryConfig {
    pub fn new() -> RegistryConfig {
        RegistryConfig {
            idle_timeout: Duration::from_secs(30),
            eviction_poll_interval: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.eviction_poll_interval.is_zero() {
            bail!("eviction poll interval must be positive");
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}


/// Top level of the settings file: `{"cameras": [...]}`
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub cameras: Vec<CameraSettings>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CameraSettings {
    pub name: String,
    pub device_sid: String,
    pub username: String,
    pub password: String,
    /// image to show while the camera is not streaming
    #[serde(default)]
    pub backup_image: Option<String>,
    #[serde(default)]
    pub target_ip: Option<IpAddr>,
}

impl CameraSettings {
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.device_sid, &self.username, &self.password);
        config.target_ip = self.target_ip;
        config
    }
}

impl Settings {
    pub fn parse(json: &str) -> anyhow::Result<Settings> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Settings> {
        let json = std::fs::read_to_string(path)?;
        Self::parse(&json)
    }

    pub fn camera(&self, name: &str) -> Option<&CameraSettings> {
        self.cameras.iter()
            .find(|c| c.name == name)
    }
}
