use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::crypto::{checksum, tid_xor};
use crate::error::BaichuanError;
use crate::util::buf_ext::BufExt;


/// First word of every UDP datagram, selecting its layout
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum UdpTag {
    Control = 0x2a87cf10,
    Ack = 0x2a87cf20,
    Discovery = 0x2a87cf3a,
}
impl UdpTag {
    pub fn peek(datagram: &[u8]) -> Option<UdpTag> {
        let mut buf = datagram;
        buf.try_get_u32_le().ok()
            .and_then(|raw| UdpTag::try_from(raw).ok())
    }
}


/// Header of a datagram on the reliable channel:
///
/// ```ascii
///  0: tag (u32)
///  4: connection id (u32) - the device id when sending, the client id when receiving
///  8: reserved (u32)
/// 12: sequence number (u32)
/// 16: payload length (u32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DatagramHeader {
    pub connection_id: u32,
    pub seq: u32,
    pub payload_len: u32,
}
impl DatagramHeader {
    pub const SERIALIZED_LEN: usize = 20;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(UdpTag::Control.into());
        buf.put_u32_le(self.connection_id);
        buf.put_u32_le(0);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.payload_len);
    }

    /// The tag must have been checked by the caller
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        buf.skip_checked(4)?;
        let connection_id = buf.try_get_u32_le()?;
        buf.skip_checked(4)?;
        let seq = buf.try_get_u32_le()?;
        let payload_len = buf.try_get_u32_le()?;
        Ok(DatagramHeader {
            connection_id,
            seq,
            payload_len,
        })
    }
}


/// Acknowledgement of the highest in-order sequence number a peer received
///
/// ```ascii
///  0: tag (u32)
///  4: connection id (u32)
///  8: reserved (u32)
/// 12: reserved (u32)
/// 16: acknowledged sequence number (u32)
/// 20: reserved (u32)
/// 24: reserved (u32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckDatagram {
    pub connection_id: u32,
    pub acked_seq: u32,
}
impl AckDatagram {
    pub const SERIALIZED_LEN: usize = 28;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(UdpTag::Ack.into());
        buf.put_u32_le(self.connection_id);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(self.acked_seq);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckDatagram> {
        if buf.remaining() < 20 {
            return Err(anyhow!("ack datagram too short: {} bytes", buf.remaining()));
        }
        buf.skip_checked(4)?;
        let connection_id = buf.try_get_u32_le()?;
        buf.skip_checked(8)?;
        let acked_seq = buf.try_get_u32_le()?;
        Ok(AckDatagram {
            connection_id,
            acked_seq,
        })
    }
}


/// Discovery and P2P signaling datagram: a header followed by [tid_xor] encrypted XML.
///
/// ```ascii
///  0: tag (u32)
///  4: plain text payload length (u32)
///  8: reserved, always 1 (u32)
/// 12: transaction id (u32) - key for the payload cipher
/// 16: checksum over the encrypted payload (u32)
/// ```
pub struct DiscoveryDatagram;
impl DiscoveryDatagram {
    pub const HEADER_LEN: usize = 20;

    pub fn encode(xml: &str, tid: u32) -> BytesMut {
        let encrypted = tid_xor(xml.as_bytes(), tid);

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + encrypted.len());
        buf.put_u32_le(UdpTag::Discovery.into());
        buf.put_u32_le(xml.len() as u32);
        buf.put_u32_le(1);
        buf.put_u32_le(tid);
        buf.put_u32_le(checksum(&encrypted));
        buf.put_slice(&encrypted);
        buf
    }

    /// Returns the decrypted XML of a discovery datagram, `Ok(None)` for datagrams of a different
    ///  kind, and an integrity error for truncated or tampered payloads.
    pub fn decode(datagram: &[u8]) -> Result<Option<String>, BaichuanError> {
        if UdpTag::peek(datagram) != Some(UdpTag::Discovery) {
            return Ok(None);
        }

        let mut buf = datagram;
        let (size, tid, expected_checksum) = Self::deser_header(&mut buf)
            .map_err(|e| BaichuanError::Integrity(e.to_string()))?;

        if buf.len() < size {
            return Err(BaichuanError::Integrity(format!("discovery payload truncated: {} of {} bytes", buf.len(), size)));
        }
        let payload = &buf[..size];

        let actual_checksum = checksum(payload);
        if actual_checksum != expected_checksum {
            return Err(BaichuanError::Integrity(format!("invalid checksum - expected: {} actual: {}", expected_checksum, actual_checksum)));
        }

        String::from_utf8(tid_xor(payload, tid))
            .map(Some)
            .map_err(|e| BaichuanError::Integrity(e.to_string()))
    }

    fn deser_header(buf: &mut &[u8]) -> anyhow::Result<(usize, u32, u32)> {
        buf.skip_checked(4)?;
        let size = buf.try_get_u32_le()? as usize;
        buf.skip_checked(4)?;
        let tid = buf.try_get_u32_le()?;
        let checksum = buf.try_get_u32_le()?;
        Ok((size, tid, checksum))
    }
}
