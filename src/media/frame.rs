use anyhow::bail;
use bytes::Buf;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::BufExt;


/// codec tag for H.264 ("H264" in little-endian ASCII)
pub const CODEC_H264: u32 = 0x3436_3248;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum FrameMagic {
    IFrame = 0x6364_3030,
    PFrame = 0x6364_3130,
    InfoV1 = 0x3130_3031,
    InfoV2 = 0x3230_3031,
    Aac = 0x6277_3530,
}

impl FrameMagic {
    pub fn header_len(&self) -> usize {
        match self {
            FrameMagic::IFrame => 32,
            FrameMagic::PFrame => 24,
            FrameMagic::InfoV1 | FrameMagic::InfoV2 => 4,
            FrameMagic::Aac => 8,
        }
    }
}

/// One binary record from a video message
///
/// ```ascii
/// I-frame (32 byte header)       P-frame (24 byte header)      AAC (8 byte header)
///  0: magic (u32)                  0: magic (u32)                0: magic (u32)
///  4: codec tag (u32)              4: codec tag (u32)            4: left size (u16)
///  8: payload size (u32)           8: payload size (u32)         6: right size (u16)
/// 12: reserved (3 x u32)          12: reserved (3 x u32)
/// 24: POSIX timestamp (u32)
/// 28: reserved (u32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame<'a> {
    IFrame {
        codec: u32,
        size: u32,
        /// seconds since the epoch, UTC
        timestamp: u32,
        payload: &'a [u8],
    },
    PFrame {
        codec: u32,
        size: u32,
        payload: &'a [u8],
    },
    AudioFrame {
        left_size: u16,
        right_size: u16,
    },
    InfoRecord,
    Unknown(&'a [u8]),
}

impl<'a> Frame<'a> {
    /// Fails if the record is too short for the header its magic announces. A payload that is
    ///  shorter than the declared size is returned as far as it goes.
    pub fn parse(data: &'a [u8]) -> anyhow::Result<Frame<'a>> {
        let mut buf = data;
        let raw_magic = buf.try_get_u32_le()?;
        let Ok(magic) = FrameMagic::try_from(raw_magic) else {
            return Ok(Frame::Unknown(data));
        };
        if data.len() < magic.header_len() {
            bail!("{:?} record of {} bytes is shorter than its header", magic, data.len());
        }

        let frame = match magic {
            FrameMagic::IFrame => {
                let codec = buf.try_get_u32_le()?;
                let size = buf.try_get_u32_le()?;
                buf.skip_checked(12)?;
                let timestamp = buf.try_get_u32_le()?;
                Frame::IFrame {
                    codec,
                    size,
                    timestamp,
                    payload: payload(data, magic.header_len(), size),
                }
            }
            FrameMagic::PFrame => {
                let codec = buf.try_get_u32_le()?;
                let size = buf.try_get_u32_le()?;
                Frame::PFrame {
                    codec,
                    size,
                    payload: payload(data, magic.header_len(), size),
                }
            }
            FrameMagic::InfoV1 | FrameMagic::InfoV2 => Frame::InfoRecord,
            FrameMagic::Aac => Frame::AudioFrame {
                left_size: buf.try_get_u16_le()?,
                right_size: buf.try_get_u16_le()?,
            },
        };
        Ok(frame)
    }
}

fn payload(data: &[u8], header_len: usize, size: u32) -> &[u8] {
    let end = header_len.saturating_add(size as usize).min(data.len());
    &data[header_len..end]
}
