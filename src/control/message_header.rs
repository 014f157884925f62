use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::BaichuanError;
use crate::util::buf_ext::BufExt;


pub const BAICHUAN_MAGIC: u32 = 0x0abc_def0;

/// Selects the header layout of a control message
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MessageClass {
    Legacy = 0x6514,
    Modern = 0x6414,
    ModernShort = 0x6614,
    Unclassified = 0x0000,
}

impl MessageClass {
    pub fn header_len(&self) -> usize {
        if self.has_bin_offset() { 24 } else { 20 }
    }

    pub fn has_bin_offset(&self) -> bool {
        matches!(self, MessageClass::Modern | MessageClass::Unclassified)
    }
}

/// ```ascii
///  0: magic 0x0abcdef0 (u32)
///  4: message id (u32)
///  8: message length, excluding the header (u32)
/// 12: encryption offset (u32)
/// 16: encrypted (u8)
/// 17: unknown (u8)
/// 18: message class (u16)
/// 20: binary offset (u32) - only for classes that carry it
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub message_id: u32,
    pub message_len: u32,
    pub encryption_offset: u32,
    pub encrypted: bool,
    pub unknown: u8,
    pub class: MessageClass,
    pub bin_offset: u32,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ParsedHeader {
    Header(MessageHeader),
    BadMagic(u32),
    /// the buffer ends before the header does
    Incomplete,
}

impl MessageHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(BAICHUAN_MAGIC);
        buf.put_u32_le(self.message_id);
        buf.put_u32_le(self.message_len);
        buf.put_u32_le(self.encryption_offset);
        buf.put_u8(self.encrypted.into());
        buf.put_u8(self.unknown);
        buf.put_u16_le(self.class.into());
        if self.class.has_bin_offset() {
            buf.put_u32_le(self.bin_offset);
        }
    }

    pub fn try_parse(data: &[u8]) -> Result<ParsedHeader, BaichuanError> {
        let mut buf = data;

        let Ok(magic) = buf.try_get_u32_le() else {
            return Ok(ParsedHeader::Incomplete);
        };
        if magic != BAICHUAN_MAGIC {
            return Ok(ParsedHeader::BadMagic(magic));
        }
        if data.len() < 20 {
            return Ok(ParsedHeader::Incomplete);
        }

        let class_raw = u16::from_le_bytes([data[18], data[19]]);
        let class = MessageClass::try_from(class_raw)
            .map_err(|_| BaichuanError::UnknownMessageClass(class_raw))?;
        if data.len() < class.header_len() {
            return Ok(ParsedHeader::Incomplete);
        }

        Ok(ParsedHeader::Header(Self::deser_fields(&mut buf, class)?))
    }

    fn deser_fields(buf: &mut &[u8], class: MessageClass) -> Result<MessageHeader, BaichuanError> {
        let parse = |buf: &mut &[u8]| -> anyhow::Result<MessageHeader> {
            let message_id = buf.try_get_u32_le()?;
            let message_len = buf.try_get_u32_le()?;
            let encryption_offset = buf.try_get_u32_le()?;
            let encrypted = buf.try_get_u8()? != 0;
            let unknown = buf.try_get_u8()?;
            buf.skip_checked(2)?;
            let bin_offset = if class.has_bin_offset() { buf.try_get_u32_le()? } else { 0 };
            Ok(MessageHeader {
                message_id,
                message_len,
                encryption_offset,
                encrypted,
                unknown,
                class,
                bin_offset,
            })
        };
        parse(buf).map_err(|e| BaichuanError::Protocol(e.to_string()))
    }
}
