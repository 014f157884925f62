use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::StreamKind;
use crate::control::login::{legacy_login_body, legacy_login_header, modern_login_xml};
use crate::control::message_header::{MessageClass, MessageHeader, ParsedHeader};
use crate::control::messages::{start_video_xml, LogicalMessage, MSG_ID_LOGIN, MSG_ID_PING, MSG_ID_VIDEO};
use crate::crypto::offset_xor;
use crate::error::BaichuanError;
use crate::transport::FragmentTransport;
use crate::util::xml::binary_data_flag;


/// Frames control messages on top of a bound transport, and reassembles received fragments into
///  [LogicalMessage]s.
///
/// A message's declared length covers text and binary payload together. Fragments may end in
///  the middle of a message, and a fragment may carry the start of the next message after the
///  end of the current one; those surplus bytes are kept and consumed first by the next
///  [ControlSession::receive_message].
pub struct ControlSession<T: FragmentTransport> {
    transport: T,
    username: String,
    password: String,
    /// the offset from the most recent received header, used for encrypting outbound bodies
    encryption_offset: u32,
    binary_mode: HashMap<u32, bool>,
    carry: BytesMut,
}

impl<T: FragmentTransport> ControlSession<T> {
    pub fn new(transport: T, username: &str, password: &str) -> ControlSession<T> {
        ControlSession {
            transport,
            username: username.to_string(),
            password: password.to_string(),
            encryption_offset: 0,
            binary_mode: HashMap::new(),
            carry: BytesMut::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn encryption_offset(&self) -> u32 {
        self.encryption_offset
    }

    pub fn is_binary_mode(&self, message_id: u32) -> bool {
        self.binary_mode.get(&message_id).copied().unwrap_or(false)
    }

    /// A binary mode latch never goes back to text: once a message id carried binary data, all
    ///  subsequent messages with that id do
    fn latch_binary_mode(&mut self, message_id: u32) {
        let latched = self.binary_mode.entry(message_id).or_default();
        if !*latched {
            debug!("message id {:#x} switches to binary mode", message_id);
        }
        *latched = true;
    }

    pub async fn send_legacy_login(&mut self) -> Result<(), BaichuanError> {
        debug!("sending legacy login");
        let mut buf = BytesMut::new();
        legacy_login_header().ser(&mut buf);
        buf.extend_from_slice(&legacy_login_body(&self.username, &self.password));
        self.transport.send_message(&buf).await
    }

    pub async fn send_modern_login(&mut self, nonce: &str) -> Result<(), BaichuanError> {
        debug!("sending modern login");
        let xml = modern_login_xml(&self.username, &self.password, nonce);
        self.send_modern(MSG_ID_LOGIN, xml.as_bytes()).await
    }

    pub async fn start_video(&mut self, stream: StreamKind) -> Result<(), BaichuanError> {
        debug!("requesting {}", stream.as_str());
        self.send_modern(MSG_ID_VIDEO, start_video_xml(stream).as_bytes()).await
    }

    pub async fn ping(&mut self) -> Result<(), BaichuanError> {
        trace!("ping");
        self.send_modern(MSG_ID_PING, &[]).await
    }

    async fn send_modern(&mut self, message_id: u32, body: &[u8]) -> Result<(), BaichuanError> {
        let body = offset_xor(body, self.encryption_offset);

        let mut buf = BytesMut::with_capacity(MessageClass::Modern.header_len() + body.len());
        MessageHeader {
            message_id,
            message_len: body.len() as u32,
            encryption_offset: self.encryption_offset,
            encrypted: false,
            unknown: 0,
            class: MessageClass::Modern,
            bin_offset: 0,
        }.ser(&mut buf);
        buf.extend_from_slice(&body);
        self.transport.send_message(&buf).await
    }

    async fn next_fragment(&mut self) -> Result<BytesMut, BaichuanError> {
        if !self.carry.is_empty() {
            return Ok(self.carry.split());
        }
        let fragment = self.transport.receive_fragment().await?;
        Ok(BytesMut::from(fragment.as_ref()))
    }

    /// Receives the next complete message. Returns `Ok(None)` if the data at a message boundary
    ///  does not start with the magic number; that data is dropped, and the next call resumes
    ///  with the next fragment.
    pub async fn receive_message(&mut self) -> Result<Option<LogicalMessage>, BaichuanError> {
        let mut data = self.next_fragment().await?;
        let header = loop {
            match MessageHeader::try_parse(&data)? {
                ParsedHeader::Header(header) => break header,
                ParsedHeader::BadMagic(magic) => {
                    // intentionally keeps the encryption offset of the last valid header
                    warn!("dropping {} bytes starting with bad magic {:#010x}", data.len(), magic);
                    return Ok(None);
                }
                ParsedHeader::Incomplete => {
                    trace!("header spans fragments");
                    let more = self.transport.receive_fragment().await
                        .map_err(|e| truncated(e, "header", data.len()))?;
                    data.extend_from_slice(&more);
                }
            }
        };
        trace!("received header {:?}", header);

        self.encryption_offset = header.encryption_offset;
        if header.bin_offset != 0 {
            self.latch_binary_mode(header.message_id);
        }

        let text_quota = if self.is_binary_mode(header.message_id) {
            header.bin_offset as usize
        }
        else {
            usize::MAX
        };
        let mut assembly = Assembly::new(header.message_len as usize, text_quota);

        let surplus = assembly.append(&data[header.class.header_len()..]);
        self.carry.extend_from_slice(surplus);
        while !assembly.is_complete() {
            let fragment = self.next_fragment().await
                .map_err(|e| truncated(e, "message body", assembly.received()))?;
            let surplus = assembly.append(&fragment);
            self.carry.extend_from_slice(surplus);
        }

        let Assembly { text, binary, .. } = assembly;
        let text = if header.encrypted || (header.class == MessageClass::Modern && !text.is_empty()) {
            Bytes::from(offset_xor(&text, self.encryption_offset))
        }
        else {
            text.freeze()
        };

        if binary_data_flag(&text) == Some(true) {
            self.latch_binary_mode(header.message_id);
        }

        Ok(Some(LogicalMessage {
            message_id: header.message_id,
            class: header.class,
            text,
            binary: binary.freeze(),
        }))
    }
}

/// A timeout in the middle of a message means the device never sends the length it declared
fn truncated(e: BaichuanError, part: &str, received: usize) -> BaichuanError {
    match e {
        BaichuanError::Timeout(_) => BaichuanError::Protocol(format!("incomplete {}: only {} bytes arrived", part, received)),
        e => e,
    }
}

/// Collects a message's payload: the first `text_quota` bytes are text, everything after that
///  binary
struct Assembly {
    message_len: usize,
    text_quota: usize,
    text: BytesMut,
    binary: BytesMut,
}

impl Assembly {
    fn new(message_len: usize, text_quota: usize) -> Assembly {
        Assembly {
            message_len,
            text_quota,
            text: BytesMut::new(),
            binary: BytesMut::new(),
        }
    }

    fn received(&self) -> usize {
        self.text.len() + self.binary.len()
    }

    fn is_complete(&self) -> bool {
        self.received() >= self.message_len
    }

    /// returns the bytes beyond the end of the message
    fn append<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let wanted = self.message_len - self.received();
        let (payload, surplus) = data.split_at(wanted.min(data.len()));

        let to_text = self.text_quota.saturating_sub(self.text.len()).min(payload.len());
        self.text.extend_from_slice(&payload[..to_text]);
        self.binary.extend_from_slice(&payload[to_text..]);
        surplus
    }
}
