use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::UnknownFramePolicy;
use crate::media::frame::{Frame, CODEC_H264};


/// Turns the binary payloads of video messages into an H.264 elementary stream. Output
///  accumulates until the caller takes it, which the session does once per received message.
pub struct FrameDemuxer {
    unknown_frames: UnknownFramePolicy,
    stream: BytesMut,
}

impl FrameDemuxer {
    pub fn new(unknown_frames: UnknownFramePolicy) -> FrameDemuxer {
        FrameDemuxer {
            unknown_frames,
            stream: BytesMut::new(),
        }
    }

    pub fn push(&mut self, binary: &[u8]) {
        let frame = match Frame::parse(binary) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping binary record: {}", e);
                return;
            }
        };

        match frame {
            Frame::IFrame { codec, size, timestamp, payload } => {
                trace!("I-frame: codec {:#x}, {} bytes, timestamp {}", codec, size, timestamp);
                self.append_video(codec, payload);
            }
            Frame::PFrame { codec, size, payload } => {
                trace!("P-frame: codec {:#x}, {} bytes", codec, size);
                self.append_video(codec, payload);
            }
            Frame::AudioFrame { left_size, right_size } => {
                trace!("AAC frame (left {} bytes, right {} bytes)", left_size, right_size);
            }
            Frame::InfoRecord => {}
            Frame::Unknown(raw) => match self.unknown_frames {
                UnknownFramePolicy::PassThrough => self.stream.extend_from_slice(raw),
                UnknownFramePolicy::Drop => trace!("dropping {} bytes with unknown frame magic", raw.len()),
            },
        }
    }

    fn append_video(&mut self, codec: u32, payload: &[u8]) {
        if codec == CODEC_H264 {
            self.stream.extend_from_slice(payload);
        }
        else {
            trace!("skipping video payload with codec {:#x}", codec);
        }
    }

    /// everything accumulated since the previous call, possibly empty
    pub fn take_stream(&mut self) -> Bytes {
        self.stream.split().freeze()
    }
}
