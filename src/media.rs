//! Binary records of video messages, and their conversion to an elementary stream

pub mod demuxer;
pub mod frame;
