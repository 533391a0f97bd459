// Hardware encoding and container muxing
//
// This module owns everything between a planar frame and a file on disk:
// - `options`: per-session resolution / bitrate / key frame parameters
// - `device`: typed capability traits for the encoder and muxer devices
// - `encoder`: the session state machine driving the buffer exchange
// - `gst`: GStreamer-backed devices (feature "gst")
//
// To add a new platform binding, implement `HardwareEncoder`,
// `ContainerMuxer` and `DeviceFactory` for it; the session never touches
// platform types directly.

pub mod device;
pub mod encoder;
#[cfg(feature = "gst")]
pub mod gst;
pub mod options;

pub use device::{ContainerMuxer, DeviceFactory, HardwareEncoder, InputDequeue, OutputDequeue};
pub use encoder::{EncoderSession, EncoderStats, FrameDisposition, SessionPhase};
pub use options::{EncodingOptions, Resolution, ResolutionQuality};

use serde::{Deserialize, Serialize};

/// MIME type of the only codec the pipeline produces
pub const MIME_VIDEO_AVC: &str = "video/avc";

/// Flexible YUV 4:2:0 colour format id understood by hardware encoders
pub const COLOR_FORMAT_YUV420_FLEXIBLE: i32 = 0x7F42_0888;

bitflags::bitflags! {
    /// Flags carried by encoder input and output buffers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// The buffer holds a key frame
        const KEY_FRAME = 0x1;
        /// Codec initialisation data (SPS/PPS) instead of media data
        const CODEC_CONFIG = 0x2;
        /// Last buffer of the stream
        const END_OF_STREAM = 0x4;
        /// Only part of a frame
        const PARTIAL_FRAME = 0x8;
    }
}

/// Placement and timing of one encoded sample inside an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    /// Byte range of the sample within its buffer
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Parameters an encoder is configured with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub key_frame_interval_secs: u32,
    pub color_format: i32,
    pub low_latency: bool,
    pub priority: i32,
}

impl EncoderFormat {
    /// H.264 configuration for a session
    pub fn avc(options: &EncodingOptions) -> Self {
        Self {
            mime: MIME_VIDEO_AVC.to_string(),
            width: options.resolution.width,
            height: options.resolution.height,
            frame_rate: options.resolution.frame_rate,
            bitrate: options.bitrate(),
            key_frame_interval_secs: options.key_frame_interval_secs,
            color_format: COLOR_FORMAT_YUV420_FLEXIBLE,
            low_latency: options.low_latency_mode,
            priority: options.priority,
        }
    }
}

/// Finalized output format reported by the encoder after it has started
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Codec specific data (avcC / SPS+PPS), empty if carried in-band
    pub codec_specific_data: Vec<u8>,
}

/// Container written by the muxer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
        }
    }
}
