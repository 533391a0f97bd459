// Frame buffers, colour conversion and scene/camera compositing
//
// Buffers move through the pipeline by value: every handoff transfers
// ownership and the receiver drops (releases) the buffer when it is done.

pub mod compose;
pub mod convert;

pub use compose::{CameraTexture, FrameCompositor, RenderTarget, RenderTargetPool, SceneRenderer};
pub use convert::convert_argb_to_yuv420;

use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};

/// Pixel layout of a [`RawPixelBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4 bytes per pixel, channel order A,R,G,B
    Argb32,
    /// Packed 4 bytes per pixel, channel order R,G,B,A
    Rgba32,
    /// Planar 4:2:0: full-size Y plane followed by an interleaved U,V plane
    Yuv420,
}

impl PixelFormat {
    /// Number of bytes a `width` x `height` frame occupies in this format
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Argb32 | PixelFormat::Rgba32 => pixels * 4,
            PixelFormat::Yuv420 => pixels * 3 / 2,
        }
    }

    pub fn is_packed(&self) -> bool {
        !matches!(self, PixelFormat::Yuv420)
    }
}

/// One frame of pixel data, exclusively owned.
///
/// Dropping the buffer releases it; the type is deliberately not `Clone`
/// so a frame can never be released twice or read after release.
#[derive(Debug, PartialEq, Eq)]
pub struct RawPixelBuffer {
    data: Vec<u8>,
    format: PixelFormat,
}

impl RawPixelBuffer {
    pub fn new(data: Vec<u8>, format: PixelFormat) -> Self {
        Self { data, format }
    }

    /// Wrap `data`, checking it holds exactly one `width` x `height` frame
    pub fn with_dimensions(data: Vec<u8>, format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let expected = format.frame_len(width, height);
        if data.len() != expected {
            return Err(RecorderError::InvalidFrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, format })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
