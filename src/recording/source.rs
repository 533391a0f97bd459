//! Camera frame source interface
//!
//! The recorder never talks to a camera directly. A platform provides a
//! [`FrameSource`] that announces new frames, hands out the latest CPU image
//! and converts a region of it to RGBA asynchronously.

use serde::{Deserialize, Serialize};

use crate::video::{PixelFormat, RawPixelBuffer};

/// A captured image held by the source until dropped
pub trait CpuImage: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Capture time on the source clock, in seconds
    fn timestamp_seconds(&self) -> f64;
}

/// Pixel rectangle inside a source image, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Region and output size of one conversion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionParams {
    pub input_rect: CropRect,
    pub output_width: u32,
    pub output_height: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    Ready,
    Failed,
}

/// Called once per announced frame
pub type FrameListener = Box<dyn Fn() + Send + Sync>;

/// Receives the outcome of `convert_async`; the buffer is empty on failure
pub type ConversionCallback = Box<dyn FnOnce(ConversionStatus, RawPixelBuffer) + Send>;

pub trait FrameSource: Send + Sync + 'static {
    type Image: CpuImage;

    /// Register the single listener for "new frame available"
    fn subscribe(&self, listener: FrameListener);

    /// Remove the listener. Once this returns the listener is never invoked again.
    fn unsubscribe(&self);

    fn acquire_latest_image(&self) -> anyhow::Result<Self::Image>;

    /// Convert `params.input_rect` of `image` to `params.format` at the output
    /// size. The image may be dropped as soon as this returns; `on_complete`
    /// runs later, possibly on another thread, possibly before this returns.
    fn convert_async(&self, image: &Self::Image, params: ConversionParams, on_complete: ConversionCallback);
}
