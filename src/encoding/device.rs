//! Capability traits for the external encoder and muxer devices.
//!
//! These mirror the buffer-exchange protocol of stateful hardware encoders:
//! the caller borrows an empty input slot, fills and queues it, then borrows
//! filled output buffers and hands them back. Every call may fail with a
//! [`DeviceError`]; once `release()` has been called every further call must
//! fail with [`DeviceError::Released`].

use std::path::Path;
use std::time::Duration;

use crate::error::DeviceError;

use super::{BufferFlags, BufferInfo, ContainerFormat, EncoderFormat, TrackFormat};

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Outcome of asking the encoder for an empty input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDequeue {
    /// Slot index, valid until queued
    Slot(usize),
    /// No slot free within the timeout
    TryAgainLater,
}

/// Outcome of asking the encoder for output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDequeue {
    /// Output buffer index, valid until released
    Buffer(usize),
    /// The output format is final; fetch it with `output_format()`
    FormatChanged,
    /// Nothing available within the timeout
    TryAgainLater,
    /// Any other informational code (e.g. legacy "buffers changed")
    Info(i32),
}

/// A borrowed output buffer and the sample it contains
#[derive(Debug)]
pub struct OutputBuffer<'a> {
    pub data: &'a [u8],
    pub info: BufferInfo,
}

/// A stateful hardware video encoder
pub trait HardwareEncoder: Send {
    fn configure(&mut self, format: &EncoderFormat) -> DeviceResult<()>;

    fn start(&mut self) -> DeviceResult<()>;

    fn stop(&mut self) -> DeviceResult<()>;

    /// Free the native handle; the encoder is unusable afterwards
    fn release(&mut self) -> DeviceResult<()>;

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> DeviceResult<InputDequeue>;

    /// Writable region of an input slot returned by `dequeue_input_buffer`
    fn input_buffer(&mut self, index: usize) -> DeviceResult<&mut [u8]>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> DeviceResult<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DeviceResult<OutputDequeue>;

    fn output_buffer(&mut self, index: usize) -> DeviceResult<OutputBuffer<'_>>;

    fn output_format(&mut self) -> DeviceResult<TrackFormat>;

    /// Give an output buffer back to the encoder; `render` is never set by
    /// this pipeline since there is no output surface
    fn release_output_buffer(&mut self, index: usize, render: bool) -> DeviceResult<()>;
}

/// A container muxer writing one file
pub trait ContainerMuxer: Send {
    /// Register a track; only legal before `start()`
    fn add_track(&mut self, format: &TrackFormat) -> DeviceResult<usize>;

    fn start(&mut self) -> DeviceResult<()>;

    /// Write `data` (exactly the sample bytes) for `track`; only legal after `start()`
    fn write_sample_data(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> DeviceResult<()>;

    fn stop(&mut self) -> DeviceResult<()>;

    fn release(&mut self) -> DeviceResult<()>;
}

/// Creates device handles for one platform
pub trait DeviceFactory: Send + Sync {
    /// Construct an (unconfigured) encoder for `mime`
    fn create_encoder(&self, mime: &str) -> DeviceResult<Box<dyn HardwareEncoder>>;

    /// Construct a muxer bound to `path`; it is not started
    fn create_muxer(&self, path: &Path, container: ContainerFormat) -> DeviceResult<Box<dyn ContainerMuxer>>;
}
