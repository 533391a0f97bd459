//! Encoder session state machine
//!
//! Drives a [`HardwareEncoder`] and a [`ContainerMuxer`] through one recording:
//!
//! ```text
//! Idle --start_encoding--> Encoding --complete--> Draining --> Idle
//! ```
//!
//! - Frames are submitted through the encoder's input slots with a short
//!   timeout; if no slot is free the frame is dropped, never retried.
//! - Output is drained after every submission. The muxer is started on the
//!   first format-change event, before any sample is written.
//! - `complete()` queues end-of-stream, drains until the end-of-stream sample
//!   comes out, then releases both devices. The muxer shutdown is best effort;
//!   encoder shutdown failures are returned.
//!
//! Device handles live in [`ActiveSession`], which releases them when dropped
//! if `complete()` never ran.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RecorderError, Result};
use crate::video::{PixelFormat, RawPixelBuffer};

use super::device::{ContainerMuxer, DeviceFactory, HardwareEncoder, InputDequeue, OutputDequeue};
use super::{BufferFlags, BufferInfo, ContainerFormat, EncoderFormat, EncodingOptions, Resolution, MIME_VIDEO_AVC};

/// Timeout for every input/output dequeue
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// Empty polls tolerated while waiting for the end-of-stream sample
pub const EOS_MAX_POLLS: u32 = 100;

/// Upper bound on output events handled by a single drain
const MAX_OUTPUTS_PER_DRAIN: usize = 32;

/// Log every Nth dropped frame at warn level
const DROP_LOG_INTERVAL: u64 = 30;

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Encoding,
    Draining,
}

/// What happened to a frame handed to [`EncoderSession::process_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Queued to the encoder
    Submitted,
    /// The session is not encoding; frame discarded
    NotEncoding,
    /// No input slot became free within the timeout; frame dropped
    NoInputSlot,
    /// Timestamp went backwards; frame dropped
    OutOfOrder,
}

/// Statistics from an encoding session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub samples_written: u64,
    pub bytes_written: u64,
    pub encoding_duration: Duration,
    pub average_fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStep {
    /// Handled an event, more may follow
    Continue,
    /// The end-of-stream sample was handled
    EndOfStream,
    /// Nothing available right now
    NoOutput,
}

/// Muxer plus the track/start bookkeeping that makes early writes impossible
struct MuxerHandle {
    device: Box<dyn ContainerMuxer>,
    track: Option<usize>,
    started: bool,
    released: bool,
}

impl MuxerHandle {
    fn new(device: Box<dyn ContainerMuxer>) -> Self {
        Self {
            device,
            track: None,
            started: false,
            released: false,
        }
    }

    fn write(&mut self, data: &[u8], info: &BufferInfo) -> Result<()> {
        let track = match (self.started, self.track) {
            (true, Some(track)) => track,
            _ => return Err(RecorderError::MuxerNotStarted),
        };
        self.device.write_sample_data(track, data, info)?;
        Ok(())
    }

    /// Stop and release, logging instead of failing; a partially written
    /// file is still worth keeping
    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        if self.started {
            if let Err(e) = self.device.stop() {
                log::warn!("[Muxer] Error stopping muxer: {}", e);
            }
            self.started = false;
        }
        if let Err(e) = self.device.release() {
            log::warn!("[Muxer] Error releasing muxer: {}", e);
        }
        self.released = true;
    }
}

/// Device handles and per-session bookkeeping while encoding
struct ActiveSession {
    encoder: Box<dyn HardwareEncoder>,
    muxer: MuxerHandle,
    resolution: Resolution,
    started_at: Instant,
    last_pts_us: Option<i64>,
    encoder_released: bool,
}

impl ActiveSession {
    fn submit(&mut self, frame: &RawPixelBuffer, pts_us: i64, stats: &mut EncoderStats) -> Result<FrameDisposition> {
        if let Some(last) = self.last_pts_us {
            if pts_us < last {
                record_drop(stats, "timestamp went backwards");
                return Ok(FrameDisposition::OutOfOrder);
            }
        }

        let index = match self.encoder.dequeue_input_buffer(DEQUEUE_TIMEOUT)? {
            InputDequeue::Slot(index) => index,
            InputDequeue::TryAgainLater => {
                record_drop(stats, "no input buffer available");
                return Ok(FrameDisposition::NoInputSlot);
            }
        };

        let len = frame.len();
        let slot = self.encoder.input_buffer(index)?;
        if slot.len() < len {
            let capacity = slot.len();
            // Hand the slot back empty so the encoder does not lose it
            if let Err(e) = self.encoder.queue_input_buffer(index, 0, pts_us, BufferFlags::empty()) {
                log::warn!("[Encoder] Failed to return undersized input slot {}: {}", index, e);
            }
            return Err(RecorderError::BufferTooSmall {
                capacity,
                required: len,
            });
        }
        slot[..len].copy_from_slice(frame.as_bytes());
        self.encoder.queue_input_buffer(index, len, pts_us, BufferFlags::empty())?;

        self.last_pts_us = Some(pts_us);
        stats.frames_submitted += 1;
        Ok(FrameDisposition::Submitted)
    }

    /// Handle output until the encoder has nothing more right now
    fn drain(&mut self, stats: &mut EncoderStats) -> Result<()> {
        for _ in 0..MAX_OUTPUTS_PER_DRAIN {
            match self.drain_step(stats)? {
                DrainStep::Continue => continue,
                DrainStep::EndOfStream | DrainStep::NoOutput => return Ok(()),
            }
        }
        Ok(())
    }

    fn drain_step(&mut self, stats: &mut EncoderStats) -> Result<DrainStep> {
        match self.encoder.dequeue_output_buffer(DEQUEUE_TIMEOUT)? {
            OutputDequeue::FormatChanged => {
                if self.muxer.started {
                    log::warn!("[Encoder] Output format changed after muxer start, ignoring");
                } else {
                    let format = self.encoder.output_format()?;
                    let track = self.muxer.device.add_track(&format)?;
                    self.muxer.track = Some(track);
                    self.muxer.device.start()?;
                    self.muxer.started = true;
                    log::debug!(
                        "[Encoder] Output format {} {}x{} ready, muxer started on track {}",
                        format.mime,
                        format.width,
                        format.height,
                        track
                    );
                }
                Ok(DrainStep::Continue)
            }
            OutputDequeue::Buffer(index) => {
                let written = self.write_output(index, stats);
                let released = self.encoder.release_output_buffer(index, false);
                let end_of_stream = written?;
                released?;
                Ok(if end_of_stream {
                    DrainStep::EndOfStream
                } else {
                    DrainStep::Continue
                })
            }
            OutputDequeue::TryAgainLater | OutputDequeue::Info(_) => Ok(DrainStep::NoOutput),
        }
    }

    /// Mux one output buffer; returns whether it carried end-of-stream
    fn write_output(&mut self, index: usize, stats: &mut EncoderStats) -> Result<bool> {
        let buffer = self.encoder.output_buffer(index)?;
        let info = buffer.info;

        if info.size > 0 {
            if self.muxer.started {
                let data = buffer.data.get(info.range()).ok_or(RecorderError::InvalidFrameSize {
                    expected: info.offset + info.size,
                    actual: buffer.data.len(),
                })?;
                self.muxer.write(data, &info)?;
                stats.samples_written += 1;
                stats.bytes_written += info.size as u64;
            } else {
                log::warn!(
                    "[Encoder] Dropping {} byte sample at {}us produced before the output format",
                    info.size,
                    info.presentation_time_us
                );
            }
        }

        Ok(info.is_end_of_stream())
    }

    /// Queue end-of-stream and drain until the encoder confirms it
    fn flush(&mut self, stats: &mut EncoderStats) -> Result<()> {
        let eos_pts = self.last_pts_us.unwrap_or(0);
        let mut queued = false;

        for _ in 0..EOS_MAX_POLLS {
            match self.encoder.dequeue_input_buffer(DEQUEUE_TIMEOUT)? {
                InputDequeue::Slot(index) => {
                    self.encoder.queue_input_buffer(index, 0, eos_pts, BufferFlags::END_OF_STREAM)?;
                    queued = true;
                    break;
                }
                InputDequeue::TryAgainLater => {
                    // Free up a slot by taking output
                    if self.drain_step(stats)? == DrainStep::EndOfStream {
                        return Ok(());
                    }
                }
            }
        }
        if !queued {
            log::warn!("[Encoder] No input buffer for end-of-stream, draining what is left");
        }

        let mut idle_polls = 0;
        while idle_polls < EOS_MAX_POLLS {
            match self.drain_step(stats)? {
                DrainStep::EndOfStream => {
                    log::debug!("[Encoder] End of stream reached");
                    return Ok(());
                }
                DrainStep::Continue => idle_polls = 0,
                DrainStep::NoOutput => idle_polls += 1,
            }
        }

        log::warn!("[Encoder] End of stream not observed after {} polls", EOS_MAX_POLLS);
        Ok(())
    }

    fn shutdown_encoder(&mut self) -> Result<()> {
        if self.encoder_released {
            return Ok(());
        }
        self.encoder_released = true;
        let stopped = self.encoder.stop();
        let released = self.encoder.release();
        stopped?;
        released?;
        Ok(())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.encoder_released && self.muxer.released {
            return;
        }
        log::warn!("[Encoder] Session dropped while encoding, releasing devices");
        self.muxer.shutdown();
        if let Err(e) = self.shutdown_encoder() {
            log::error!("[Encoder] Failed to release encoder: {}", e);
        }
    }
}

fn record_drop(stats: &mut EncoderStats, reason: &str) {
    stats.frames_dropped += 1;
    let dropped = stats.frames_dropped;
    if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
        log::warn!("[Encoder] Dropped frame ({}), {} dropped so far", reason, dropped);
    } else {
        log::trace!("[Encoder] Dropped frame ({})", reason);
    }
}

/// Owns the encoder and muxer for one recording at a time
pub struct EncoderSession {
    factory: Arc<dyn DeviceFactory>,
    phase: SessionPhase,
    active: Option<ActiveSession>,
    stats: EncoderStats,
}

/// Puts the session back to Idle however `complete()` exits
struct IdleOnDrop<'a>(&'a mut SessionPhase);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *self.0 = SessionPhase::Idle;
    }
}

impl EncoderSession {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            phase: SessionPhase::Idle,
            active: None,
            stats: EncoderStats::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_encoding(&self) -> bool {
        self.phase == SessionPhase::Encoding
    }

    /// Statistics of the current session, or of the last completed one
    pub fn stats(&self) -> EncoderStats {
        self.stats.clone()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.active.as_ref().map(|a| a.resolution)
    }

    /// Create, configure and start the encoder and create the muxer.
    ///
    /// A no-op if already encoding. On failure every device created so far
    /// is released and the session stays idle.
    pub fn start_encoding(&mut self, options: &EncodingOptions) -> Result<()> {
        if self.phase != SessionPhase::Idle {
            log::warn!("[Encoder] Already encoding, ignoring start");
            return Ok(());
        }

        let format = EncoderFormat::avc(options);
        let path = options.output_path();
        log::debug!(
            "[Encoder] Starting {} {}x{}@{} at {} bps, key frame every {}s",
            format.mime,
            format.width,
            format.height,
            format.frame_rate,
            format.bitrate,
            format.key_frame_interval_secs
        );

        let mut encoder = self
            .factory
            .create_encoder(MIME_VIDEO_AVC)
            .map_err(RecorderError::EncoderInit)?;

        if let Err(e) = encoder.configure(&format).and_then(|_| encoder.start()) {
            log::error!("[Encoder] Failed to start encoder: {}", e);
            if let Err(release_err) = encoder.release() {
                log::warn!("[Encoder] Failed to release encoder after init failure: {}", release_err);
            }
            return Err(RecorderError::EncoderInit(e));
        }

        let muxer = match self.factory.create_muxer(&path, ContainerFormat::Mp4) {
            Ok(muxer) => muxer,
            Err(e) => {
                log::error!("[Encoder] Failed to create muxer for {:?}: {}", path, e);
                let stopped = encoder.stop();
                let released = encoder.release();
                if let Err(cleanup_err) = stopped.and(released) {
                    log::warn!("[Encoder] Failed to release encoder after init failure: {}", cleanup_err);
                }
                return Err(RecorderError::EncoderInit(e));
            }
        };

        self.active = Some(ActiveSession {
            encoder,
            muxer: MuxerHandle::new(muxer),
            resolution: options.resolution,
            started_at: Instant::now(),
            last_pts_us: None,
            encoder_released: false,
        });
        self.stats = EncoderStats::default();
        self.phase = SessionPhase::Encoding;
        log::info!("[Encoder] Started encoding to {:?}", path);
        Ok(())
    }

    /// Encode one planar frame at `pts_us`.
    ///
    /// Takes ownership of `frame`; it is released when this returns, whatever
    /// the outcome. Frames arriving while not encoding are discarded without
    /// touching the devices.
    pub fn process_frame(&mut self, frame: RawPixelBuffer, pts_us: i64) -> Result<FrameDisposition> {
        let active = match (self.phase, self.active.as_mut()) {
            (SessionPhase::Encoding, Some(active)) => active,
            _ => return Ok(FrameDisposition::NotEncoding),
        };

        let expected = active.resolution.planar_len();
        if frame.format() != PixelFormat::Yuv420 || frame.len() != expected {
            return Err(RecorderError::InvalidFrameSize {
                expected,
                actual: frame.len(),
            });
        }

        let disposition = active.submit(&frame, pts_us, &mut self.stats)?;
        drop(frame);
        if disposition == FrameDisposition::Submitted {
            active.drain(&mut self.stats)?;
        }
        Ok(disposition)
    }

    /// Flush, write end-of-stream and release both devices.
    ///
    /// Returns `Ok(None)` when not encoding. The session is idle afterwards
    /// whether or not this succeeds.
    pub fn complete(&mut self) -> Result<Option<EncoderStats>> {
        if self.phase != SessionPhase::Encoding {
            log::debug!("[Encoder] Not encoding, nothing to complete");
            return Ok(None);
        }
        let Some(mut active) = self.active.take() else {
            self.phase = SessionPhase::Idle;
            return Ok(None);
        };

        self.phase = SessionPhase::Draining;
        let _idle = IdleOnDrop(&mut self.phase);

        let flushed = active.flush(&mut self.stats);
        if let Err(e) = &flushed {
            log::error!("[Encoder] Failed to finish encoding: {}", e);
        }

        active.muxer.shutdown();
        let encoder_shutdown = active.shutdown_encoder();
        if let Err(e) = &encoder_shutdown {
            log::error!("[Encoder] Failed to stop/release encoder: {}", e);
        }

        let elapsed = active.started_at.elapsed();
        self.stats.encoding_duration = elapsed;
        self.stats.average_fps = if elapsed.as_secs_f64() > 0.0 {
            self.stats.frames_submitted as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        drop(active);

        encoder_shutdown?;
        flushed?;

        log::info!(
            "[Encoder] Finished: {} frames, {} dropped, {} samples, {} bytes, {:.1} fps",
            self.stats.frames_submitted,
            self.stats.frames_dropped,
            self.stats.samples_written,
            self.stats.bytes_written,
            self.stats.average_fps
        );
        Ok(Some(self.stats.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::test_harness::{EncoderCall, MockDeviceFactory, MockEncoderConfig, MuxerCall, START_CODE};

    fn options(width: u32, height: u32) -> EncodingOptions {
        EncodingOptions::new(Resolution::new(width, height, 30).unwrap(), "/tmp/out", "test.mp4")
    }

    fn planar(width: u32, height: u32, fill: u8) -> RawPixelBuffer {
        RawPixelBuffer::new(vec![fill; (width * height * 3 / 2) as usize], PixelFormat::Yuv420)
    }

    fn started(factory: &Arc<MockDeviceFactory>) -> EncoderSession {
        let mut session = EncoderSession::new(factory.clone());
        session.start_encoding(&options(4, 4)).unwrap();
        session
    }

    #[test]
    fn test_start_configures_avc_and_creates_muxer() {
        let factory = Arc::new(MockDeviceFactory::new());
        let session = started(&factory);
        assert_eq!(session.phase(), SessionPhase::Encoding);

        let encoder = factory.encoder(0);
        let format = encoder.configured_format().unwrap();
        assert_eq!(format.mime, "video/avc");
        assert_eq!((format.width, format.height, format.frame_rate), (4, 4, 30));
        assert_eq!(format.bitrate, (4.0f64 * 4.0 * 30.0 * 0.145).round() as u32);
        assert!(encoder.is_started());

        let muxer = factory.muxer(0);
        assert_eq!(muxer.path(), std::path::PathBuf::from("/tmp/out/test.mp4"));
        assert!(!muxer.is_started());
    }

    #[test]
    fn test_start_twice_is_noop() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        session.start_encoding(&options(4, 4)).unwrap();
        assert_eq!(factory.encoders_created(), 1);
        assert_eq!(factory.muxers_created(), 1);
    }

    #[test]
    fn test_start_failure_releases_encoder() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            fail_start: true,
            ..Default::default()
        }));
        let mut session = EncoderSession::new(factory.clone());
        let err = session.start_encoding(&options(4, 4)).unwrap_err();
        assert!(matches!(err, RecorderError::EncoderInit(_)));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(factory.encoder(0).is_released());
        assert_eq!(factory.muxers_created(), 0);
    }

    #[test]
    fn test_muxer_creation_failure_releases_encoder() {
        let factory = Arc::new(MockDeviceFactory::new());
        factory.fail_muxer_creation(true);
        let mut session = EncoderSession::new(factory.clone());
        let err = session.start_encoding(&options(4, 4)).unwrap_err();
        assert!(matches!(err, RecorderError::EncoderInit(DeviceError::Backend(_))));
        assert!(factory.encoder(0).is_released());
        assert!(!session.is_encoding());
    }

    #[test]
    fn test_process_frame_while_idle_touches_nothing() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = EncoderSession::new(factory.clone());
        let result = session.process_frame(planar(4, 4, 0), 0).unwrap();
        assert_eq!(result, FrameDisposition::NotEncoding);
        assert_eq!(factory.encoders_created(), 0);

        // After completion the old encoder must not see the frame either
        let mut session = started(&factory);
        session.complete().unwrap();
        let calls_before = factory.encoder(0).call_count();
        assert_eq!(session.process_frame(planar(4, 4, 0), 10).unwrap(), FrameDisposition::NotEncoding);
        assert_eq!(factory.encoder(0).call_count(), calls_before);
    }

    #[test]
    fn test_format_change_starts_muxer_before_first_sample() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);

        session.process_frame(planar(4, 4, 1), 0).unwrap();
        let muxer = factory.muxer(0);
        assert!(muxer.is_started());
        assert_eq!(muxer.samples().len(), 0);

        session.process_frame(planar(4, 4, 2), 33_333).unwrap();
        let calls = muxer.calls();
        let start_at = calls.iter().position(|c| *c == MuxerCall::Start).unwrap();
        let add_at = calls.iter().position(|c| matches!(c, MuxerCall::AddTrack(_))).unwrap();
        let first_write = calls.iter().position(|c| matches!(c, MuxerCall::Write { .. })).unwrap();
        assert!(add_at < start_at && start_at < first_write);
        assert_eq!(muxer.samples()[0].info.presentation_time_us, 0);
    }

    #[test]
    fn test_three_frames_then_complete_writes_eos_and_releases() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);

        for pts in [0, 33_333, 66_666] {
            assert_eq!(session.process_frame(planar(4, 4, 7), pts).unwrap(), FrameDisposition::Submitted);
        }
        let stats = session.complete().unwrap().unwrap();
        assert_eq!(stats.frames_submitted, 3);
        assert_eq!(stats.samples_written, 3);
        assert_eq!(session.phase(), SessionPhase::Idle);

        let muxer = factory.muxer(0);
        let samples = muxer.samples();
        assert!(samples.iter().any(|s| s.info.is_end_of_stream()));
        let pts: Vec<i64> = samples.iter().map(|s| s.info.presentation_time_us).collect();
        assert_eq!(pts, vec![0, 33_333, 66_666]);
        // Only the [offset, offset + size) range reaches the muxer
        assert!(samples.iter().all(|s| s.data.starts_with(&START_CODE)));
        assert!(muxer.is_released());

        let encoder = factory.encoder(0);
        assert!(encoder.is_released());
        assert_eq!(encoder.outstanding_output_buffers(), 0);
        let err = encoder.probe_dequeue_input().unwrap_err();
        assert!(matches!(RecorderError::from(err), RecorderError::DeviceCall(DeviceError::Released)));
    }

    #[test]
    fn test_complete_is_idempotent() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 0).unwrap();
        assert!(session.complete().unwrap().is_some());
        assert!(session.complete().unwrap().is_none());
        assert_eq!(session.phase(), SessionPhase::Idle);

        let mut never_started = EncoderSession::new(factory);
        assert!(never_started.complete().unwrap().is_none());
    }

    #[test]
    fn test_no_input_slot_drops_frame_without_retry() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            input_slots: 1,
            ..Default::default()
        }));
        let mut session = started(&factory);
        factory.encoder(0).set_input_starved(true);

        let result = session.process_frame(planar(4, 4, 0), 0).unwrap();
        assert_eq!(result, FrameDisposition::NoInputSlot);
        assert_eq!(session.stats().frames_dropped, 1);
        assert_eq!(factory.encoder(0).queued_inputs(), 0);

        factory.encoder(0).set_input_starved(false);
        assert_eq!(session.process_frame(planar(4, 4, 0), 1).unwrap(), FrameDisposition::Submitted);
    }

    #[test]
    fn test_undersized_slot_fails_without_overrun() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            input_capacity: Some(10),
            ..Default::default()
        }));
        let mut session = started(&factory);
        let err = session.process_frame(planar(4, 4, 0), 0).unwrap_err();
        assert!(matches!(err, RecorderError::BufferTooSmall { capacity: 10, required: 24 }));
        // Slot was handed back, nothing was submitted
        assert_eq!(factory.encoder(0).free_input_slots(), MockEncoderConfig::default().input_slots);
        assert_eq!(session.stats().frames_submitted, 0);
        assert!(session.is_encoding());
    }

    #[test]
    fn test_wrong_frame_size_rejected_before_device() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        let calls = factory.encoder(0).call_count();
        let err = session.process_frame(planar(2, 2, 0), 0).unwrap_err();
        assert!(matches!(err, RecorderError::InvalidFrameSize { expected: 24, actual: 6 }));
        let packed = RawPixelBuffer::new(vec![0; 24], PixelFormat::Argb32);
        assert!(session.process_frame(packed, 0).is_err());
        assert_eq!(factory.encoder(0).call_count(), calls);
    }

    #[test]
    fn test_backwards_timestamp_is_dropped() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 100).unwrap();
        assert_eq!(session.process_frame(planar(4, 4, 0), 50).unwrap(), FrameDisposition::OutOfOrder);
        assert_eq!(session.process_frame(planar(4, 4, 0), 100).unwrap(), FrameDisposition::Submitted);
        assert_eq!(session.stats().frames_dropped, 1);
    }

    #[test]
    fn test_muxer_stop_failure_is_swallowed() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 0).unwrap();
        factory.muxer(0).fail_stop(true);

        assert!(session.complete().is_ok());
        assert!(factory.muxer(0).is_released());
        assert!(factory.encoder(0).is_released());
    }

    #[test]
    fn test_encoder_release_failure_is_propagated_and_session_idles() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            fail_release: true,
            ..Default::default()
        }));
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 0).unwrap();

        let err = session.complete().unwrap_err();
        assert!(matches!(err, RecorderError::DeviceCall(_)));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(factory.muxer(0).is_released());
        assert!(session.complete().unwrap().is_none());
    }

    #[test]
    fn test_encoder_stop_failure_is_propagated_after_release() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            fail_stop: true,
            ..Default::default()
        }));
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 0).unwrap();

        let err = session.complete().unwrap_err();
        assert!(matches!(err, RecorderError::DeviceCall(DeviceError::Backend(_))));
        assert_eq!(session.phase(), SessionPhase::Idle);
        // A failed stop still releases both devices
        assert!(factory.encoder(0).is_released());
        assert!(factory.muxer(0).is_released());
    }

    #[test]
    fn test_muxer_release_failure_is_swallowed() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        session.process_frame(planar(4, 4, 0), 0).unwrap();
        session.process_frame(planar(4, 4, 1), 33_333).unwrap();
        let muxer = factory.muxer(0);
        muxer.fail_release(true);

        let stats = session.complete().unwrap().unwrap();
        assert_eq!(stats.samples_written, 2);
        assert_eq!(muxer.tracks().len(), 1);
        assert_eq!(muxer.calls().last(), Some(&MuxerCall::Release));
        assert!(muxer.is_released());
        assert!(factory.encoder(0).is_released());
    }

    #[test]
    fn test_starved_end_of_stream_gives_up_after_bounded_polls() {
        let factory = Arc::new(MockDeviceFactory::new());
        let mut session = started(&factory);
        for i in 0..3 {
            session.process_frame(planar(4, 4, i), i as i64 * 33_333).unwrap();
        }
        let encoder = factory.encoder(0);
        let calls_before = encoder.call_count();
        encoder.set_input_starved(true);

        let stats = session.complete().unwrap().unwrap();

        let during_complete = &encoder.calls()[calls_before..];
        let input_attempts = during_complete
            .iter()
            .filter(|c| **c == EncoderCall::DequeueInput)
            .count();
        let output_attempts = during_complete
            .iter()
            .filter(|c| **c == EncoderCall::DequeueOutput)
            .count();
        assert_eq!(input_attempts, EOS_MAX_POLLS as usize);
        // One output drain between every input attempt, then the idle drain
        assert!(output_attempts >= 2 * EOS_MAX_POLLS as usize);
        assert!(!during_complete
            .iter()
            .any(|c| matches!(c, EncoderCall::QueueInput { flags, .. } if flags.contains(BufferFlags::END_OF_STREAM))));

        // The held-back last frame never comes out without end-of-stream
        let muxer = factory.muxer(0);
        assert_eq!(stats.samples_written, 2);
        assert!(!muxer.samples().iter().any(|s| s.info.is_end_of_stream()));
        assert!(muxer.is_released());
        assert!(encoder.is_released());
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_drop_while_encoding_releases_devices() {
        let factory = Arc::new(MockDeviceFactory::new());
        {
            let mut session = started(&factory);
            session.process_frame(planar(4, 4, 0), 0).unwrap();
        }
        assert!(factory.encoder(0).is_released());
        assert!(factory.muxer(0).is_released());
    }

    #[test]
    fn test_samples_before_format_change_are_not_written() {
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            announce_format: false,
            ..Default::default()
        }));
        let mut session = started(&factory);
        for pts in [0, 10, 20] {
            session.process_frame(planar(4, 4, 0), pts).unwrap();
        }
        session.complete().unwrap();
        let muxer = factory.muxer(0);
        assert!(muxer.samples().is_empty());
        assert!(!muxer.calls().iter().any(|c| *c == MuxerCall::Start));
        assert_eq!(factory.encoder(0).outstanding_output_buffers(), 0);
    }

    #[test]
    fn test_muxer_handle_refuses_write_before_start() {
        let factory = MockDeviceFactory::new();
        let device = factory
            .create_muxer(std::path::Path::new("/tmp/x.mp4"), ContainerFormat::Mp4)
            .unwrap();
        let mut handle = MuxerHandle::new(device);
        let err = handle.write(&[1, 2, 3], &BufferInfo::default()).unwrap_err();
        assert!(matches!(err, RecorderError::MuxerNotStarted));
        assert!(factory.muxer(0).samples().is_empty());
    }
}
