//! Recording session controller
//!
//! Ties a [`FrameSource`] to the compositor, the colour converter and the
//! encoder session. Every frame notification and conversion callback runs
//! under one lock, so the encoder session never sees two frames at once.
//! Requests to the source (`subscribe`, `convert_async`) are made with the
//! lock released since a source may call back inline. Start and stop are
//! serialized by a second lock held across those requests, so a stop can
//! never run between a start's state change and its subscription.

use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::encoding::{DeviceFactory, EncoderSession, EncoderStats, EncodingOptions, FrameDisposition, Resolution};
use crate::error::{RecorderError, Result};
use crate::video::{convert_argb_to_yuv420, CameraTexture, FrameCompositor, PixelFormat, RawPixelBuffer, SceneRenderer};

use super::source::{ConversionParams, ConversionStatus, CpuImage, CropRect, FrameSource};
use super::RecordingState;

/// Where to read from the source image and how large to convert it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropGeometry {
    pub input: CropRect,
    pub output_width: u32,
    pub output_height: u32,
}

/// Centered crop of an `image_width` x `image_height` source for `target`.
///
/// The crop is the target size scaled by `crop_ratio`, never smaller than the
/// target and never larger than the image. The output is the target size,
/// or the crop size if the image is too small to provide it.
pub fn crop_geometry(image_width: u32, image_height: u32, target: &Resolution, crop_ratio: f32) -> CropGeometry {
    let axis = |target_len: u32, image_len: u32| {
        let scaled = (target_len as f64 * crop_ratio as f64).round() as u32;
        scaled.max(target_len).min(image_len)
    };
    let width = axis(target.width, image_width);
    let height = axis(target.height, image_height);

    CropGeometry {
        input: CropRect {
            x: (image_width - width) / 2,
            y: (image_height - height) / 2,
            width,
            height,
        },
        output_width: target.width.min(width),
        output_height: target.height.min(height),
    }
}

struct Inner<R> {
    state: RecordingState,
    encoder: EncoderSession,
    compositor: Option<FrameCompositor>,
    resolution: Option<Resolution>,
    scene: R,
    crop_ratio: f32,
    /// Bumped on every start so callbacks from an earlier session are ignored
    generation: u64,
}

struct Shared<S, R> {
    source: S,
    /// Held for the whole of start and stop, across subscribe/unsubscribe
    lifecycle: Mutex<()>,
    inner: Mutex<Inner<R>>,
}

/// Records composited camera frames to a video file
pub struct VideoRecorder<S, R>
where
    S: FrameSource,
    R: SceneRenderer + Send + 'static,
{
    shared: Arc<Shared<S, R>>,
}

impl<S, R> VideoRecorder<S, R>
where
    S: FrameSource,
    R: SceneRenderer + Send + 'static,
{
    pub fn new(source: S, scene: R, factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                lifecycle: Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: RecordingState::new(),
                    encoder: EncoderSession::new(factory),
                    compositor: None,
                    resolution: None,
                    scene,
                    crop_ratio: 1.0,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.inner.lock().state.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.inner.lock().state.is_recording()
    }

    pub fn is_encoding(&self) -> bool {
        self.shared.inner.lock().encoder.is_encoding()
    }

    pub fn encoder_stats(&self) -> EncoderStats {
        self.shared.inner.lock().encoder.stats()
    }

    pub fn crop_ratio(&self) -> f32 {
        self.shared.inner.lock().crop_ratio
    }

    /// Extra source area to capture around the target; applies from the next frame
    pub fn set_crop_ratio(&self, crop_ratio: f32) -> Result<()> {
        if !crop_ratio.is_finite() || crop_ratio <= 0.0 {
            return Err(RecorderError::Composition(anyhow!("invalid crop ratio {}", crop_ratio)));
        }
        self.shared.inner.lock().crop_ratio = crop_ratio;
        Ok(())
    }

    /// Start encoding and subscribe to the frame source. No-op if already recording.
    pub fn start_recording(&self, options: EncodingOptions) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock();
        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_recording() {
                log::warn!("[Recorder] Already recording, ignoring start");
                return Ok(());
            }

            let compositor = FrameCompositor::new(options.resolution);
            inner.encoder.start_encoding(&options)?;

            inner.compositor = Some(compositor);
            inner.resolution = Some(options.resolution);
            inner.generation += 1;
            inner.state = RecordingState::start();
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared.source.subscribe(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_frame_available();
            }
        }));

        log::info!(
            "[Recorder] Recording {}x{}@{} to {:?}",
            options.resolution.width,
            options.resolution.height,
            options.resolution.frame_rate,
            options.output_path()
        );
        Ok(())
    }

    /// Unsubscribe, finish the file and reset. No-op if not recording.
    ///
    /// Returns the encoder statistics; encoder shutdown failures are
    /// returned after the recorder has been reset.
    pub fn stop_recording(&self) -> Result<Option<EncoderStats>> {
        let _lifecycle = self.shared.lifecycle.lock();
        if !self.is_recording() {
            log::debug!("[Recorder] Not recording, nothing to stop");
            return Ok(None);
        }

        self.shared.source.unsubscribe();

        let mut inner = self.shared.inner.lock();
        if !inner.state.is_recording() {
            return Ok(None);
        }
        let frames = inner.state.frame_count;
        let duration = inner.state.duration();

        let completed = inner.encoder.complete();
        if let Some(compositor) = inner.compositor.take() {
            compositor.pool().purge();
        }
        inner.resolution = None;
        inner.state = inner.state.reset();

        log::info!("[Recorder] Stopped after {} frames in {:.1}s", frames, duration.as_secs_f64());
        completed
    }
}

impl<S, R> Drop for VideoRecorder<S, R>
where
    S: FrameSource,
    R: SceneRenderer + Send + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.stop_recording() {
            log::error!("[Recorder] Error stopping recording on drop: {}", e);
        }
    }
}

impl<S, R> Shared<S, R>
where
    S: FrameSource,
    R: SceneRenderer + Send + 'static,
{
    fn on_frame_available(self: Arc<Self>) {
        let (image, params, pts_us, generation) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_recording() {
                return;
            }
            let Some(resolution) = inner.resolution else {
                return;
            };

            let image = match self.source.acquire_latest_image() {
                Ok(image) => image,
                Err(e) => {
                    let err = RecorderError::Source(e.to_string());
                    log::warn!("[Recorder] Skipping frame: {}", err);
                    return;
                }
            };

            let geometry = crop_geometry(image.width(), image.height(), &resolution, inner.crop_ratio);
            let params = ConversionParams {
                input_rect: geometry.input,
                output_width: geometry.output_width,
                output_height: geometry.output_height,
                format: PixelFormat::Rgba32,
            };
            let pts_us = (image.timestamp_seconds() * 1_000_000.0) as i64;
            inner.state = inner.state.with_frame_counted();
            (image, params, pts_us, inner.generation)
        };

        let weak: Weak<Self> = Arc::downgrade(&self);
        self.source.convert_async(
            &image,
            params,
            Box::new(move |status, buffer| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_conversion_complete(generation, status, buffer, params, pts_us);
                }
            }),
        );
        drop(image);
    }

    fn on_conversion_complete(
        &self,
        generation: u64,
        status: ConversionStatus,
        buffer: RawPixelBuffer,
        params: ConversionParams,
        pts_us: i64,
    ) {
        if status != ConversionStatus::Ready {
            log::trace!("[Recorder] Conversion failed, dropping frame at {}us", pts_us);
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.state.is_recording() || inner.generation != generation {
            log::debug!("[Recorder] Conversion finished after stop, dropping frame at {}us", pts_us);
            return;
        }
        let (Some(compositor), Some(resolution)) = (inner.compositor.as_mut(), inner.resolution) else {
            return;
        };

        let result = encode_frame(
            compositor,
            &mut inner.scene,
            &mut inner.encoder,
            &resolution,
            buffer,
            params,
            inner.crop_ratio,
            pts_us,
        );
        match result {
            Ok(FrameDisposition::Submitted) => log::trace!("[Recorder] Encoded frame at {}us", pts_us),
            Ok(other) => log::trace!("[Recorder] Frame at {}us not encoded: {:?}", pts_us, other),
            Err(e) if e.is_per_frame() => log::warn!("[Recorder] Skipping frame at {}us: {}", pts_us, e),
            Err(e) => log::error!("[Recorder] Encoder error at {}us: {}", pts_us, e),
        }
    }
}

/// Converted camera image -> composite -> planar -> encoder
#[allow(clippy::too_many_arguments)]
fn encode_frame<R: SceneRenderer + ?Sized>(
    compositor: &mut FrameCompositor,
    scene: &mut R,
    encoder: &mut EncoderSession,
    resolution: &Resolution,
    buffer: RawPixelBuffer,
    params: ConversionParams,
    crop_ratio: f32,
    pts_us: i64,
) -> Result<FrameDisposition> {
    let camera = CameraTexture::from_buffer(buffer, params.output_width, params.output_height)?;
    let packed = compositor.compose(&camera, scene, crop_ratio)?;
    drop(camera);
    let planar = convert_argb_to_yuv420(&packed, resolution)?;
    drop(packed);
    encoder.process_frame(planar, pts_us)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{
        ConversionMode, FlatSceneRenderer, MockDeviceFactory, MockEncoderConfig, ScriptedFrameSource, ScriptedImage,
    };
    use crate::recording::source::{ConversionCallback, FrameListener};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Scripted source whose `subscribe` waits until the test opens the gate
    struct GatedSource {
        inner: ScriptedFrameSource,
        entered: Mutex<mpsc::Sender<()>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl FrameSource for GatedSource {
        type Image = ScriptedImage;

        fn subscribe(&self, listener: FrameListener) {
            let _ = self.entered.lock().send(());
            let _ = self.gate.lock().recv_timeout(Duration::from_secs(5));
            self.inner.subscribe(listener);
        }

        fn unsubscribe(&self) {
            self.inner.unsubscribe();
        }

        fn acquire_latest_image(&self) -> anyhow::Result<ScriptedImage> {
            self.inner.acquire_latest_image()
        }

        fn convert_async(&self, image: &ScriptedImage, params: ConversionParams, on_complete: ConversionCallback) {
            self.inner.convert_async(image, params, on_complete);
        }
    }

    fn options() -> EncodingOptions {
        EncodingOptions::new(Resolution::new(8, 4, 30).unwrap(), "/tmp/mixcap", "clip.mp4")
    }

    fn recorder(
        mode: ConversionMode,
    ) -> (
        VideoRecorder<ScriptedFrameSource, FlatSceneRenderer>,
        ScriptedFrameSource,
        Arc<MockDeviceFactory>,
    ) {
        let source = ScriptedFrameSource::new(16, 8).with_mode(mode);
        let factory = Arc::new(MockDeviceFactory::new());
        let recorder = VideoRecorder::new(source.clone(), FlatSceneRenderer::transparent(), factory.clone());
        (recorder, source, factory)
    }

    #[test]
    fn test_crop_geometry_centers_target_in_larger_image() {
        let target = Resolution::new(1280, 720, 30).unwrap();
        let geometry = crop_geometry(1920, 1080, &target, 1.0);
        assert_eq!(
            geometry.input,
            CropRect {
                x: 320,
                y: 180,
                width: 1280,
                height: 720
            }
        );
        assert_eq!((geometry.input.right(), geometry.input.bottom()), (1600, 900));
        assert_eq!((geometry.output_width, geometry.output_height), (1280, 720));
    }

    #[test]
    fn test_crop_geometry_ratio_expands_and_clamps() {
        let target = Resolution::new(1280, 720, 30).unwrap();

        let wide = crop_geometry(1920, 1080, &target, 1.5);
        assert_eq!((wide.input.x, wide.input.y, wide.input.width, wide.input.height), (0, 0, 1920, 1080));
        assert_eq!((wide.output_width, wide.output_height), (1280, 720));

        // Ratio below one never crops below the target
        let narrow = crop_geometry(1920, 1080, &target, 0.5);
        assert_eq!((narrow.input.width, narrow.input.height), (1280, 720));

        // Image smaller than the target
        let small = crop_geometry(640, 480, &target, 1.0);
        assert_eq!((small.input.x, small.input.y, small.input.width, small.input.height), (0, 0, 640, 480));
        assert_eq!((small.output_width, small.output_height), (640, 480));
    }

    #[test]
    fn test_full_session_writes_file_and_releases_everything() {
        let (recorder, source, factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        assert!(source.is_subscribed());

        for _ in 0..3 {
            source.emit_frame();
        }
        assert_eq!(recorder.state().frame_count, 3);

        let stats = recorder.stop_recording().unwrap().unwrap();
        assert_eq!(stats.frames_submitted, 3);
        assert!(!recorder.is_recording());
        assert!(!source.is_subscribed());

        let muxer = factory.muxer(0);
        assert!(muxer.samples().iter().any(|s| s.info.is_end_of_stream()));
        let pts: Vec<i64> = muxer.samples().iter().map(|s| s.info.presentation_time_us).collect();
        assert_eq!(pts, vec![0, 33_333, 66_666]);
        assert!(factory.encoder(0).is_released());
        assert_eq!(source.images_acquired(), 3);
        assert_eq!(source.images_released(), 3);
    }

    #[test]
    fn test_conversion_requests_use_crop_geometry() {
        let (recorder, source, _factory) = recorder(ConversionMode::Inline);
        recorder.set_crop_ratio(1.5).unwrap();
        recorder.start_recording(options()).unwrap();
        source.emit_frame();

        let request = source.requests()[0];
        assert_eq!(
            request.input_rect,
            CropRect {
                x: 2,
                y: 1,
                width: 12,
                height: 6
            }
        );
        assert_eq!((request.output_width, request.output_height), (8, 4));
        assert_eq!(request.format, PixelFormat::Rgba32);
    }

    #[test]
    fn test_second_start_keeps_frame_count() {
        let (recorder, source, factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        source.emit_frame();
        source.emit_frame();

        recorder.start_recording(options()).unwrap();
        assert_eq!(recorder.state().frame_count, 2);
        assert_eq!(factory.encoders_created(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (recorder, source, _factory) = recorder(ConversionMode::Inline);
        assert!(recorder.stop_recording().unwrap().is_none());

        recorder.start_recording(options()).unwrap();
        source.emit_frame();
        assert!(recorder.stop_recording().unwrap().is_some());
        assert!(recorder.stop_recording().unwrap().is_none());
        assert_eq!(recorder.state(), RecordingState::new());
    }

    #[test]
    fn test_image_released_before_conversion_completes() {
        let (recorder, source, _factory) = recorder(ConversionMode::Deferred);
        recorder.start_recording(options()).unwrap();
        source.emit_frame();
        assert_eq!(source.pending_conversions(), 1);
        assert_eq!(source.images_released(), 1);

        assert_eq!(source.complete_pending(), 1);
        assert_eq!(recorder.encoder_stats().frames_submitted, 1);
    }

    #[test]
    fn test_conversion_after_stop_is_dropped() {
        let (recorder, source, factory) = recorder(ConversionMode::Deferred);
        recorder.start_recording(options()).unwrap();
        source.emit_frame();
        recorder.stop_recording().unwrap();
        let calls = factory.encoder(0).call_count();

        // The late callback lands while the next session is running
        recorder.start_recording(options()).unwrap();
        assert_eq!(source.complete_pending(), 1);
        assert_eq!(factory.encoder(0).call_count(), calls);
        assert_eq!(factory.encoder(1).queued_inputs(), 0);
        assert_eq!(recorder.encoder_stats().frames_submitted, 0);
    }

    #[test]
    fn test_frames_after_stop_are_ignored() {
        let (recorder, source, _factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        recorder.stop_recording().unwrap();
        source.emit_frame();
        assert_eq!(source.images_acquired(), 0);
    }

    #[test]
    fn test_acquisition_failure_skips_frame_and_keeps_recording() {
        let (recorder, source, _factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        source.fail_next_acquisitions(1);
        source.emit_frame();
        assert!(recorder.is_recording());
        assert_eq!(recorder.state().frame_count, 0);

        source.emit_frame();
        assert_eq!(recorder.state().frame_count, 1);
        assert_eq!(recorder.encoder_stats().frames_submitted, 1);
    }

    #[test]
    fn test_failed_conversion_is_dropped_silently() {
        let (recorder, source, _factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        source.fail_conversions(true);
        source.emit_frame();
        assert_eq!(recorder.encoder_stats().frames_submitted, 0);
        assert!(recorder.is_recording());
    }

    #[test]
    fn test_start_failure_leaves_recorder_inactive() {
        let source = ScriptedFrameSource::new(16, 8);
        let factory = Arc::new(MockDeviceFactory::with_config(MockEncoderConfig {
            fail_start: true,
            ..Default::default()
        }));
        let recorder = VideoRecorder::new(source.clone(), FlatSceneRenderer::transparent(), factory);
        let err = recorder.start_recording(options()).unwrap_err();
        assert!(matches!(err, RecorderError::EncoderInit(_)));
        assert!(!recorder.is_recording());
        assert!(!source.is_subscribed());
    }

    #[test]
    fn test_drop_stops_recording() {
        let (recorder, source, factory) = recorder(ConversionMode::Inline);
        recorder.start_recording(options()).unwrap();
        source.emit_frame();
        drop(recorder);
        assert!(!source.is_subscribed());
        assert!(factory.muxer(0).is_released());
    }

    #[test]
    fn test_stop_during_subscribe_waits_for_start() {
        let scripted = ScriptedFrameSource::new(16, 8);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let source = GatedSource {
            inner: scripted.clone(),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        };
        let factory = Arc::new(MockDeviceFactory::new());
        let recorder = VideoRecorder::new(source, FlatSceneRenderer::transparent(), factory.clone());

        std::thread::scope(|s| {
            let start = s.spawn(|| recorder.start_recording(options()));
            entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

            let stop = s.spawn(|| recorder.stop_recording());
            // Give the stop a chance to run inside the subscribe window
            std::thread::sleep(Duration::from_millis(50));
            assert!(factory.muxer(0).calls().is_empty());
            gate_tx.send(()).unwrap();

            start.join().unwrap().unwrap();
            assert!(stop.join().unwrap().unwrap().is_some());
        });

        assert!(!recorder.is_recording());
        assert!(!scripted.is_subscribed());
        assert!(factory.encoder(0).is_released());
    }

    #[test]
    fn test_invalid_crop_ratio_rejected() {
        let (recorder, _source, _factory) = recorder(ConversionMode::Inline);
        assert!(recorder.set_crop_ratio(0.0).is_err());
        assert!(recorder.set_crop_ratio(f32::NAN).is_err());
        assert_eq!(recorder.crop_ratio(), 1.0);
    }
}
