use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use parking_lot::Mutex;

use crate::recording::source::{ConversionCallback, FrameListener};
use crate::recording::{ConversionParams, ConversionStatus, CpuImage, FrameSource};
use crate::video::{RawPixelBuffer, RenderTarget, SceneRenderer};

/// When [`ScriptedFrameSource`] runs conversion callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    /// Before `convert_async` returns
    Inline,
    /// On the next `complete_pending()`
    Deferred,
}

/// Image handed out by [`ScriptedFrameSource`]; counts its own release
pub struct ScriptedImage {
    width: u32,
    height: u32,
    timestamp_seconds: f64,
    released: Arc<AtomicUsize>,
}

impl CpuImage for ScriptedImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn timestamp_seconds(&self) -> f64 {
        self.timestamp_seconds
    }
}

impl Drop for ScriptedImage {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct PendingConversion {
    status: ConversionStatus,
    buffer: RawPixelBuffer,
    callback: ConversionCallback,
}

struct ScriptState {
    listener: Option<Arc<dyn Fn() + Send + Sync>>,
    width: u32,
    height: u32,
    frame_rate: f64,
    fill: [u8; 4],
    mode: ConversionMode,
    emitted: u64,
    latest_timestamp: Option<f64>,
    acquire_failures: u32,
    fail_conversions: bool,
    acquired: usize,
    requests: Vec<ConversionParams>,
    pending: VecDeque<PendingConversion>,
}

/// Frame source driven by the test: frames arrive when `emit_frame` is called.
///
/// Frame `n` carries timestamp `n / frame_rate` seconds. Clones share state,
/// so a test can keep one while the recorder owns another.
#[derive(Clone)]
pub struct ScriptedFrameSource {
    state: Arc<Mutex<ScriptState>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedFrameSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                listener: None,
                width,
                height,
                frame_rate: 30.0,
                fill: [90, 140, 200, 255],
                mode: ConversionMode::Inline,
                emitted: 0,
                latest_timestamp: None,
                acquire_failures: 0,
                fail_conversions: false,
                acquired: 0,
                requests: Vec::new(),
                pending: VecDeque::new(),
            })),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_mode(self, mode: ConversionMode) -> Self {
        self.state.lock().mode = mode;
        self
    }

    pub fn with_frame_rate(self, frame_rate: f64) -> Self {
        self.state.lock().frame_rate = frame_rate;
        self
    }

    /// Publish the next frame and notify the listener on this thread
    pub fn emit_frame(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.latest_timestamp = Some(state.emitted as f64 / state.frame_rate);
            state.emitted += 1;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Run every deferred conversion callback; returns how many ran
    pub fn complete_pending(&self) -> usize {
        let pending: Vec<PendingConversion> = self.state.lock().pending.drain(..).collect();
        let count = pending.len();
        for conversion in pending {
            (conversion.callback)(conversion.status, conversion.buffer);
        }
        count
    }

    pub fn fail_next_acquisitions(&self, count: u32) {
        self.state.lock().acquire_failures = count;
    }

    pub fn fail_conversions(&self, fail: bool) {
        self.state.lock().fail_conversions = fail;
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    pub fn images_acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub fn images_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn pending_conversions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn requests(&self) -> Vec<ConversionParams> {
        self.state.lock().requests.clone()
    }
}

impl FrameSource for ScriptedFrameSource {
    type Image = ScriptedImage;

    fn subscribe(&self, listener: FrameListener) {
        self.state.lock().listener = Some(Arc::from(listener));
    }

    fn unsubscribe(&self) {
        self.state.lock().listener = None;
    }

    fn acquire_latest_image(&self) -> anyhow::Result<ScriptedImage> {
        let mut state = self.state.lock();
        if state.acquire_failures > 0 {
            state.acquire_failures -= 1;
            bail!("scripted acquisition failure");
        }
        let Some(timestamp_seconds) = state.latest_timestamp else {
            bail!("no frame available yet");
        };
        state.acquired += 1;
        Ok(ScriptedImage {
            width: state.width,
            height: state.height,
            timestamp_seconds,
            released: self.released.clone(),
        })
    }

    fn convert_async(&self, image: &ScriptedImage, params: ConversionParams, on_complete: ConversionCallback) {
        let mut state = self.state.lock();
        state.requests.push(params);

        let rect = params.input_rect;
        let in_bounds = rect.right() <= image.width && rect.bottom() <= image.height;
        let (status, buffer) = if state.fail_conversions || !in_bounds {
            (ConversionStatus::Failed, RawPixelBuffer::new(Vec::new(), params.format))
        } else {
            let pixels = params.output_width as usize * params.output_height as usize;
            (
                ConversionStatus::Ready,
                RawPixelBuffer::new(state.fill.repeat(pixels), params.format),
            )
        };

        match state.mode {
            ConversionMode::Inline => {
                drop(state);
                on_complete(status, buffer);
            }
            ConversionMode::Deferred => state.pending.push_back(PendingConversion {
                status,
                buffer,
                callback: on_complete,
            }),
        }
    }
}

/// Scene layer that paints one flat colour
pub struct FlatSceneRenderer {
    field_of_view: f32,
    rgba: [u8; 4],
    frames_rendered: usize,
}

impl FlatSceneRenderer {
    pub fn new(field_of_view: f32, rgba: [u8; 4]) -> Self {
        Self {
            field_of_view,
            rgba,
            frames_rendered: 0,
        }
    }

    /// Fully transparent scene at the nominal camera field of view
    pub fn transparent() -> Self {
        Self::new(crate::video::compose::NOMINAL_CAMERA_FOV_DEGREES, [0, 0, 0, 0])
    }

    pub fn frames_rendered(&self) -> usize {
        self.frames_rendered
    }
}

impl SceneRenderer for FlatSceneRenderer {
    fn field_of_view(&self) -> f32 {
        self.field_of_view
    }

    fn render(&mut self, target: &mut RenderTarget) -> anyhow::Result<()> {
        target.fill(self.rgba);
        self.frames_rendered += 1;
        Ok(())
    }
}
