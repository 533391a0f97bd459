//! Scene-over-camera frame compositor
//!
//! Each call renders the scene layer, blits the camera image, blends the two
//! into a composite and reads the composite back as a packed ARGB frame.
//! The three offscreen targets come from a [`RenderTargetPool`] and go back to
//! it when they drop, so every exit path (including renderer errors) returns
//! them.
//!
//! Targets use bottom-up row order like a GPU framebuffer; the readback keeps
//! that order and the colour converter flips it upright.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::encoding::Resolution;
use crate::error::{RecorderError, Result};

use super::{PixelFormat, RawPixelBuffer};

/// Field of view (degrees) the physical camera image is calibrated against
pub const NOMINAL_CAMERA_FOV_DEGREES: f32 = 78.0;

/// Renders the virtual scene layer
pub trait SceneRenderer {
    /// Current vertical field of view of the scene camera in degrees
    fn field_of_view(&self) -> f32;

    /// Draw the scene into `target`.
    ///
    /// `target` is cleared to transparent black beforehand. Pixels are RGBA
    /// with row 0 at the bottom; alpha decides how much of the scene covers
    /// the camera layer.
    fn render(&mut self, target: &mut RenderTarget) -> anyhow::Result<()>;
}

impl<R: SceneRenderer + ?Sized> SceneRenderer for Box<R> {
    fn field_of_view(&self) -> f32 {
        (**self).field_of_view()
    }

    fn render(&mut self, target: &mut RenderTarget) -> anyhow::Result<()> {
        (**self).render(target)
    }
}

/// An RGBA offscreen surface, bottom row first
#[derive(Debug)]
pub struct RenderTarget {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RenderTarget {
    fn new(width: u32, height: u32, mut pixels: Vec<u8>) -> Self {
        pixels.clear();
        pixels.resize(width as usize * height as usize * 4, 0);
        Self { width, height, pixels }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    /// RGBA at (`x`, `y`), `y` counted from the bottom row
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = self.offset(x, y);
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = self.offset(x, y);
        self.pixels[i..i + 4].copy_from_slice(&rgba);
    }

    /// Fill every pixel with `rgba`
    pub fn fill(&mut self, rgba: [u8; 4]) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }
}

#[derive(Default)]
struct PoolInner {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

/// Recycles render target storage between frames.
///
/// Cloning the pool shares the same storage.
#[derive(Clone, Default)]
pub struct RenderTargetPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl RenderTargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a cleared target; it returns to the pool when dropped
    pub fn acquire(&self, width: u32, height: u32) -> PooledTarget {
        let storage = {
            let mut inner = self.inner.lock();
            inner.outstanding += 1;
            inner.free.pop().unwrap_or_default()
        };
        PooledTarget {
            target: RenderTarget::new(width, height, storage),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Targets currently checked out
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Targets waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Drop all idle storage
    pub fn purge(&self) {
        self.inner.lock().free.clear();
    }
}

/// A [`RenderTarget`] on loan from a [`RenderTargetPool`]
pub struct PooledTarget {
    target: RenderTarget,
    pool: Arc<Mutex<PoolInner>>,
}

impl Deref for PooledTarget {
    type Target = RenderTarget;

    fn deref(&self) -> &RenderTarget {
        &self.target
    }
}

impl DerefMut for PooledTarget {
    fn deref_mut(&mut self) -> &mut RenderTarget {
        &mut self.target
    }
}

impl Drop for PooledTarget {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.target.pixels);
        let mut inner = self.pool.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.free.push(storage);
    }
}

/// Camera image as delivered by the frame source conversion: RGBA, top row first
#[derive(Debug)]
pub struct CameraTexture {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl CameraTexture {
    /// Build a texture from a converted RGBA32 buffer
    pub fn from_buffer(buffer: RawPixelBuffer, width: u32, height: u32) -> Result<Self> {
        let expected = PixelFormat::Rgba32.frame_len(width, height);
        if buffer.format() != PixelFormat::Rgba32 || buffer.len() != expected || expected == 0 {
            return Err(RecorderError::InvalidFrameSize {
                expected,
                actual: buffer.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels: buffer.into_bytes(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGBA at (`x`, `y`), `y` counted from the top row
    fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }
}

/// Blends the scene layer over the camera layer at a fixed output size
pub struct FrameCompositor {
    resolution: Resolution,
    pool: RenderTargetPool,
}

impl FrameCompositor {
    pub fn new(resolution: Resolution) -> Self {
        Self::with_pool(resolution, RenderTargetPool::new())
    }

    pub fn with_pool(resolution: Resolution, pool: RenderTargetPool) -> Self {
        Self { resolution, pool }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn pool(&self) -> &RenderTargetPool {
        &self.pool
    }

    /// Composite one frame.
    ///
    /// The camera layer is scaled about its centre by
    /// `scene_fov / (78 * crop_ratio)` so scene geometry lines up with the
    /// physical view. Returns a packed ARGB32 frame of the compositor's
    /// resolution, bottom row first, owned by the caller.
    pub fn compose<R: SceneRenderer + ?Sized>(
        &mut self,
        camera: &CameraTexture,
        scene: &mut R,
        crop_ratio: f32,
    ) -> Result<RawPixelBuffer> {
        if !crop_ratio.is_finite() || crop_ratio <= 0.0 {
            return Err(RecorderError::Composition(anyhow!("invalid crop ratio {}", crop_ratio)));
        }
        let scene_fov = scene.field_of_view();
        if !scene_fov.is_finite() || scene_fov <= 0.0 {
            return Err(RecorderError::Composition(anyhow!("invalid scene field of view {}", scene_fov)));
        }
        let fov_ratio = scene_fov / (NOMINAL_CAMERA_FOV_DEGREES * crop_ratio);

        let (width, height) = (self.resolution.width, self.resolution.height);
        let mut scene_rt = self.pool.acquire(width, height);
        let mut physical_rt = self.pool.acquire(width, height);
        let mut composite_rt = self.pool.acquire(width, height);

        scene.render(&mut scene_rt).map_err(RecorderError::Composition)?;

        blit_camera(camera, &mut physical_rt);
        blend(&scene_rt, &physical_rt, &mut composite_rt, fov_ratio);

        log::trace!("[Compositor] Composed {}x{} frame, fov ratio {:.3}", width, height, fov_ratio);
        Ok(read_back_argb(&composite_rt))
    }
}

/// Nearest-neighbour scale of the top-down camera image into a bottom-up target
fn blit_camera(camera: &CameraTexture, target: &mut RenderTarget) {
    let (tw, th) = (target.width(), target.height());
    for y in 0..th {
        let src_y_from_bottom = (y as u64 * camera.height() as u64 / th as u64) as u32;
        let src_y = camera.height() - 1 - src_y_from_bottom;
        for x in 0..tw {
            let src_x = (x as u64 * camera.width() as u64 / tw as u64) as u32;
            target.set_pixel(x, y, camera.texel(src_x, src_y));
        }
    }
}

/// Scene over camera, camera sampled at `(uv - 0.5) * fov_ratio + 0.5`.
/// Samples outside the camera image are black.
fn blend(scene: &RenderTarget, camera: &RenderTarget, out: &mut RenderTarget, fov_ratio: f32) {
    let (w, h) = (out.width(), out.height());
    for y in 0..h {
        let v = (y as f32 + 0.5) / h as f32;
        let cam_v = (v - 0.5) * fov_ratio + 0.5;
        for x in 0..w {
            let u = (x as f32 + 0.5) / w as f32;
            let cam_u = (u - 0.5) * fov_ratio + 0.5;

            let cam = if (0.0..1.0).contains(&cam_u) && (0.0..1.0).contains(&cam_v) {
                let cx = ((cam_u * camera.width() as f32) as u32).min(camera.width() - 1);
                let cy = ((cam_v * camera.height() as f32) as u32).min(camera.height() - 1);
                camera.pixel(cx, cy)
            } else {
                [0, 0, 0, 255]
            };

            let s = scene.pixel(x, y);
            let a = s[3] as u32;
            let mix = |sc: u8, cc: u8| ((sc as u32 * a + cc as u32 * (255 - a) + 127) / 255) as u8;
            out.set_pixel(x, y, [mix(s[0], cam[0]), mix(s[1], cam[1]), mix(s[2], cam[2]), 255]);
        }
    }
}

fn read_back_argb(target: &RenderTarget) -> RawPixelBuffer {
    let mut data = Vec::with_capacity(target.pixels().len());
    for px in target.pixels().chunks_exact(4) {
        data.extend_from_slice(&[px[3], px[0], px[1], px[2]]);
    }
    RawPixelBuffer::new(data, PixelFormat::Argb32)
}
