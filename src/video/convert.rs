//! Packed RGB to planar 4:2:0 conversion.
//!
//! The compositor reads frames back bottom row first, so conversion walks the
//! source rows in reverse to produce an upright planar frame. Chroma is written
//! as a single interleaved U,V plane (NV12 layout), one pair per 2x2 block.
//!
//! Out-of-range chroma (pure blue gives U = 255.5 before rounding) saturates to
//! 0..=255 rather than wrapping.

use crate::encoding::Resolution;
use crate::error::{RecorderError, Result};

use super::{PixelFormat, RawPixelBuffer};

/// Convert a packed 32-bit frame into a newly allocated planar YUV 4:2:0 frame.
///
/// Accepts [`PixelFormat::Argb32`] and [`PixelFormat::Rgba32`]; alpha is
/// ignored. Fails with [`RecorderError::InvalidFrameSize`] if the buffer is not
/// exactly `width * height * 4` bytes of packed pixels.
pub fn convert_argb_to_yuv420(packed: &RawPixelBuffer, resolution: &Resolution) -> Result<RawPixelBuffer> {
    let expected = resolution.packed_len();
    let (r_at, g_at, b_at) = match packed.format() {
        PixelFormat::Argb32 => (1, 2, 3),
        PixelFormat::Rgba32 => (0, 1, 2),
        PixelFormat::Yuv420 => {
            return Err(RecorderError::InvalidFrameSize {
                expected,
                actual: packed.len(),
            })
        }
    };
    if packed.len() != expected {
        return Err(RecorderError::InvalidFrameSize {
            expected,
            actual: packed.len(),
        });
    }

    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let luma_len = width * height;

    let mut out = vec![0u8; resolution.planar_len()];
    let (y_plane, uv_plane) = out.split_at_mut(luma_len);
    let src = packed.as_bytes();
    let row_bytes = width * 4;

    let mut y_index = 0;
    let mut uv_index = 0;

    for src_row in (0..height).rev() {
        let row = &src[src_row * row_bytes..(src_row + 1) * row_bytes];
        let emit_chroma = src_row % 2 == 1;

        for (col, px) in row.chunks_exact(4).enumerate() {
            let r = px[r_at] as f32;
            let g = px[g_at] as f32;
            let b = px[b_at] as f32;

            y_plane[y_index] = saturate(0.299 * r + 0.587 * g + 0.114 * b);
            y_index += 1;

            if emit_chroma && col % 2 == 0 {
                uv_plane[uv_index] = saturate((-0.169 * r - 0.331 * g + 0.5 * b).round() + 128.0);
                uv_plane[uv_index + 1] = saturate((0.5 * r - 0.419 * g - 0.081 * b).round() + 128.0);
                uv_index += 2;
            }
        }
    }

    debug_assert_eq!(uv_index, uv_plane.len());
    Ok(RawPixelBuffer::new(out, PixelFormat::Yuv420))
}

#[inline]
fn saturate(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
