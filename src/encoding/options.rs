//! Per-session encoding parameters.
//!
//! [`Resolution`] sizes every buffer in the pipeline and must match what the
//! hardware encoder was configured with. [`EncodingOptions`] is built once
//! per session and handed to the encoder session at start.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};

/// Default bits per pixel per frame used to derive a bitrate.
/// 1920 * 1080 * 30 * 0.145 is roughly 9 Mbps.
pub const DEFAULT_BITS_PER_PIXEL: f64 = 0.145;

/// Default frame rate when none is given
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Output frame geometry and rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Resolution {
    /// Validate and build a resolution.
    ///
    /// Width and height must be even because chroma is subsampled 2x2.
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Result<Self> {
        if width == 0 || height == 0 || frame_rate == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RecorderError::InvalidResolution {
                width,
                height,
                frame_rate,
            });
        }
        Ok(Self {
            width,
            height,
            frame_rate,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of one packed 32-bit frame
    pub fn packed_len(&self) -> usize {
        self.pixel_count() * 4
    }

    /// Byte length of one planar 4:2:0 frame
    pub fn planar_len(&self) -> usize {
        self.pixel_count() * 3 / 2
    }

    /// Bitrate derived from pixel throughput
    pub fn default_bitrate(&self) -> u32 {
        let bits = self.width as f64 * self.height as f64 * self.frame_rate as f64 * DEFAULT_BITS_PER_PIXEL;
        bits.round() as u32
    }
}

/// Recording quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionQuality {
    /// 720x480
    Low,
    /// 1280x720
    #[default]
    Medium,
    /// 1920x1080
    High,
}

impl ResolutionQuality {
    pub const ALL: &'static [ResolutionQuality] = &[
        ResolutionQuality::Low,
        ResolutionQuality::Medium,
        ResolutionQuality::High,
    ];

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ResolutionQuality::Low => (720, 480),
            ResolutionQuality::Medium => (1280, 720),
            ResolutionQuality::High => (1920, 1080),
        }
    }

    pub fn to_resolution(&self, frame_rate: u32) -> Result<Resolution> {
        let (width, height) = self.dimensions();
        Resolution::new(width, height, frame_rate)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ResolutionQuality::Low => "Low (480p)",
            ResolutionQuality::Medium => "Medium (720p)",
            ResolutionQuality::High => "High (1080p)",
        }
    }
}

/// Everything the encoder session needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingOptions {
    pub resolution: Resolution,
    pub output_dir: PathBuf,
    pub file_name: String,
    /// Target bitrate in bits per second; `None` derives one from the resolution
    pub bitrate: Option<u32>,
    pub low_latency_mode: bool,
    /// Seconds between key frames (0 = every frame)
    pub key_frame_interval_secs: u32,
    pub priority: i32,
}

impl EncodingOptions {
    pub fn new(resolution: Resolution, output_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            resolution,
            output_dir: output_dir.into(),
            file_name: file_name.into(),
            bitrate: None,
            low_latency_mode: false,
            key_frame_interval_secs: 1,
            priority: 0,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_low_latency(mut self, enabled: bool) -> Self {
        self.low_latency_mode = enabled;
        self
    }

    pub fn with_key_frame_interval(mut self, secs: u32) -> Self {
        self.key_frame_interval_secs = secs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Effective bitrate: explicit if set, otherwise derived
    pub fn bitrate(&self) -> u32 {
        self.bitrate.unwrap_or_else(|| self.resolution.default_bitrate())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bitrate_720p30() {
        let res = Resolution::new(1280, 720, 30).unwrap();
        let options = EncodingOptions::new(res, "/tmp", "a.mp4");
        // 1280 * 720 * 30 * 0.145
        assert_eq!(options.bitrate(), 4_008_960);
    }

    #[test]
    fn test_explicit_bitrate_wins() {
        let res = Resolution::new(1280, 720, 30).unwrap();
        let options = EncodingOptions::new(res, "/tmp", "a.mp4").with_bitrate(9_000_000);
        assert_eq!(options.bitrate(), 9_000_000);
    }

    #[test]
    fn test_resolution_validation() {
        assert!(Resolution::new(0, 720, 30).is_err());
        assert!(Resolution::new(1280, 0, 30).is_err());
        assert!(Resolution::new(1280, 720, 0).is_err());
        assert!(Resolution::new(1281, 720, 30).is_err());
        assert!(Resolution::new(1280, 721, 30).is_err());

        let res = Resolution::new(4, 2, 30).unwrap();
        assert_eq!(res.packed_len(), 32);
        assert_eq!(res.planar_len(), 12);
    }

    #[test]
    fn test_quality_presets() {
        let res = ResolutionQuality::High.to_resolution(30).unwrap();
        assert_eq!((res.width, res.height, res.frame_rate), (1920, 1080, 30));
        assert_eq!(ResolutionQuality::default(), ResolutionQuality::Medium);
        for quality in ResolutionQuality::ALL {
            assert!(quality.to_resolution(DEFAULT_FRAME_RATE).is_ok());
        }
    }

    #[test]
    fn test_output_path_joins_dir_and_name() {
        let res = Resolution::new(2, 2, 30).unwrap();
        let options = EncodingOptions::new(res, "/data/out", "clip.mp4");
        assert_eq!(options.output_path(), PathBuf::from("/data/out/clip.mp4"));
    }
}
