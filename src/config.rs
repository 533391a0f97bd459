// Configuration management for Mixcap

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoding::options::DEFAULT_FRAME_RATE;
use crate::encoding::{ContainerFormat, EncodingOptions, ResolutionQuality};
use crate::error::Result;

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Output resolution preset
    #[serde(default)]
    pub quality: ResolutionQuality,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Directory recordings are written to
    #[serde(default = "get_default_output_dir")]
    pub output_dir: PathBuf,

    /// File names are `{prefix}_Video_{timestamp}.mp4`
    #[serde(default = "default_file_name_prefix")]
    pub file_name_prefix: String,

    /// Bits per second; derived from the resolution when unset
    #[serde(default)]
    pub bitrate: Option<u32>,

    #[serde(default)]
    pub low_latency_mode: bool,

    #[serde(default = "default_key_frame_interval")]
    pub key_frame_interval_secs: u32,

    /// Encoder scheduling priority hint (0 = realtime)
    #[serde(default)]
    pub priority: i32,

    /// How much larger than the output the camera crop may be
    #[serde(default = "default_crop_ratio")]
    pub crop_ratio: f32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            quality: ResolutionQuality::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            output_dir: get_default_output_dir(),
            file_name_prefix: default_file_name_prefix(),
            bitrate: None,
            low_latency_mode: false,
            key_frame_interval_secs: default_key_frame_interval(),
            priority: 0,
            crop_ratio: default_crop_ratio(),
        }
    }
}

impl RecorderConfig {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    /// Output file name for a recording started at `now`
    pub fn file_name(&self, now: DateTime<Local>) -> String {
        format!(
            "{}_Video_{}.{}",
            self.file_name_prefix,
            now.format("%Y%m%d_%H%M%S"),
            ContainerFormat::Mp4.extension()
        )
    }

    /// Encoding options for a recording started at `now`
    pub fn encoding_options(&self, now: DateTime<Local>) -> Result<EncodingOptions> {
        let resolution = self.quality.to_resolution(self.frame_rate)?;
        let mut options = EncodingOptions::new(resolution, self.output_dir.clone(), self.file_name(now))
            .with_low_latency(self.low_latency_mode)
            .with_key_frame_interval(self.key_frame_interval_secs)
            .with_priority(self.priority);
        if let Some(bitrate) = self.bitrate {
            options = options.with_bitrate(bitrate);
        }
        Ok(options)
    }
}

/// Get the default directory for recordings
fn get_default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Mixcap")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Mixcap")
        .join("config.toml")
}

fn default_frame_rate() -> u32 {
    DEFAULT_FRAME_RATE
}

fn default_file_name_prefix() -> String {
    "Mixcap".to_string()
}

fn default_key_frame_interval() -> u32 {
    1
}

fn default_crop_ratio() -> f32 {
    1.0
}
