//! GStreamer initialization and diagnostics
//!
//! The GStreamer devices call [`init_gstreamer_env`] before building any
//! pipeline. Initialization runs once; its outcome is cached so a missing
//! installation keeps failing the same way instead of retrying.

use std::env;
use std::sync::OnceLock;

use crate::encoding::gst::available_h264_encoders;
use crate::error::DeviceError;

static GSTREAMER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once for the whole process
pub fn init_gstreamer_env() -> Result<(), DeviceError> {
    GSTREAMER_INIT
        .get_or_init(|| match gstreamer::init() {
            Ok(()) => {
                log::info!("GStreamer initialized successfully");
                log_gstreamer_version();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                log::error!("Recording will not be available");
                Err(e.to_string())
            }
        })
        .clone()
        .map_err(|e| DeviceError::Backend(format!("GStreamer unavailable: {}", e)))
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}

/// Information about the GStreamer installation for diagnostics
#[derive(Debug, Clone)]
pub struct GStreamerInfo {
    pub is_available: bool,
    pub version: Option<String>,
    pub plugin_path: Option<String>,
    /// Installed H.264 encoder elements, most preferred first
    pub h264_encoders: Vec<&'static str>,
}

pub fn get_gstreamer_info() -> GStreamerInfo {
    if init_gstreamer_env().is_err() {
        return GStreamerInfo {
            is_available: false,
            version: None,
            plugin_path: env::var("GST_PLUGIN_PATH").ok(),
            h264_encoders: Vec::new(),
        };
    }

    let (major, minor, micro, _) = gstreamer::version();
    GStreamerInfo {
        is_available: true,
        version: Some(format!("{}.{}.{}", major, minor, micro)),
        plugin_path: env::var("GST_PLUGIN_PATH").ok(),
        h264_encoders: available_h264_encoders(),
    }
}
