// Mixcap - mixed-reality capture recorder
// Main library entry point

pub mod config;
pub mod encoding;
pub mod error;
#[cfg(feature = "gst")]
pub mod gstreamer_init;
pub mod recording;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
pub mod video;

pub use config::RecorderConfig;
pub use encoding::{EncoderSession, EncoderStats, EncodingOptions, Resolution, ResolutionQuality};
pub use error::{DeviceError, RecorderError, Result};
pub use recording::{RecordingState, RecordingStatus, VideoRecorder};
