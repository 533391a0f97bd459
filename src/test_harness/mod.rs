// Deterministic stand-ins for the camera, scene and encoder devices.
//
// Used by the unit tests and by the recording benchmark, which drives the
// full pipeline without camera hardware.

pub mod devices;
pub mod source;

pub use devices::{
    EncoderCall, MockDeviceFactory, MockEncoder, MockEncoderConfig, MockEncoderProbe, MockMuxer, MockMuxerProbe,
    MuxerCall, RecordedSample, SAMPLE_PREFIX, START_CODE,
};
pub use source::{ConversionMode, FlatSceneRenderer, ScriptedFrameSource, ScriptedImage};

use tempfile::TempDir;

/// Temporary output directory, removed when dropped
pub fn scratch_dir() -> std::io::Result<TempDir> {
    tempfile::Builder::new().prefix("mixcap-").tempdir()
}
