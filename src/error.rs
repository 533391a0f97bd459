// Error types shared across the capture pipeline

/// Failure reported by a hardware encoder or container muxer device.
///
/// Device trait methods return this; the session wraps it into
/// [`RecorderError::DeviceCall`] or [`RecorderError::EncoderInit`]
/// depending on where the call happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The handle was used after `release()`
    #[error("device handle already released")]
    Released,

    /// The call is not legal in the device's current state
    #[error("illegal device state: {0}")]
    InvalidState(&'static str),

    /// A buffer index that the device never handed out (or already took back)
    #[error("invalid buffer index: {0}")]
    InvalidIndex(usize),

    /// Anything the platform binding reported
    #[error("backend error: {0}")]
    Backend(String),
}

/// Error type for recorder operations
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("invalid resolution {width}x{height}@{frame_rate}: dimensions must be positive and even")]
    InvalidResolution {
        width: u32,
        height: u32,
        frame_rate: u32,
    },

    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("frame composition failed: {0}")]
    Composition(#[source] anyhow::Error),

    #[error("encoder initialization failed: {0}")]
    EncoderInit(#[source] DeviceError),

    #[error("encoder input buffer too small: capacity {capacity} < {required}")]
    BufferTooSmall { capacity: usize, required: usize },

    #[error("sample written before the muxer was started")]
    MuxerNotStarted,

    #[error("device call failed: {0}")]
    DeviceCall(#[from] DeviceError),

    #[error("frame source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

impl RecorderError {
    /// Whether this failure only costs the current frame.
    ///
    /// Per-frame failures are logged and skipped by the recorder; anything
    /// else ends the session.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            RecorderError::InvalidFrameSize { .. }
                | RecorderError::Composition(_)
                | RecorderError::BufferTooSmall { .. }
                | RecorderError::Source(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_converts_to_device_call() {
        let err: RecorderError = DeviceError::Released.into();
        assert!(matches!(err, RecorderError::DeviceCall(DeviceError::Released)));
        assert_eq!(err.to_string(), "device call failed: device handle already released");
    }

    #[test]
    fn test_per_frame_classification() {
        assert!(RecorderError::InvalidFrameSize { expected: 4, actual: 3 }.is_per_frame());
        assert!(RecorderError::Source("no image".into()).is_per_frame());
        assert!(!RecorderError::MuxerNotStarted.is_per_frame());
        assert!(!RecorderError::EncoderInit(DeviceError::Backend("x".into())).is_per_frame());
    }
}
