// Recording modules

pub mod recorder;
pub mod source;

pub use recorder::{crop_geometry, CropGeometry, VideoRecorder};
pub use source::{ConversionParams, ConversionStatus, CpuImage, CropRect, FrameSource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Current recording state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Ready to record
    Idle,
    /// Currently recording
    Recording,
}

/// Snapshot of one recording session.
///
/// Never mutated in place: every transition returns a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingState {
    pub status: RecordingStatus,
    pub frame_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl RecordingState {
    pub fn new() -> Self {
        Self {
            status: RecordingStatus::Idle,
            frame_count: 0,
            started_at: None,
            started: None,
        }
    }

    /// A fresh recording starting now
    pub fn start() -> Self {
        Self::start_at(Instant::now(), Utc::now())
    }

    pub fn start_at(started: Instant, started_at: DateTime<Utc>) -> Self {
        Self {
            status: RecordingStatus::Recording,
            frame_count: 0,
            started_at: Some(started_at),
            started: Some(started),
        }
    }

    pub fn with_frame_counted(&self) -> Self {
        Self {
            frame_count: self.frame_count + 1,
            ..self.clone()
        }
    }

    pub fn reset(&self) -> Self {
        Self::new()
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }

    /// Time since start while recording, zero otherwise
    pub fn duration(&self) -> Duration {
        self.duration_at(Instant::now())
    }

    pub fn duration_at(&self, now: Instant) -> Duration {
        match (self.status, self.started) {
            (RecordingStatus::Recording, Some(started)) => now.saturating_duration_since(started),
            _ => Duration::ZERO,
        }
    }
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_resets_count_and_records_time() {
        let counted = RecordingState::start().with_frame_counted().with_frame_counted();
        assert_eq!(counted.frame_count, 2);

        let restarted = RecordingState::start();
        assert!(restarted.is_recording());
        assert_eq!(restarted.frame_count, 0);
        assert!(restarted.started_at.is_some());
    }

    #[test]
    fn test_transitions_leave_previous_value_untouched() {
        let state = RecordingState::start();
        let next = state.with_frame_counted();
        assert_eq!(state.frame_count, 0);
        assert_eq!(next.frame_count, 1);
        assert_eq!(next.started_at, state.started_at);
    }

    #[test]
    fn test_duration_only_while_recording() {
        let t0 = Instant::now();
        let state = RecordingState::start_at(t0, Utc::now());
        assert_eq!(state.duration_at(t0 + Duration::from_secs(3)), Duration::from_secs(3));

        let idle = state.reset();
        assert_eq!(idle, RecordingState::new());
        assert_eq!(idle.duration_at(t0 + Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn test_serializes_without_monotonic_clock() {
        let state = RecordingState::start().with_frame_counted();
        let text = toml::to_string(&state).unwrap();
        assert!(text.contains("status = \"recording\""));
        assert!(text.contains("frame_count = 1"));
        let back: RecordingState = toml::from_str(&text).unwrap();
        assert_eq!(back.frame_count, 1);
        assert_eq!(back.duration(), Duration::ZERO);
    }
}
