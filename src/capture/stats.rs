//! Acquisition statistics

use super::CaptureState;
use serde::{Deserialize, Serialize};

/// Snapshot of one acquisition session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureStats {
    pub state: CaptureState,

    /// Frames published into the ring by the capture loop
    pub frames_produced: u64,

    /// Frames written to the open container
    pub frames_captured: u64,

    /// Frames lost since the container opened (overflow and failed writes)
    pub frames_dropped: u64,

    /// Frames lost to ring overflow over the whole stream
    pub ring_dropped: u64,

    /// Frames the device itself reported as dropped
    pub hardware_dropped: u64,

    /// Frame fetches that timed out
    pub timeouts: u64,

    /// Device frame rate over the last measurement window
    pub fps: f32,

    /// Ring occupancy in `[0, 1)`
    pub buffer_fullness: f32,

    pub is_recording: bool,
}

impl CaptureStats {
    /// Frame rate of captured (recorded) frames since `previous`
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_captured.saturating_sub(previous.frames_captured);
        frames_delta as f64 / elapsed_secs
    }

    /// Dropped / (captured + dropped)
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_captured + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }

        self.frames_dropped as f64 / total as f64
    }
}
