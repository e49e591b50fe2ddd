//! Test-pattern frame source
//!
//! Produces frames on a fixed schedule and can be told to misbehave, which
//! makes the whole pipeline testable without hardware.

use super::{DeviceError, ExposureStatus, FrameFormat, FrameSource};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Misbehaviour to inject
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// After this many frames the source goes quiet for `stall_for`
    pub stall_after: Option<u64>,
    pub stall_for: Duration,

    /// After this many frames every fetch fails with `Disconnected`
    pub disconnect_after: Option<u64>,

    /// After this many frames the stream ends
    pub frame_limit: Option<u64>,

    /// Number of initial `start_exposure` calls that fail
    pub exposure_start_failures: u32,

    /// Number of initial `exposure_status` calls that fail
    pub status_failures: u32,

    /// The exposure completes with `Failed`
    pub exposure_fails: bool,
}

pub struct SyntheticSource {
    format: FrameFormat,
    period: Duration,
    exposure: Duration,
    faults: Faults,

    streaming: bool,
    next_due: Instant,
    frames: u64,
    dropped: u64,
    stalled: bool,

    exposure_started: Option<Instant>,
    start_failures_left: u32,
    status_failures_left: u32,
}

impl SyntheticSource {
    pub fn new(format: FrameFormat, fps: u32, exposure: Duration) -> Self {
        Self::with_faults(format, fps, exposure, Faults::default())
    }

    pub fn with_faults(format: FrameFormat, fps: u32, exposure: Duration, faults: Faults) -> Self {
        let period = Duration::from_secs(1) / fps.max(1);
        Self {
            format,
            period,
            exposure,
            start_failures_left: faults.exposure_start_failures,
            status_failures_left: faults.status_failures,
            faults,
            streaming: false,
            next_due: Instant::now(),
            frames: 0,
            dropped: 0,
            stalled: false,
            exposure_started: None,
        }
    }

    /// Frames produced since streaming started
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn check_size(&self, dst: &[u8]) -> Result<(), DeviceError> {
        let expected = self.format.slot_bytes();
        if dst.len() != expected {
            return Err(DeviceError::BufferSize {
                expected,
                actual: dst.len(),
            });
        }
        Ok(())
    }
}

/// Gradient shifted by the frame number, with the frame number itself
/// little-endian in the first bytes
pub fn fill_pattern(dst: &mut [u8], frame: u64) {
    for (i, byte) in dst.iter_mut().enumerate() {
        *byte = (i as u64).wrapping_add(frame) as u8;
    }
    let tag = frame.to_le_bytes();
    let n = tag.len().min(dst.len());
    dst[..n].copy_from_slice(&tag[..n]);
}

impl FrameSource for SyntheticSource {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn exposure(&self) -> Duration {
        self.exposure
    }

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.streaming = true;
        self.frames = 0;
        self.dropped = 0;
        self.stalled = false;
        self.next_due = Instant::now() + self.period;

        info!(period_ms = %self.period.as_millis(), "Synthetic stream started");
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        if self.streaming {
            info!(frames = %self.frames, "Synthetic stream stopped");
        }
        self.streaming = false;
        Ok(())
    }

    fn fetch_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<(), DeviceError> {
        if !self.streaming {
            return Err(DeviceError::NotStreaming);
        }
        self.check_size(dst)?;

        if self.faults.frame_limit.is_some_and(|limit| self.frames >= limit) {
            return Err(DeviceError::EndOfStream);
        }
        if self.faults.disconnect_after.is_some_and(|n| self.frames >= n) {
            return Err(DeviceError::Disconnected);
        }
        if !self.stalled && self.faults.stall_after.is_some_and(|n| self.frames >= n) {
            self.stalled = true;
            self.next_due += self.faults.stall_for;
            warn!(stall_ms = %self.faults.stall_for.as_millis(), "Synthetic stream stalling");
        }

        let now = Instant::now();
        let wait = self.next_due.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return Err(DeviceError::Timeout);
        }
        std::thread::sleep(wait);

        fill_pattern(dst, self.frames);
        self.frames += 1;
        self.next_due += self.period;

        // A slow reader misses frames the way a real sensor would
        let now = Instant::now();
        if now > self.next_due + self.period {
            let missed = (now - self.next_due).as_nanos() / self.period.as_nanos().max(1);
            let missed = u32::try_from(missed).unwrap_or(u32::MAX);
            self.dropped += u64::from(missed);
            self.next_due += self.period.saturating_mul(missed);
            debug!(missed = %missed, "Synthetic source skipped frames");
        }

        Ok(())
    }

    fn dropped_frames(&mut self) -> Result<u64, DeviceError> {
        Ok(self.dropped)
    }

    fn start_exposure(&mut self) -> Result<(), DeviceError> {
        if self.start_failures_left > 0 {
            self.start_failures_left -= 1;
            return Err(DeviceError::StateChange("exposure start refused".to_string()));
        }
        self.exposure_started = Some(Instant::now());
        debug!(exposure_ms = %self.exposure.as_millis(), "Synthetic exposure started");
        Ok(())
    }

    fn exposure_status(&mut self) -> Result<ExposureStatus, DeviceError> {
        if self.status_failures_left > 0 {
            self.status_failures_left -= 1;
            return Err(DeviceError::Pipeline("status read failed".to_string()));
        }

        let Some(started) = self.exposure_started else {
            return Ok(ExposureStatus::Idle);
        };
        if started.elapsed() < self.exposure {
            Ok(ExposureStatus::Working)
        } else if self.faults.exposure_fails {
            Ok(ExposureStatus::Failed)
        } else {
            Ok(ExposureStatus::Success)
        }
    }

    fn download_exposure(&mut self, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.check_size(dst)?;
        if self.exposure_status()? != ExposureStatus::Success {
            return Err(DeviceError::NotReady);
        }
        fill_pattern(dst, 0);
        self.exposure_started = None;
        Ok(())
    }

    fn stop_exposure(&mut self) -> Result<(), DeviceError> {
        self.exposure_started = None;
        Ok(())
    }
}
