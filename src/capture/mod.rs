//! Hardware-facing capture loops
//!
//! A capture runs on its own thread and holds the device lock until it ends.
//! Streaming fills ring slots as fast as the device delivers frames; a still
//! runs one exposure and hands the result over through [`StillFrame`].
//!
//! ```text
//! Idle --StartStreaming--> Streaming --Abort--> Aborting --Finished--> Idle
//!   |                          |
//!   |                          +--HardwareError / Finished--> Idle
//!   +--StartStill--> StillExposing --Finished / Abort / HardwareError--> Idle
//! ```

mod stats;
mod still;

pub use stats::CaptureStats;
pub use still::{StillFrame, StillImage};

use crate::device::{DeviceError, DeviceHandle, ExposureStatus, FrameSource};
use crate::ring::RingError;
use crate::ser::time::now_ticks;
use crate::session::{SessionState, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Longest single device wait, so an abort is noticed quickly
const FETCH_CHUNK: Duration = Duration::from_millis(50);

/// Added to twice the exposure to get the full fetch deadline
const FETCH_GRACE: Duration = Duration::from_millis(500);

const FPS_WINDOW: Duration = Duration::from_millis(500);
const FULL_BACKOFF: Duration = Duration::from_millis(5);
const TIMEOUT_BACKOFF: Duration = Duration::from_millis(10);

const EXPOSURE_START_ATTEMPTS: u32 = 3;
const EXPOSURE_START_BACKOFF: Duration = Duration::from_millis(100);
const STATUS_POLL: Duration = Duration::from_millis(100);
const STATUS_RETRIES: u32 = 10;
const STATUS_RETRY_BACKOFF: Duration = Duration::from_millis(50);
const UNREAD_STILL_SETTLE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("cannot apply {trigger:?} in state {from:?}")]
    InvalidTransition { from: CaptureState, trigger: Trigger },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("could not start exposure: {0}")]
    StartExposure(DeviceError),

    #[error("exposure status unavailable: {0}")]
    ExposureStatus(DeviceError),

    #[error("exposure failed")]
    ExposureFailed,

    #[error("capture thread panicked")]
    ThreadPanicked,

    #[error("timed out waiting for the capture to finish")]
    WaitTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CaptureState {
    #[default]
    Idle = 0,
    StillExposing = 1,
    Streaming = 2,
    Aborting = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartStill,
    StartStreaming,
    Abort,
    HardwareError,
    Finished,
}

impl CaptureState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::StillExposing,
            2 => Self::Streaming,
            3 => Self::Aborting,
            _ => Self::Idle,
        }
    }

    /// Transition table
    pub fn next(self, trigger: Trigger) -> Result<Self, CaptureError> {
        use CaptureState::*;
        use Trigger::*;

        let to = match (self, trigger) {
            (Idle, StartStill) => StillExposing,
            (Idle, StartStreaming) => Streaming,
            (StillExposing, Finished | Abort | HardwareError) => Idle,
            (Streaming, Abort) => Aborting,
            (Streaming, HardwareError | Finished) => Idle,
            (Aborting, Finished) => Idle,
            (from, trigger) => return Err(CaptureError::InvalidTransition { from, trigger }),
        };
        Ok(to)
    }
}

/// How a capture ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The device finished on its own (stream ended, still downloaded)
    Completed { frames: u64 },

    /// Stopped by [`SessionState::request_abort`]
    Aborted { frames: u64 },
}

impl CaptureOutcome {
    pub fn frames(&self) -> u64 {
        match self {
            Self::Completed { frames } | Self::Aborted { frames } => *frames,
        }
    }
}

enum Fill {
    Filled,
    TimedOut,
    Aborted,
    Failed(DeviceError),
}

/// Drives one capture on the calling thread
pub struct CaptureLoop {
    device: DeviceHandle,
    session: Arc<SessionState>,
    timeout_retry_limit: u32,
}

impl CaptureLoop {
    pub fn new(device: DeviceHandle, session: Arc<SessionState>, timeout_retry_limit: u32) -> Self {
        Self {
            device,
            session,
            timeout_retry_limit,
        }
    }

    /// Streams into `stream.ring` until aborted, the device ends the stream,
    /// or a hard device error.
    ///
    /// The session must already be in `Streaming`. Leaves it in `Idle` on
    /// every path.
    pub fn run_streaming(&self, stream: &Stream) -> Result<CaptureOutcome, CaptureError> {
        let mut device = self.device.lock();

        if let Err(e) = device.start_streaming() {
            error!(error = %e, "Failed to start streaming");
            self.session.transition(Trigger::HardwareError)?;
            return Err(e.into());
        }

        let deadline = device.exposure() * 2 + FETCH_GRACE;
        info!(
            slots = %stream.ring.capacity(),
            slot_bytes = %stream.ring.slot_len(),
            fetch_deadline_ms = %deadline.as_millis(),
            "Streaming started"
        );

        let ring = &stream.ring;
        let mut frames = 0u64;
        let mut window_start = Instant::now();
        let mut window_frames = 0u64;
        let mut consecutive_timeouts = 0u32;
        let mut pending = None;

        loop {
            if self.session.abort_requested() {
                drop(pending.take());
                self.session.transition(Trigger::Abort)?;
                stop_streaming(&mut **device);
                self.session.transition(Trigger::Finished)?;
                self.session.clear_abort();

                info!(frames = %frames, "Streaming aborted");
                return Ok(CaptureOutcome::Aborted { frames });
            }

            match device.dropped_frames() {
                Ok(dropped) => self.session.set_hardware_dropped(dropped),
                Err(e) => debug!(error = %e, "Could not read dropped frame count"),
            }

            let elapsed = window_start.elapsed();
            if elapsed >= FPS_WINDOW {
                let fps = window_frames as f32 / elapsed.as_secs_f32();
                self.session.set_fps(fps);
                debug!(
                    fps = %format!("{:.1}", fps),
                    hardware_dropped = %self.session.hardware_dropped(),
                    "Capture rate"
                );
                window_start = Instant::now();
                window_frames = 0;
            }

            let mut slot = match pending.take() {
                Some(slot) => slot,
                None => match ring.acquire_write_slot() {
                    Ok(slot) => slot,
                    Err(RingError::Full) => {
                        thread::sleep(FULL_BACKOFF);
                        continue;
                    }
                    Err(e) => {
                        stop_streaming(&mut **device);
                        self.session.transition(Trigger::HardwareError)?;
                        return Err(e.into());
                    }
                },
            };

            match fill_slot(&mut **device, &mut slot, deadline, &self.session) {
                Fill::Filled => {
                    consecutive_timeouts = 0;
                    slot.finalize();
                    frames += 1;
                    window_frames += 1;
                }
                Fill::TimedOut => {
                    consecutive_timeouts += 1;
                    self.session.add_timeout();
                    if consecutive_timeouts > self.timeout_retry_limit {
                        error!(
                            consecutive = %consecutive_timeouts,
                            limit = %self.timeout_retry_limit,
                            "Device keeps timing out"
                        );
                    } else {
                        warn!(consecutive = %consecutive_timeouts, "Frame fetch timed out, retrying");
                    }
                    // Same slot again, nothing published
                    pending = Some(slot);
                    thread::sleep(TIMEOUT_BACKOFF);
                }
                Fill::Aborted => pending = Some(slot),
                Fill::Failed(DeviceError::EndOfStream) => {
                    drop(slot);
                    stop_streaming(&mut **device);
                    self.session.transition(Trigger::Finished)?;

                    info!(frames = %frames, "Stream ended");
                    return Ok(CaptureOutcome::Completed { frames });
                }
                Fill::Failed(e) => {
                    drop(slot);
                    stop_streaming(&mut **device);
                    self.session.transition(Trigger::HardwareError)?;

                    error!(error = %e, frames = %frames, "Device failed, streaming stopped");
                    return Err(e.into());
                }
            }
        }
    }

    /// Runs one exposure and downloads it into `still`.
    ///
    /// The session must already be in `StillExposing`.
    pub fn run_still(&self, still: &StillFrame) -> Result<CaptureOutcome, CaptureError> {
        if still.is_new() {
            warn!("Previous still not taken, waiting for things to settle");
            still.clear_new();
            thread::sleep(UNREAD_STILL_SETTLE);
        }

        let mut device = self.device.lock();
        let format = device.format();
        let exposure = device.exposure();
        debug!(exposure_ms = %exposure.as_millis(), "Starting exposure");

        if let Err(e) = start_exposure(&mut **device) {
            error!(error = %e, "Failed to start exposure");
            self.session.transition(Trigger::HardwareError)?;
            return Err(CaptureError::StartExposure(e));
        }

        let started = Instant::now();
        let mut status_failures = 0u32;

        loop {
            if self.session.abort_requested() {
                stop_exposure(&mut **device);
                self.session.transition(Trigger::Abort)?;
                self.session.clear_abort();

                info!("Exposure aborted");
                return Ok(CaptureOutcome::Aborted { frames: 0 });
            }

            match device.exposure_status() {
                Ok(ExposureStatus::Success) => break,
                Ok(ExposureStatus::Failed) => {
                    stop_exposure(&mut **device);
                    self.session.transition(Trigger::HardwareError)?;
                    error!("Exposure failed");
                    return Err(CaptureError::ExposureFailed);
                }
                Ok(_) => thread::sleep(STATUS_POLL),
                Err(e) => {
                    status_failures += 1;
                    warn!(attempt = %status_failures, error = %e, "Failed to get exposure status");
                    if status_failures >= STATUS_RETRIES {
                        stop_exposure(&mut **device);
                        self.session.transition(Trigger::HardwareError)?;
                        error!(error = %e, "Exposure status timed out");
                        return Err(CaptureError::ExposureStatus(e));
                    }
                    thread::sleep(STATUS_RETRY_BACKOFF);
                }
            }
        }

        debug!(elapsed_ms = %started.elapsed().as_millis(), "Exposure successful");

        if let Err(e) = still.store(format, now_ticks(), |buf| device.download_exposure(buf)) {
            self.session.transition(Trigger::HardwareError)?;
            error!(
                resolution = %format!("{}x{}", format.width, format.height),
                channels = %format.channels,
                bytes = %format.slot_bytes(),
                error = %e,
                "Failed to download exposure"
            );
            return Err(e.into());
        }

        self.session.transition(Trigger::Finished)?;
        info!(bytes = %format.slot_bytes(), "Still captured");
        Ok(CaptureOutcome::Completed { frames: 1 })
    }
}

/// Waits for one frame, in short chunks so an abort is never stuck behind a
/// long exposure
fn fill_slot(device: &mut dyn FrameSource, dst: &mut [u8], deadline: Duration, session: &SessionState) -> Fill {
    let started = Instant::now();
    loop {
        if session.abort_requested() {
            return Fill::Aborted;
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Fill::TimedOut;
        }

        match device.fetch_frame(dst, remaining.min(FETCH_CHUNK)) {
            Ok(()) => return Fill::Filled,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Fill::Failed(e),
        }
    }
}

fn start_exposure(device: &mut dyn FrameSource) -> Result<(), DeviceError> {
    let mut attempt = 1;
    loop {
        match device.start_exposure() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < EXPOSURE_START_ATTEMPTS => {
                warn!(attempt = %attempt, error = %e, "Failed to start exposure, retrying");
                attempt += 1;
                thread::sleep(EXPOSURE_START_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

fn stop_streaming(device: &mut dyn FrameSource) {
    if let Err(e) = device.stop_streaming() {
        error!(error = %e, "Failed to stop streaming");
    }
}

fn stop_exposure(device: &mut dyn FrameSource) {
    if let Err(e) = device.stop_exposure() {
        error!(error = %e, "Failed to stop exposure");
    }
}
