//! State shared between the capture, recording and preview threads

use crate::capture::{CaptureError, CaptureState, Trigger};
use crate::device::FrameFormat;
use crate::ring::RingBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Ring and format of one streaming run
pub struct Stream {
    pub id: u64,
    pub ring: RingBuffer,
    pub format: FrameFormat,
}

/// Loop-control flags and counters.
///
/// Everything here is an atomic so no thread ever waits on another to read
/// or publish state.
pub struct SessionState {
    state: AtomicU8,
    abort: AtomicBool,
    shutdown: AtomicBool,

    do_record: AtomicBool,
    is_recording: AtomicBool,
    recorder_busy: AtomicBool,

    captured: AtomicU64,
    dropped: AtomicU64,
    hardware_dropped: AtomicU64,
    timeouts: AtomicU64,
    fps_bits: AtomicU32,

    stream: Mutex<Option<Arc<Stream>>>,
    next_stream_id: AtomicU64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Idle as u8),
            abort: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            do_record: AtomicBool::new(false),
            is_recording: AtomicBool::new(false),
            recorder_busy: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            hardware_dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0),
            stream: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Applies `trigger` to the current state atomically
    pub fn transition(&self, trigger: Trigger) -> Result<CaptureState, CaptureError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = CaptureState::from_u8(current);
            let to = from.next(trigger)?;
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug!(from = ?from, trigger = ?trigger, to = ?to, "Capture state changed");
                    return Ok(to);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Streaming is in progress (including its abort)
    pub fn is_active(&self) -> bool {
        matches!(self.state(), CaptureState::Streaming | CaptureState::Aborting)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn set_do_record(&self, enabled: bool) {
        self.do_record.store(enabled, Ordering::Release);
    }

    pub fn do_record(&self) -> bool {
        self.do_record.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, recording: bool) {
        self.is_recording.store(recording, Ordering::Release);
    }

    /// A container is open
    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    pub fn set_recorder_busy(&self, busy: bool) {
        self.recorder_busy.store(busy, Ordering::Release);
    }

    /// The recording thread is still draining a stream
    pub fn recorder_busy(&self) -> bool {
        self.recorder_busy.load(Ordering::Acquire)
    }

    pub fn captured_count(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn add_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn set_dropped(&self, dropped: u64) {
        self.dropped.store(dropped, Ordering::Relaxed);
    }

    /// Counters of a new container start from zero
    pub fn reset_recording_counters(&self) {
        self.captured.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    pub fn hardware_dropped(&self) -> u64 {
        self.hardware_dropped.load(Ordering::Relaxed)
    }

    pub fn set_hardware_dropped(&self, dropped: u64) {
        self.hardware_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn add_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    /// Installs the ring for a new stream and resets the stream counters
    pub fn begin_stream(&self, ring: RingBuffer, format: FrameFormat) -> Arc<Stream> {
        let stream = Arc::new(Stream {
            id: self.next_stream_id.fetch_add(1, Ordering::Relaxed),
            ring,
            format,
        });

        self.reset_recording_counters();
        self.hardware_dropped.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.set_fps(0.0);
        *self.stream.lock() = Some(Arc::clone(&stream));
        stream
    }

    /// The current (or last) stream; stays set after the stream ends so its
    /// last frame remains viewable
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.lock().clone()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
