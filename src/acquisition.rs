//! Acquisition handle: owns the device, the session and the worker threads
//!
//! This is the surface the rest of an application talks to. It never blocks
//! on the capture or recording threads except in [`Acquisition::wait_idle`]
//! and [`Acquisition::shutdown`].

use crate::capture::{
    CaptureError, CaptureLoop, CaptureOutcome, CaptureState, CaptureStats, StillFrame, StillImage, Trigger,
};
use crate::config::Config;
use crate::device::{DeviceHandle, FrameFormat};
use crate::preview::PreviewFrame;
use crate::recorder::RecordingLoop;
use crate::ring::{OverflowPolicy, RingBuffer};
use crate::session::SessionState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const WAIT_POLL: Duration = Duration::from_millis(10);

type CaptureResult = Result<CaptureOutcome, CaptureError>;

pub struct Acquisition {
    device: DeviceHandle,
    session: Arc<SessionState>,
    still: Arc<StillFrame>,

    buffer_bytes: usize,
    overflow: OverflowPolicy,
    timeout_retry_limit: u32,

    capture_thread: Mutex<Option<JoinHandle<CaptureResult>>>,
    recorder_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acquisition {
    /// Starts the recording thread; nothing is captured until
    /// [`start_streaming`](Self::start_streaming) or
    /// [`capture_still`](Self::capture_still)
    pub fn new(device: DeviceHandle, config: &Config) -> Result<Self, CaptureError> {
        let session = Arc::new(SessionState::new());

        let recorder = RecordingLoop::new(Arc::clone(&session), config.recording.clone());
        let recorder_thread = thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || recorder.run())
            .map_err(|e| CaptureError::Device(e.into()))?;

        info!(
            buffer_mib = %config.capture.buffer_mib,
            overflow = ?config.capture.overflow,
            "Acquisition ready"
        );

        Ok(Self {
            device,
            session,
            still: Arc::new(StillFrame::new()),
            buffer_bytes: config.buffer_bytes(),
            overflow: config.capture.overflow,
            timeout_retry_limit: config.capture.timeout_retry_limit,
            capture_thread: Mutex::new(None),
            recorder_thread: Mutex::new(Some(recorder_thread)),
        })
    }

    pub fn format(&self) -> FrameFormat {
        self.device.format()
    }

    /// Starts a stream on a new capture thread
    pub fn start_streaming(&self) -> Result<(), CaptureError> {
        self.reap_finished_capture();

        let format = self.device.format();
        let ring = RingBuffer::with_budget(self.buffer_bytes, format.slot_bytes(), self.overflow)?;

        // Fails unless Idle, before the previous stream's ring is replaced
        self.check_idle(Trigger::StartStreaming)?;
        let stream = self.session.begin_stream(ring, format);
        self.session.clear_abort();
        self.session.transition(Trigger::StartStreaming)?;

        let capture = self.capture_loop();
        self.spawn_capture("capture", move || capture.run_streaming(&stream))
    }

    /// Takes one still exposure on a new capture thread
    pub fn capture_still(&self) -> Result<(), CaptureError> {
        self.reap_finished_capture();
        self.check_idle(Trigger::StartStill)?;
        self.session.clear_abort();
        self.session.transition(Trigger::StartStill)?;

        let capture = self.capture_loop();
        let still = Arc::clone(&self.still);
        self.spawn_capture("still", move || capture.run_still(&still))
    }

    /// Asks the running capture to stop; returns immediately
    pub fn request_abort(&self) {
        if self.session.state() != CaptureState::Idle {
            info!(state = ?self.session.state(), "Abort requested");
            self.session.request_abort();
        }
    }

    /// Enables or disables writing frames to disk without touching the stream
    pub fn toggle_record(&self, enabled: bool) {
        if self.session.do_record() != enabled {
            info!(enabled = %enabled, "Recording toggled");
        }
        self.session.set_do_record(enabled);
    }

    pub fn buffer_fullness(&self) -> f32 {
        self.session.stream().map_or(0.0, |stream| stream.ring.fullness())
    }

    /// Frames written to the current (or last) container
    pub fn captured_count(&self) -> u64 {
        self.session.captured_count()
    }

    /// Frames lost since the current (or last) container opened
    pub fn dropped_count(&self) -> u64 {
        self.session.dropped_count()
    }

    /// Copy of the newest streamed frame; never blocks
    pub fn latest_frame(&self) -> Option<PreviewFrame> {
        let stream = self.session.stream()?;
        PreviewFrame::latest(&stream)
    }

    /// The last still, once, if it has not been taken yet
    pub fn take_still(&self) -> Option<StillImage> {
        self.still.take()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    pub fn state(&self) -> CaptureState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn stats(&self) -> CaptureStats {
        let stream = self.session.stream();
        CaptureStats {
            state: self.session.state(),
            frames_produced: stream.as_ref().map_or(0, |s| s.ring.produced()),
            frames_captured: self.session.captured_count(),
            frames_dropped: self.session.dropped_count(),
            ring_dropped: stream.as_ref().map_or(0, |s| s.ring.dropped()),
            hardware_dropped: self.session.hardware_dropped(),
            timeouts: self.session.timeouts(),
            fps: self.session.fps(),
            buffer_fullness: stream.as_ref().map_or(0.0, |s| s.ring.fullness()),
            is_recording: self.session.is_recording(),
        }
    }

    /// Waits until the capture has ended and the recorder has drained and
    /// closed its container, then returns how the capture ended.
    ///
    /// Returns `Ok(None)` if no capture was started since the last wait.
    pub fn wait_idle(&self, timeout: Duration) -> Result<Option<CaptureOutcome>, CaptureError> {
        let deadline = Instant::now() + timeout;

        loop {
            let stream_pending = self.session.stream().is_some_and(|s| !s.ring.is_empty());
            if self.session.state() == CaptureState::Idle && !stream_pending && !self.session.recorder_busy() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(state = ?self.session.state(), "Capture did not finish in time");
                return Err(CaptureError::WaitTimeout);
            }
            thread::sleep(WAIT_POLL);
        }

        let handle = self.capture_thread.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| CaptureError::ThreadPanicked)?.map(Some),
            None => Ok(None),
        }
    }

    /// Aborts any capture, drains the recorder and joins both threads
    pub fn shutdown(&self) {
        self.request_abort();
        if let Err(e) = self.wait_idle(Duration::from_secs(10)) {
            error!(error = %e, "Capture ended with an error");
        }

        self.session.request_shutdown();
        if let Some(handle) = self.recorder_thread.lock().take() {
            if handle.join().is_err() {
                error!("Recording thread panicked");
            }
        }
        info!("Acquisition shut down");
    }

    fn capture_loop(&self) -> CaptureLoop {
        CaptureLoop::new(self.device.clone(), Arc::clone(&self.session), self.timeout_retry_limit)
    }

    fn check_idle(&self, trigger: Trigger) -> Result<(), CaptureError> {
        self.session.state().next(trigger).map(|_| ())
    }

    /// Joins a capture thread that already returned, logging its result
    fn reap_finished_capture(&self) {
        let mut slot = self.capture_thread.lock();
        if !slot.as_ref().is_some_and(|handle| handle.is_finished()) {
            return;
        }
        if let Some(handle) = slot.take() {
            match handle.join() {
                Ok(Ok(outcome)) => info!(outcome = ?outcome, "Previous capture finished"),
                Ok(Err(e)) => warn!(error = %e, "Previous capture failed"),
                Err(_) => error!("Previous capture thread panicked"),
            }
        }
    }

    fn spawn_capture<F>(&self, name: &str, body: F) -> Result<(), CaptureError>
    where
        F: FnOnce() -> CaptureResult + Send + 'static,
    {
        let spawned = thread::Builder::new().name(name.to_string()).spawn(body);
        match spawned {
            Ok(handle) => {
                *self.capture_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Nothing will drive the state back, so do it here
                if let Err(reset) = self.session.transition(Trigger::HardwareError) {
                    error!(error = %reset, "Could not reset capture state");
                }
                Err(CaptureError::Device(e.into()))
            }
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.recorder_thread.lock().is_some() {
            self.shutdown();
        }
    }
}
