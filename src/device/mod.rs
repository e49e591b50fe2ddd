//! Imaging device abstraction
//!
//! The acquisition core only needs a handful of calls from a camera: fill a
//! buffer with the next streamed frame, report the frame format, and run a
//! single long exposure. [`FrameSource`] captures exactly that.

#[cfg(feature = "gstreamer")]
mod gst;
#[cfg(feature = "gstreamer")]
mod platform;
mod synthetic;

#[cfg(feature = "gstreamer")]
pub use gst::GstSource;
#[cfg(feature = "gstreamer")]
pub use platform::PlatformInfo;
pub use synthetic::{Faults, SyntheticSource};

use crate::config::{DeviceConfig, DeviceKind};
use crate::ser::{ColorId, FrameDims};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("end of stream")]
    EndOfStream,

    #[error("device disconnected")]
    Disconnected,

    #[error("device is not streaming")]
    NotStreaming,

    #[error("no exposure ready for download")]
    NotReady,

    #[error("buffer is {actual} bytes, frame needs {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "gstreamer")]
    #[error("GStreamer error: {0}")]
    Gst(#[from] gstreamer::glib::Error),

    #[cfg(feature = "gstreamer")]
    #[error("GStreamer bool error: {0}")]
    GstBool(#[from] gstreamer::glib::BoolError),

    #[error("state change error: {0}")]
    StateChange(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("unsupported device: {0}")]
    Unsupported(String),
}

impl DeviceError {
    /// Transient errors are retried by the capture loop, everything else ends
    /// the stream
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Buffer-wide pixel layout of every frame a source produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub bytes_per_channel: u8,
    pub color: ColorId,
}

impl FrameFormat {
    /// Bytes in one frame
    pub fn slot_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize * usize::from(self.bytes_per_channel)
    }

    pub fn dims(&self) -> FrameDims {
        FrameDims::new(self.width, self.height)
    }
}

impl From<&DeviceConfig> for FrameFormat {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            channels: config.channels,
            bytes_per_channel: config.bytes_per_channel,
            color: config.color,
        }
    }
}

/// State of a single (still) exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    Idle,
    Working,
    Success,
    Failed,
}

/// A camera as seen by the capture loop.
///
/// All calls are made from one thread at a time (the capture thread holds the
/// device lock for the duration of a stream or exposure).
pub trait FrameSource: Send {
    fn format(&self) -> FrameFormat;

    /// Current exposure time; bounds how long a frame fetch may wait
    fn exposure(&self) -> Duration;

    fn start_streaming(&mut self) -> Result<(), DeviceError>;

    fn stop_streaming(&mut self) -> Result<(), DeviceError>;

    /// Fills `dst` with the next frame, waiting at most `timeout`.
    ///
    /// Returns [`DeviceError::Timeout`] when no frame arrived in time; `dst`
    /// may then hold partial data and must not be published.
    fn fetch_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<(), DeviceError>;

    /// Frames the hardware dropped since streaming started
    fn dropped_frames(&mut self) -> Result<u64, DeviceError>;

    fn start_exposure(&mut self) -> Result<(), DeviceError>;

    fn exposure_status(&mut self) -> Result<ExposureStatus, DeviceError>;

    /// Copies a finished exposure into `dst`
    fn download_exposure(&mut self, dst: &mut [u8]) -> Result<(), DeviceError>;

    fn stop_exposure(&mut self) -> Result<(), DeviceError>;
}

/// Shared ownership of the one open device.
///
/// The format is cached at construction so it can be read while a capture
/// thread holds the lock.
#[derive(Clone)]
pub struct DeviceHandle {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    format: FrameFormat,
}

impl DeviceHandle {
    pub fn new<S: FrameSource + 'static>(source: S) -> Self {
        let format = source.format();
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            format,
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Exclusive access; blocks while a capture is running
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Box<dyn FrameSource>>> {
        self.source.try_lock()
    }
}

/// Opens the device described by `config`
pub fn open(config: &DeviceConfig) -> Result<DeviceHandle, DeviceError> {
    let format = FrameFormat::from(config);
    let exposure = Duration::from_millis(config.exposure_ms);

    info!(
        kind = ?config.kind,
        resolution = %format!("{}x{}", format.width, format.height),
        channels = %format.channels,
        bytes_per_channel = %format.bytes_per_channel,
        color = %format.color,
        fps = %config.fps,
        "Opening device"
    );

    match config.kind {
        DeviceKind::Synthetic => Ok(DeviceHandle::new(SyntheticSource::new(format, config.fps, exposure))),

        #[cfg(feature = "gstreamer")]
        DeviceKind::Gstreamer => Ok(DeviceHandle::new(GstSource::new(
            &config.path,
            format,
            config.fps,
            exposure,
        )?)),

        #[cfg(not(feature = "gstreamer"))]
        DeviceKind::Gstreamer => Err(DeviceError::Unsupported(
            "built without the `gstreamer` feature".to_string(),
        )),
    }
}
