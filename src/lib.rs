//! Imaging sensor acquisition with SER video recording and live preview
//!
//! Frames flow from a [`FrameSource`](device::FrameSource) through a fixed
//! ring buffer into SER containers:
//! - Lock-free single-producer/single-consumer ring with a bounded memory budget
//! - Every committed frame is written exactly once or counted as dropped
//! - Byte-order independent SER headers and timestamp trailers
//! - Non-blocking, rate-limited preview of the newest frame
//!
//! # Example
//!
//! ```no_run
//! use astro_capture::{config::Config, device, Acquisition};
//! use std::time::Duration;
//!
//! let config = Config::default();
//! let acq = Acquisition::new(device::open(&config.device)?, &config)?;
//! acq.toggle_record(true);
//! acq.start_streaming()?;
//! std::thread::sleep(Duration::from_secs(5));
//! acq.request_abort();
//! acq.wait_idle(Duration::from_secs(5))?;
//! println!("captured {} frames", acq.captured_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod capture;
pub mod config;
pub mod device;
pub mod preview;
pub mod recorder;
pub mod ring;
pub mod ser;
pub mod session;

// Re-exports for convenience
pub use acquisition::Acquisition;
pub use capture::{CaptureError, CaptureOutcome, CaptureState, CaptureStats, StillImage};
pub use device::{DeviceError, DeviceHandle, FrameFormat, FrameSource};
pub use preview::{Preview, PreviewFrame};
pub use ring::{OverflowPolicy, RingBuffer, RingError};
pub use ser::{ColorId, SerError, SerHeader, SerReader, SerWriter};
