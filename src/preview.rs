//! Decimated live view of the newest frame

use crate::device::FrameFormat;
use crate::session::Stream;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Copy of a published ring slot
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub stream: u64,
    /// Ring sequence number; increases with every published frame
    pub sequence: u64,
    pub format: FrameFormat,
    pub data: Bytes,
}

impl PreviewFrame {
    /// Copies the newest slot of `stream`, or `None` when nothing was
    /// published yet or the slot is being rewritten right now
    pub fn latest(stream: &Stream) -> Option<Self> {
        let view = stream.ring.peek_last()?;
        Some(Self {
            stream: stream.id,
            sequence: view.sequence(),
            format: stream.format,
            data: Bytes::copy_from_slice(&view),
        })
    }

    /// Mean sample value, normalized to `[0, 1]`
    pub fn mean_level(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }

        match self.format.bytes_per_channel {
            2 => {
                let samples = self.data.chunks_exact(2).map(|c| u64::from(u16::from_le_bytes([c[0], c[1]])));
                let count = (self.data.len() / 2).max(1) as f64;
                (samples.sum::<u64>() as f64 / count / f64::from(u16::MAX)) as f32
            }
            _ => {
                let sum: u64 = self.data.iter().map(|&b| u64::from(b)).sum();
                (sum as f64 / self.data.len() as f64 / 255.0) as f32
            }
        }
    }
}

/// Rate-limits preview reads to a target frame rate.
///
/// Never blocks and never consumes: each poll either returns a fresh copy of
/// the newest frame or `None`.
pub struct Preview {
    interval: Duration,
    last_shown: Option<Instant>,
    last_key: Option<(u64, u64)>,
}

impl Preview {
    /// `target_fps == 0` disables rate limiting
    pub fn new(target_fps: u32) -> Self {
        let interval = if target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / target_fps
        };
        Self {
            interval,
            last_shown: None,
            last_key: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Newest frame, if the interval elapsed and it was not shown before
    pub fn poll(&mut self, stream: &Stream) -> Option<PreviewFrame> {
        if let Some(last) = self.last_shown {
            if last.elapsed() < self.interval {
                return None;
            }
        }

        let frame = PreviewFrame::latest(stream)?;
        let key = (frame.stream, frame.sequence);
        if self.last_key == Some(key) {
            return None;
        }

        self.last_key = Some(key);
        self.last_shown = Some(Instant::now());
        Some(frame)
    }
}
