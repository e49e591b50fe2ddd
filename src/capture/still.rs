//! Single-exposure handoff from the capture thread to viewers

use crate::device::FrameFormat;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A downloaded still exposure
#[derive(Debug, Clone)]
pub struct StillImage {
    pub format: FrameFormat,
    pub data: Bytes,
    /// UTC ticks at download
    pub timestamp: u64,
}

struct Slot {
    format: Option<FrameFormat>,
    buffer: Vec<u8>,
    timestamp: u64,
}

/// Mutex-guarded still buffer plus a "new data" flag.
///
/// The capture thread holds the lock while downloading; readers only ever
/// `try_lock`, so they never wait on a download.
pub struct StillFrame {
    slot: Mutex<Slot>,
    is_new: AtomicBool,
}

impl StillFrame {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                format: None,
                buffer: Vec::new(),
                timestamp: 0,
            }),
            is_new: AtomicBool::new(false),
        }
    }

    /// An undisplayed still is waiting
    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub fn clear_new(&self) {
        self.is_new.store(false, Ordering::Release);
    }

    /// Fills the buffer under the lock with `download`, then raises the flag
    /// if it succeeded
    pub fn store<E>(
        &self,
        format: FrameFormat,
        timestamp: u64,
        download: impl FnOnce(&mut [u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut slot = self.slot.lock();
        slot.buffer.resize(format.slot_bytes(), 0);
        download(&mut slot.buffer)?;
        slot.format = Some(format);
        slot.timestamp = timestamp;
        drop(slot);

        self.is_new.store(true, Ordering::Release);
        Ok(())
    }

    /// Takes the newest still if there is one and the lock is free
    pub fn take(&self) -> Option<StillImage> {
        if !self.is_new() {
            return None;
        }
        let slot = self.slot.try_lock()?;
        let format = slot.format?;
        let image = StillImage {
            format,
            data: Bytes::copy_from_slice(&slot.buffer),
            timestamp: slot.timestamp,
        };
        drop(slot);

        self.clear_new();
        Some(image)
    }
}

impl Default for StillFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::ColorId;

    fn format() -> FrameFormat {
        FrameFormat {
            width: 2,
            height: 2,
            channels: 1,
            bytes_per_channel: 1,
            color: ColorId::Mono,
        }
    }

    #[test]
    fn test_take_once() {
        let still = StillFrame::new();
        assert!(still.take().is_none());

        still
            .store(format(), 42, |buf| {
                buf.copy_from_slice(&[1, 2, 3, 4]);
                Ok::<_, ()>(())
            })
            .unwrap();

        let image = still.take().unwrap();
        assert_eq!(&image.data[..], &[1, 2, 3, 4]);
        assert_eq!(image.timestamp, 42);
        assert!(still.take().is_none());
    }

    #[test]
    fn test_failed_download_is_not_new() {
        let still = StillFrame::new();
        let result = still.store(format(), 0, |_| Err("no data"));
        assert!(result.is_err());
        assert!(!still.is_new());
    }

    #[test]
    fn test_take_does_not_block_while_locked() {
        let still = StillFrame::new();
        still.store(format(), 0, |_| Ok::<_, ()>(())).unwrap();

        let guard = still.slot.lock();
        assert!(still.take().is_none());
        drop(guard);
        assert!(still.take().is_some());
    }
}
