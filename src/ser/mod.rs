//! SER video container
//!
//! Layout on disk:
//!
//! ```text
//! offset 0      178-byte header (see `header`)
//! offset 178    frame_0 .. frame_{n-1}, each width * height * bytes_per_pixel
//! after frames  trailer: one u64 tick per frame (100 ns since 0001-01-01 UTC)
//! ```
//!
//! The writer never rewrites the header per frame; it patches `frame_count` and
//! appends the trailer on close. The reader tolerates truncated files by
//! recomputing the frame count from the file size.

mod header;
mod reader;
pub mod time;
mod writer;

pub use header::{SerHeader, FILE_ID, HEADER_SIZE, METADATA_FIELD_LEN};
pub use reader::{Completeness, SerReader};
pub use writer::SerWriter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Size of one trailer entry
pub const TIMESTAMP_SIZE: usize = 8;

#[derive(Error, Debug)]
pub enum SerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container file is not open")]
    NotOpen,

    #[error("header has not been prepared")]
    HeaderNotPrepared,

    #[error("file too small for a header: {size} bytes")]
    HeaderTruncated { size: u64 },

    #[error("invalid file id: {0:?}")]
    BadMagic(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("frame is {actual} bytes, container expects {expected}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("frame {index} out of range ({count} frames)")]
    FrameOutOfRange { index: u32, count: u32 },

    #[error("frame {index} ends at {end}, past end of file ({size})")]
    FrameBeyondEof { index: u32, end: u64, size: u64 },

    #[error("container has no timestamp trailer")]
    NoTrailer,

    #[error("timestamp {index} is past the end of the trailer")]
    TrailerTruncated { index: u32 },

    #[error("frame count limit reached")]
    TooManyFrames,
}

/// Color layout codes stored in the header's `color_id` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum ColorId {
    #[default]
    Mono = 0,
    Rggb = 8,
    Grbg = 9,
    Gbrg = 10,
    Bggr = 11,
    Cyym = 16,
    Ycmy = 17,
    Ymcy = 18,
    Myyc = 19,
    Rgb = 100,
    Bgr = 101,
}

impl ColorId {
    pub fn from_code(code: u32) -> Option<Self> {
        let color = match code {
            0 => Self::Mono,
            8 => Self::Rggb,
            9 => Self::Grbg,
            10 => Self::Gbrg,
            11 => Self::Bggr,
            16 => Self::Cyym,
            17 => Self::Ycmy,
            18 => Self::Ymcy,
            19 => Self::Myyc,
            100 => Self::Rgb,
            101 => Self::Bgr,
            _ => return None,
        };
        Some(color)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Color planes per pixel: 3 for RGB/BGR, 1 for mono and Bayer mosaics
    pub fn planes(self) -> u32 {
        planes_for_code(self.code())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mono => "MONO",
            Self::Rggb => "RGGB",
            Self::Grbg => "GRBG",
            Self::Gbrg => "GBRG",
            Self::Bggr => "BGGR",
            Self::Cyym => "CYYM",
            Self::Ycmy => "YCMY",
            Self::Ymcy => "YMCY",
            Self::Myyc => "MYYC",
            Self::Rgb => "RGB",
            Self::Bgr => "BGR",
        }
    }
}

impl fmt::Display for ColorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn planes_for_code(code: u32) -> u32 {
    if code >= ColorId::Rgb.code() {
        3
    } else {
        1
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Free-text header fields, each stored in 40 bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub observer: String,

    #[serde(default)]
    pub instrument: String,

    #[serde(default)]
    pub telescope: String,
}

/// Byte order of a host or of data on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

static NEVER_SWAP: AtomicBool = AtomicBool::new(false);

/// Process-wide switch: encode headers and trailers in host order instead of
/// normalizing them to little-endian.
///
/// Some writers in the wild never swap, so on big-endian machines their files
/// carry big-endian headers. Enable this to read or produce such files.
pub fn set_never_swap(enabled: bool) {
    NEVER_SWAP.store(enabled, Ordering::Relaxed);
}

pub fn never_swap() -> bool {
    NEVER_SWAP.load(Ordering::Relaxed)
}

/// Byte-order rules for one writer or reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireOrder {
    pub host: ByteOrder,
    pub never_swap: bool,
}

impl WireOrder {
    /// Native host order and the current process-wide never-swap setting
    pub fn current() -> Self {
        Self {
            host: ByteOrder::native(),
            never_swap: never_swap(),
        }
    }

    /// Rules for a host of the given byte order, swapping normally
    pub fn for_host(host: ByteOrder) -> Self {
        Self {
            host,
            never_swap: false,
        }
    }

    /// Order of header fields and trailer ticks in the file
    pub fn disk(&self) -> ByteOrder {
        if self.never_swap {
            self.host
        } else {
            ByteOrder::Little
        }
    }

    /// Value for the header's `little_endian` field.
    ///
    /// The field keeps its historical inverted meaning: 1 says the pixel data
    /// is big-endian (written by a big-endian host), 0 says little-endian.
    pub fn data_flag(&self) -> u32 {
        match self.host {
            ByteOrder::Big => 1,
            ByteOrder::Little => 0,
        }
    }
}

impl Default for WireOrder {
    fn default() -> Self {
        Self::current()
    }
}
