//! SER reader

use super::header::get_u64;
use super::time::{ticks_to_datetime, ticks_to_duration};
use super::{SerError, SerHeader, WireOrder, HEADER_SIZE, TIMESTAMP_SIZE};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How much of a container made it to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,

    /// All frames present, no trailer
    MissingTrailer,

    /// Trailer shorter than one tick per frame
    IncompleteTrailer { present: u64, expected: u64 },

    /// File ends before the declared frames do, or was never closed;
    /// `available` whole frames remain
    Truncated { declared: u32, available: u32 },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Random-access reader for SER files
pub struct SerReader {
    path: PathBuf,
    file: File,
    file_size: u64,
    header: SerHeader,
    frame_size: u64,
    frame_count: u32,
    /// End of the last readable frame
    data_end: u64,
    completeness: Completeness,
    order: WireOrder,
}

impl SerReader {
    /// Opens a container using the current byte-order rules
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SerError> {
        Self::open_with_order(path, WireOrder::current())
    }

    /// Opens and validates the header.
    ///
    /// A file cut short is still accepted: the frame count is recomputed from
    /// the file size and [`completeness`](Self::completeness) reports it.
    pub fn open_with_order<P: AsRef<Path>>(path: P, order: WireOrder) -> Result<Self, SerError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        info!(path = %path.display(), bytes = %file_size, "Opened container");

        if file_size < HEADER_SIZE as u64 {
            error!(path = %path.display(), bytes = %file_size, "File too small for a header");
            return Err(SerError::HeaderTruncated { size: file_size });
        }

        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact(&mut raw)?;
        let header = SerHeader::decode(&raw, order.disk())?;

        if !header.has_valid_id() {
            error!(file_id = %header.file_id_lossy(), "Invalid file id");
            return Err(SerError::BadMagic(header.file_id_lossy()));
        }

        let frame_size = match header.frame_size() {
            Some(0) => {
                return Err(SerError::UnsupportedFormat(format!(
                    "{}x{} at {} bits gives empty frames",
                    header.width, header.height, header.pixel_depth
                )))
            }
            Some(size) => size,
            None => {
                error!(width = %header.width, height = %header.height, "Frame size overflows");
                return Err(SerError::UnsupportedFormat(format!(
                    "{}x{} at {} bits is too large",
                    header.width, header.height, header.pixel_depth
                )));
            }
        };

        let declared = header.frame_count;
        let trailer_len = u64::from(declared) * TIMESTAMP_SIZE as u64;

        // A writer that never closed leaves frame_count at 0 with frames after it
        let unfinished = declared == 0 && file_size > HEADER_SIZE as u64;

        // An offset past u64 can only mean the file is short of its frames
        let trailer_offset = header
            .trailer_offset()
            .filter(|&offset| offset <= file_size && !unfinished);

        let (frame_count, completeness) = if let Some(trailer_offset) = trailer_offset {
            Self::classify(declared, trailer_offset, trailer_len, file_size)
        } else {
            let available = u32::try_from((file_size - HEADER_SIZE as u64) / frame_size).unwrap_or(u32::MAX);
            warn!(
                declared = %declared,
                available = %available,
                bytes = %file_size,
                "Incomplete file, limiting to the frames present"
            );
            (available, Completeness::Truncated { declared, available })
        };
        let data_end = HEADER_SIZE as u64 + u64::from(frame_count) * frame_size;

        debug!(
            width = %header.width,
            height = %header.height,
            depth = %header.pixel_depth,
            color_id = %header.color_id,
            frames = %frame_count,
            "Header read"
        );

        Ok(Self {
            path,
            file,
            file_size,
            header,
            frame_size,
            frame_count,
            data_end,
            completeness,
            order,
        })
    }

    /// Frame count and completeness of a file holding all declared frames
    fn classify(declared: u32, trailer_offset: u64, trailer_len: u64, file_size: u64) -> (u32, Completeness) {
        if file_size == trailer_offset {
            warn!(trailer_offset = %trailer_offset, "Missing timestamp trailer");
            (declared, Completeness::MissingTrailer)
        } else if file_size - trailer_offset < trailer_len {
            let present = file_size - trailer_offset;
            error!(present = %present, expected = %trailer_len, "Incomplete timestamp trailer");
            (
                declared,
                Completeness::IncompleteTrailer {
                    present,
                    expected: trailer_len,
                },
            )
        } else {
            (declared, Completeness::Complete)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header as stored; `frame_count` there is the declared value
    pub fn header(&self) -> &SerHeader {
        &self.header
    }

    /// Frames actually readable
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn declared_frame_count(&self) -> u32 {
        self.header.frame_count
    }

    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn completeness(&self) -> Completeness {
        self.completeness
    }

    pub fn is_incomplete(&self) -> bool {
        !self.completeness.is_complete()
    }

    fn trailer_offset(&self) -> u64 {
        self.data_end
    }

    /// True when bytes follow the last frame
    pub fn has_trailer(&self) -> bool {
        !matches!(self.completeness, Completeness::Truncated { .. })
            && self.file_size > self.trailer_offset()
    }

    /// Reads one whole frame
    pub fn get_frame(&mut self, index: u32) -> Result<Bytes, SerError> {
        if index >= self.frame_count {
            return Err(SerError::FrameOutOfRange {
                index,
                count: self.frame_count,
            });
        }

        let size = self.frame_size;
        // index < frame_count, so this stays below data_end
        let offset = HEADER_SIZE as u64 + u64::from(index) * size;
        if offset + size > self.file_size {
            return Err(SerError::FrameBeyondEof {
                index,
                end: offset + size,
                size: self.file_size,
            });
        }

        let mut frame = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut frame)?;
        debug!(index = %index, offset = %offset, bytes = %size, "Read frame");

        Ok(Bytes::from(frame))
    }

    /// Tick of frame `index`.
    ///
    /// An index past the last frame is clamped to the last frame rather than
    /// rejected.
    pub fn frame_timestamp(&mut self, index: u32) -> Result<u64, SerError> {
        if !self.has_trailer() || self.frame_count == 0 {
            return Err(SerError::NoTrailer);
        }

        let index = if index >= self.frame_count {
            warn!(
                requested = %index,
                frames = %self.frame_count,
                "Timestamp index past the last frame, using the last one"
            );
            self.frame_count - 1
        } else {
            index
        };

        let offset = self.trailer_offset() + u64::from(index) * TIMESTAMP_SIZE as u64;
        if offset + TIMESTAMP_SIZE as u64 > self.file_size {
            return Err(SerError::TrailerTruncated { index });
        }

        let mut raw = [0u8; TIMESTAMP_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;

        Ok(get_u64(&mut &raw[..], self.order.disk()))
    }

    /// Every tick present in the trailer, in frame order
    pub fn timestamps(&mut self) -> Result<Vec<u64>, SerError> {
        if !self.has_trailer() {
            return Err(SerError::NoTrailer);
        }

        let offset = self.trailer_offset();
        let present = ((self.file_size - offset) / TIMESTAMP_SIZE as u64).min(u64::from(self.frame_count));

        let mut raw = vec![0u8; present as usize * TIMESTAMP_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;

        let disk = self.order.disk();
        let mut cur = &raw[..];
        Ok((0..present).map(|_| get_u64(&mut cur, disk)).collect())
    }

    pub fn first_timestamp(&mut self) -> Result<u64, SerError> {
        self.frame_timestamp(0)
    }

    pub fn last_timestamp(&mut self) -> Result<u64, SerError> {
        self.frame_timestamp(self.frame_count.saturating_sub(1))
    }

    /// Time between first and last frame, `None` without a usable trailer
    pub fn duration(&mut self) -> Option<Duration> {
        let first = self.first_timestamp().ok()?;
        let last = self.last_timestamp().ok()?;
        if last < first {
            error!(first = %first, last = %last, "Bad timestamp order");
            return None;
        }
        Some(ticks_to_duration(last - first))
    }

    /// Capture time of frame `index` as UTC
    pub fn frame_time(&mut self, index: u32) -> Result<Option<DateTime<Utc>>, SerError> {
        Ok(ticks_to_datetime(self.frame_timestamp(index)?))
    }
}
