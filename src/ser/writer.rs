//! SER writer

use super::header::put_u64;
use super::time::{local_now_ticks, now_ticks};
use super::{ColorId, FrameDims, Metadata, SerError, SerHeader, WireOrder, HEADER_SIZE, TIMESTAMP_SIZE};
use bytes::BytesMut;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const WRITE_BUFFER: usize = 256 * 1024;

/// Appends frames to a SER file.
///
/// Opening never fails loudly: check [`is_open`](Self::is_open) and skip
/// writing if the file could not be created.
///
/// The header and every frame are flushed to the OS as soon as they are
/// written, so a file left behind by a crash still opens as a truncated
/// recording.
pub struct SerWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    open_error: Option<io::Error>,
    order: WireOrder,
    header: Option<SerHeader>,
    frame_size: usize,
    /// Offset just past the last fully written frame
    data_end: u64,
    timestamps: Vec<u64>,
}

impl SerWriter {
    /// Creates (truncating) the file at `path` using the current byte-order rules
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_order(path, WireOrder::current())
    }

    pub fn with_order<P: AsRef<Path>>(path: P, order: WireOrder) -> Self {
        let path = path.as_ref().to_path_buf();

        let (file, open_error) = match File::create(&path) {
            Ok(file) => (Some(BufWriter::with_capacity(WRITE_BUFFER, file)), None),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Container could not be opened");
                (None, Some(e))
            }
        };

        Self {
            path,
            file,
            open_error,
            order,
            header: None,
            frame_size: 0,
            data_end: 0,
            timestamps: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Why the file could not be opened, if it could not
    pub fn open_error(&self) -> Option<&io::Error> {
        self.open_error.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> Option<&SerHeader> {
        self.header.as_ref()
    }

    pub fn frame_count(&self) -> u32 {
        self.timestamps.len() as u32
    }

    /// Bytes per frame, known once the header is prepared
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Writes the header at offset 0 with `frame_count = 0`
    pub fn prepare_header(
        &mut self,
        dims: FrameDims,
        metadata: &Metadata,
        bytes_per_channel: u8,
        color: ColorId,
    ) -> Result<(), SerError> {
        if !matches!(bytes_per_channel, 1 | 2) {
            return Err(SerError::UnsupportedFormat(format!(
                "{} bytes per channel",
                bytes_per_channel
            )));
        }

        let mut header = SerHeader::new(dims.width, dims.height, bytes_per_channel, color, metadata);
        header.little_endian = self.order.data_flag();
        header.date_time = local_now_ticks();
        header.date_time_utc = now_ticks();

        let frame_size = header
            .frame_size()
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| SerError::UnsupportedFormat("frame too large".to_string()))?;
        if frame_size == 0 {
            return Err(SerError::UnsupportedFormat(format!(
                "empty frame {}x{}",
                dims.width, dims.height
            )));
        }

        let encoded = header.encode(self.order.disk());
        let file = self.file.as_mut().ok_or(SerError::NotOpen)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encoded)?;
        file.flush()?;

        info!(
            path = %self.path.display(),
            resolution = %format!("{}x{}", dims.width, dims.height),
            color = %color,
            depth = %header.pixel_depth,
            frame_bytes = %frame_size,
            "Created container"
        );

        self.frame_size = frame_size;
        self.data_end = HEADER_SIZE as u64;
        self.header = Some(header);
        self.timestamps.clear();
        Ok(())
    }

    /// Appends one frame and records its timestamp
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), SerError> {
        if self.header.is_none() {
            return Err(SerError::HeaderNotPrepared);
        }
        if payload.len() != self.frame_size {
            return Err(SerError::FrameSizeMismatch {
                expected: self.frame_size,
                actual: payload.len(),
            });
        }
        if self.timestamps.len() >= u32::MAX as usize {
            return Err(SerError::TooManyFrames);
        }

        let file = self.file.as_mut().ok_or(SerError::NotOpen)?;
        if let Err(e) = file.write_all(payload).and_then(|()| file.flush()) {
            error!(path = %self.path.display(), frame = %self.timestamps.len(), error = %e, "Frame write failed");
            self.discard_partial_frame();
            return Err(e.into());
        }

        self.data_end += payload.len() as u64;
        self.timestamps.push(now_ticks());
        Ok(())
    }

    /// Drops whatever part of a failed frame is buffered or on disk, so the
    /// next frame or the trailer starts right after the last good frame
    fn discard_partial_frame(&mut self) {
        let Some(writer) = self.file.take() else {
            return;
        };

        let (mut file, _unwritten) = writer.into_parts();
        let rewound = file
            .set_len(self.data_end)
            .and_then(|()| file.seek(SeekFrom::Start(self.data_end)));
        match rewound {
            Ok(_) => warn!(offset = %self.data_end, "Partial frame discarded"),
            Err(e) => error!(offset = %self.data_end, error = %e, "Could not cut partial frame"),
        }

        self.file = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
    }

    /// Patches the frame count, appends the trailer, syncs and closes.
    ///
    /// With no frames written the file is left with just its header. Calling
    /// this again is a no-op. Returns the final file size.
    pub fn close(&mut self) -> Result<u64, SerError> {
        let Some(mut file) = self.file.take() else {
            return Ok(0);
        };

        if let Some(header) = self.header.as_mut() {
            if !self.timestamps.is_empty() {
                header.frame_count = self.timestamps.len() as u32;

                file.seek(SeekFrom::Start(0))?;
                file.write_all(&header.encode(self.order.disk()))?;
                // Trailer goes right after the last good frame, never after stray bytes
                file.seek(SeekFrom::Start(self.data_end))?;

                let mut trailer = BytesMut::with_capacity(self.timestamps.len() * TIMESTAMP_SIZE);
                for &tick in &self.timestamps {
                    put_u64(&mut trailer, tick, self.order.disk());
                }
                file.write_all(&trailer)?;
                debug!(entries = %self.timestamps.len(), "Trailer written");
            } else {
                warn!(path = %self.path.display(), "Closing container without frames");
            }
        }

        let file = file.into_inner().map_err(|e| e.into_error())?;
        if self.header.is_some() {
            let end = self.data_end + (self.timestamps.len() * TIMESTAMP_SIZE) as u64;
            file.set_len(end)?;
        }
        file.sync_all()?;
        let size = file.metadata()?.len();

        info!(
            path = %self.path.display(),
            frames = %self.timestamps.len(),
            bytes = %size,
            "Closed container"
        );

        Ok(size)
    }
}

impl Drop for SerWriter {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                error!(path = %self.path.display(), error = %e, "Failed to close container");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::ByteOrder;

    fn dims() -> FrameDims {
        FrameDims::new(4, 2)
    }

    #[test]
    fn test_open_failure_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SerWriter::new(dir.path().join("missing").join("out.ser"));

        assert!(!writer.is_open());
        assert!(writer.open_error().is_some());
        let result = writer.prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono);
        assert!(matches!(result, Err(SerError::NotOpen)));
    }

    #[test]
    fn test_write_requires_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SerWriter::new(dir.path().join("a.ser"));
        assert!(matches!(writer.write_frame(&[0u8; 8]), Err(SerError::HeaderNotPrepared)));
    }

    #[test]
    fn test_frame_size_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SerWriter::new(dir.path().join("a.ser"));
        writer
            .prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono)
            .unwrap();

        let result = writer.write_frame(&[0u8; 7]);
        assert!(matches!(
            result,
            Err(SerError::FrameSizeMismatch { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_header_not_rewritten_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ser");
        let mut writer = SerWriter::with_order(&path, WireOrder::for_host(ByteOrder::Little));
        writer
            .prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono)
            .unwrap();
        writer.write_frame(&[1u8; 8]).unwrap();
        writer.write_frame(&[2u8; 8]).unwrap();
        assert_eq!(writer.frame_count(), 2);

        let size = writer.close().unwrap();
        assert_eq!(size, (HEADER_SIZE + 2 * 8 + 2 * TIMESTAMP_SIZE) as u64);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[38..42], &2u32.to_le_bytes());
    }

    #[test]
    fn test_close_without_frames_keeps_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.ser");
        let mut writer = SerWriter::new(&path);
        writer
            .prepare_header(dims(), &Metadata::default(), 2, ColorId::Mono)
            .unwrap();

        assert_eq!(writer.close().unwrap(), HEADER_SIZE as u64);
        assert_eq!(writer.close().unwrap(), 0);
        assert!(!writer.is_open());
    }

    #[test]
    fn test_rejects_unsupported_depth() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SerWriter::new(dir.path().join("a.ser"));
        let result = writer.prepare_header(dims(), &Metadata::default(), 3, ColorId::Mono);
        assert!(matches!(result, Err(SerError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_failed_frame_is_cut_before_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ser");
        let mut writer = SerWriter::with_order(&path, WireOrder::for_host(ByteOrder::Little));
        writer
            .prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono)
            .unwrap();
        writer.write_frame(&[1u8; 8]).unwrap();

        // What a short write leaves behind: part of a frame, flushed or not
        let file = writer.file.as_mut().unwrap();
        file.write_all(&[0xEE; 3]).unwrap();
        file.flush().unwrap();
        file.write_all(&[0xEE; 2]).unwrap();
        writer.discard_partial_frame();

        writer.write_frame(&[2u8; 8]).unwrap();
        let size = writer.close().unwrap();
        assert_eq!(size, (HEADER_SIZE + 2 * 8 + 2 * TIMESTAMP_SIZE) as u64);

        let mut reader = crate::ser::SerReader::open_with_order(&path, WireOrder::for_host(ByteOrder::Little)).unwrap();
        assert!(reader.completeness().is_complete());
        assert_eq!(&reader.get_frame(1).unwrap()[..], &[2u8; 8]);
        assert_eq!(reader.timestamps().unwrap().len(), 2);
    }

    #[test]
    fn test_stray_bytes_never_shift_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stray.ser");
        let mut writer = SerWriter::with_order(&path, WireOrder::for_host(ByteOrder::Little));
        writer
            .prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono)
            .unwrap();
        writer.write_frame(&[7u8; 8]).unwrap();
        writer.file.as_mut().unwrap().write_all(&[0xEE; 5]).unwrap();

        let size = writer.close().unwrap();
        assert_eq!(size, (HEADER_SIZE + 8 + TIMESTAMP_SIZE) as u64);

        let bytes = std::fs::read(&path).unwrap();
        let tick = u64::from_le_bytes(bytes[HEADER_SIZE + 8..].try_into().unwrap());
        assert!(tick > 0);
    }

    #[test]
    fn test_header_and_frames_reach_disk_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.ser");
        let mut writer = SerWriter::new(&path);
        writer
            .prepare_header(dims(), &Metadata::default(), 1, ColorId::Mono)
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);

        writer.write_frame(&[3u8; 8]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_SIZE + 8) as u64);
    }
}
