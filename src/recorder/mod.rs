//! Recording loop: drains the ring into SER containers
//!
//! Runs on its own thread for the lifetime of the acquisition, independent of
//! the capture state. While a stream is active every committed frame is
//! dequeued exactly once; it is written if recording is enabled and discarded
//! otherwise. A container opens as soon as recording is enabled on an active
//! stream, even before its first frame, and closes after the stream ends and
//! the ring is drained. Ring drops are counted from the moment it opens.

use crate::config::RecordingConfig;
use crate::ser::{Metadata, SerWriter};
use crate::session::{SessionState, Stream};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Sleep when the ring is empty
const DEQUEUE_IDLE: Duration = Duration::from_millis(2);

/// Sleep when no stream is running
const IDLE_POLL: Duration = Duration::from_millis(20);

/// `<output_dir>/<prefix><timestamp>.ser`
pub fn container_path(output_dir: &std::path::Path, prefix: &str) -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let path = output_dir.join(format!("{}{}.ser", prefix, stamp));
    if !path.exists() {
        return path;
    }

    // Two recordings within the same second
    (1u32..)
        .map(|n| output_dir.join(format!("{}{}_{}.ser", prefix, stamp, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

/// Per-container bookkeeping
struct Container {
    writer: SerWriter,
    failed: bool,
    ring_dropped_at_open: u64,
    lost_writes: u64,
}

impl Container {
    fn open(stream: &Stream, config: &RecordingConfig, metadata: &Metadata) -> Self {
        let path = container_path(&config.output_dir, &config.prefix);
        info!(path = %path.display(), "Starting recording");

        let mut writer = SerWriter::new(&path);
        let mut failed = !writer.is_open();

        if !failed {
            let format = &stream.format;
            if let Err(e) =
                writer.prepare_header(format.dims(), metadata, format.bytes_per_channel, format.color)
            {
                error!(path = %path.display(), error = %e, "Failed to write container header");
                failed = true;
            }
        }

        Self {
            writer,
            failed,
            ring_dropped_at_open: stream.ring.dropped(),
            lost_writes: 0,
        }
    }

    fn write(&mut self, frame: &[u8], session: &SessionState) {
        if self.failed {
            self.lost_writes += 1;
            return;
        }

        match self.writer.write_frame(frame) {
            Ok(()) => session.add_captured(),
            Err(e) => {
                error!(
                    path = %self.writer.path().display(),
                    frames = %self.writer.frame_count(),
                    error = %e,
                    "Write failed, recording stopped for this container"
                );
                self.failed = true;
                self.lost_writes += 1;
            }
        }
    }

    fn dropped(&self, stream: &Stream) -> u64 {
        stream.ring.dropped().saturating_sub(self.ring_dropped_at_open) + self.lost_writes
    }

    fn close(mut self, stream: &Stream, session: &SessionState) {
        session.set_dropped(self.dropped(stream));
        match self.writer.close() {
            Ok(bytes) => info!(
                path = %self.writer.path().display(),
                frames = %self.writer.frame_count(),
                dropped = %self.dropped(stream),
                bytes = %bytes,
                "Stopped recording"
            ),
            Err(e) => error!(path = %self.writer.path().display(), error = %e, "Failed to close container"),
        }
    }
}

pub struct RecordingLoop {
    session: Arc<SessionState>,
    config: RecordingConfig,
    metadata: Metadata,
}

impl RecordingLoop {
    pub fn new(session: Arc<SessionState>, config: RecordingConfig) -> Self {
        let metadata = config.metadata();
        Self {
            session,
            config,
            metadata,
        }
    }

    /// Runs until [`SessionState::request_shutdown`]
    pub fn run(&self) {
        info!(output_dir = %self.config.output_dir.display(), "Recording thread started");

        while !self.session.shutdown_requested() {
            let stream = self
                .session
                .stream()
                .filter(|stream| self.session.is_active() || !stream.ring.is_empty());

            match stream {
                Some(stream) => {
                    self.session.set_recorder_busy(true);
                    self.drain(&stream);
                    self.session.set_recorder_busy(false);
                }
                None => thread::sleep(IDLE_POLL),
            }
        }

        info!("Recording thread stopped");
    }

    /// Consumes `stream` until it is inactive and empty
    fn drain(&self, stream: &Stream) {
        debug!(stream = %stream.id, "Draining stream");
        let mut container: Option<Container> = None;

        loop {
            // A newer stream may already be running; this one is then over
            let active = self.session.is_active()
                && self.session.stream().is_some_and(|current| current.id == stream.id);

            let record = self.session.do_record();
            if record && container.is_none() {
                self.session.reset_recording_counters();
                container = Some(Container::open(stream, &self.config, &self.metadata));
                self.session.set_recording(true);
            }

            match stream.ring.dequeue() {
                Some(frame) => {
                    if let Some(container) = container.as_mut().filter(|_| record) {
                        container.write(&frame, &self.session);
                    }
                    frame.retire();
                }
                None if !active => break,
                None => thread::sleep(DEQUEUE_IDLE),
            }

            if let Some(container) = &container {
                self.session.set_dropped(container.dropped(stream));
            }
        }

        if let Some(container) = container {
            container.close(stream, &self.session);
            self.session.set_recording(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Trigger;
    use crate::device::FrameFormat;
    use crate::ring::{OverflowPolicy, RingBuffer};
    use crate::ser::{ColorId, SerReader};

    fn format() -> FrameFormat {
        FrameFormat {
            width: 4,
            height: 2,
            channels: 1,
            bytes_per_channel: 1,
            color: ColorId::Mono,
        }
    }

    /// Mono frame of `bytes` bytes, 64 pixels wide
    fn format_with_bytes(bytes: u32) -> FrameFormat {
        FrameFormat {
            width: 64,
            height: bytes / 64,
            ..format()
        }
    }

    fn config(dir: &std::path::Path) -> RecordingConfig {
        RecordingConfig {
            output_dir: dir.to_path_buf(),
            prefix: "test_".to_string(),
            ..Default::default()
        }
    }

    fn publish(stream: &Stream, value: u8) {
        let mut slot = stream.ring.acquire_write_slot().unwrap();
        slot.fill(value);
        slot.finalize();
    }

    #[test]
    fn test_container_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = container_path(dir.path(), "m42_");
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("m42_"));
        assert!(name.ends_with(".ser"));
        // m42_ + YYYY-mm-dd_HH-MM-SS + .ser
        assert_eq!(name.len(), 4 + 19 + 4);

        std::fs::write(&first, b"").unwrap();
        let second = container_path(dir.path(), "m42_");
        assert_ne!(first, second);
    }

    #[test]
    fn test_drain_records_all_committed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(8, 8, OverflowPolicy::Reject).unwrap();
        let stream = session.begin_stream(ring, format());

        for value in 1..=3 {
            publish(&stream, value);
        }
        session.set_do_record(true);

        // Stream already over: everything committed is still written
        let recorder = RecordingLoop::new(Arc::clone(&session), config(dir.path()));
        recorder.drain(&stream);

        assert_eq!(session.captured_count(), 3);
        assert_eq!(session.dropped_count(), 0);
        assert!(!session.is_recording());
        assert!(stream.ring.is_empty());

        let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let mut reader = SerReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 3);
        assert_eq!(&reader.get_frame(2).unwrap()[..], &[3u8; 8]);
    }

    #[test]
    fn test_frames_discarded_while_not_recording() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(8, 8, OverflowPolicy::Reject).unwrap();
        let stream = session.begin_stream(ring, format());

        publish(&stream, 1);
        publish(&stream, 2);

        let recorder = RecordingLoop::new(Arc::clone(&session), config(dir.path()));
        recorder.drain(&stream);

        assert!(stream.ring.is_empty());
        assert_eq!(session.captured_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_failure_counts_frames_as_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(8, 8, OverflowPolicy::Reject).unwrap();
        let stream = session.begin_stream(ring, format());

        publish(&stream, 1);
        publish(&stream, 2);
        session.set_do_record(true);

        let config = config(&dir.path().join("does-not-exist"));
        let recorder = RecordingLoop::new(Arc::clone(&session), config);
        recorder.drain(&stream);

        assert_eq!(session.captured_count(), 0);
        assert_eq!(session.dropped_count(), 2);
        assert!(stream.ring.is_empty());
    }

    #[test]
    fn test_run_follows_stream_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(16, 8, OverflowPolicy::Overwrite).unwrap();
        let stream = session.begin_stream(ring, format());
        session.set_do_record(true);
        session.transition(Trigger::StartStreaming).unwrap();

        let handle = {
            let recorder = RecordingLoop::new(Arc::clone(&session), config(dir.path()));
            thread::spawn(move || recorder.run())
        };

        for value in 0..10 {
            publish(&stream, value);
            thread::sleep(Duration::from_millis(5));
        }
        session.transition(Trigger::Finished).unwrap();

        // Recorder finishes the stream before shutdown is honoured
        while session.recorder_busy() || !stream.ring.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        session.request_shutdown();
        handle.join().unwrap();

        assert_eq!(session.captured_count(), 10);
        assert!(!session.is_recording());
    }

    #[test]
    fn test_container_opens_when_recording_starts() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(8, 8, OverflowPolicy::Overwrite).unwrap();
        let stream = session.begin_stream(ring, format());
        session.transition(Trigger::StartStreaming).unwrap();
        session.set_do_record(true);

        let handle = {
            let recorder = RecordingLoop::new(Arc::clone(&session), config(dir.path()));
            let stream = Arc::clone(&stream);
            thread::spawn(move || recorder.drain(&stream))
        };

        // No frame has arrived yet, the file exists anyway
        while !session.is_recording() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        session.transition(Trigger::Finished).unwrap();
        handle.join().unwrap();
        assert!(!session.is_recording());
        assert_eq!(session.captured_count(), 0);
    }

    #[test]
    fn test_overflow_drops_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new());
        let ring = RingBuffer::new(4, 4096, OverflowPolicy::Overwrite).unwrap();
        let stream = session.begin_stream(ring, format_with_bytes(4096));
        session.transition(Trigger::StartStreaming).unwrap();
        session.set_do_record(true);

        let handle = {
            let recorder = RecordingLoop::new(Arc::clone(&session), config(dir.path()));
            let stream = Arc::clone(&stream);
            thread::spawn(move || recorder.drain(&stream))
        };
        while !session.is_recording() {
            thread::sleep(Duration::from_millis(1));
        }

        // Far faster than the recorder can write to disk
        let attempts = 500u64;
        for n in 0..attempts {
            let mut slot = stream.ring.acquire_write_slot().unwrap();
            slot.fill(n as u8);
            slot.finalize();
        }
        session.transition(Trigger::Finished).unwrap();
        handle.join().unwrap();

        // Every frame committed while recording is on disk or counted as lost
        let captured = session.captured_count();
        let dropped = session.dropped_count();
        assert_eq!(captured + dropped, attempts);
        assert_eq!(dropped, stream.ring.dropped());

        let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let reader = SerReader::open(&path).unwrap();
        assert_eq!(u64::from(reader.frame_count()), captured);
    }
}
