//! GStreamer `appsink` frame source

use super::platform::{self, PlatformInfo};
use super::{DeviceError, ExposureStatus, FrameFormat, FrameSource};
use crate::ser::ColorId;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pulls raw frames from a camera pipeline.
///
/// Stills are taken from the live pipeline: the exposure "completes" when the
/// next sample arrives.
pub struct GstSource {
    format: FrameFormat,
    exposure: Duration,
    pipeline: gst::Pipeline,
    app_sink: gst_app::AppSink,
    playing: bool,

    last_offset: Option<u64>,
    dropped: u64,
    pending_still: Option<gst::Sample>,
    exposing: bool,
}

impl GstSource {
    pub fn new(device: &str, format: FrameFormat, fps: u32, exposure: Duration) -> Result<Self, DeviceError> {
        gst::init()?;

        let platform = platform::detect_platform();
        let desc = build_pipeline_string(platform, device, &format, fps)?;
        debug!(pipeline = %desc, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&desc)?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| DeviceError::Pipeline("Not a pipeline".to_string()))?;

        let app_sink = pipeline
            .by_name("sink")
            .ok_or_else(|| DeviceError::Pipeline("No appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| DeviceError::Pipeline("Not an appsink".to_string()))?;

        info!(platform = ?platform, device = %device, "GStreamer source ready");

        Ok(Self {
            format,
            exposure,
            pipeline,
            app_sink,
            playing: false,
            last_offset: None,
            dropped: 0,
            pending_still: None,
            exposing: false,
        })
    }

    fn set_playing(&mut self, playing: bool) -> Result<(), DeviceError> {
        if self.playing == playing {
            return Ok(());
        }
        let state = if playing { gst::State::Playing } else { gst::State::Null };
        self.pipeline
            .set_state(state)
            .map_err(|e| DeviceError::StateChange(format!("{:?}", e)))?;
        self.playing = playing;
        Ok(())
    }

    fn pull(&mut self, timeout: Duration) -> Result<gst::Sample, DeviceError> {
        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        match self.app_sink.try_pull_sample(timeout) {
            Some(sample) => Ok(sample),
            None if self.app_sink.is_eos() => Err(DeviceError::EndOfStream),
            None => Err(DeviceError::Timeout),
        }
    }

    fn copy_sample(&mut self, sample: &gst::Sample, dst: &mut [u8]) -> Result<(), DeviceError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| DeviceError::Pipeline("sample without buffer".to_string()))?;

        // v4l2src numbers its buffers; gaps are frames the driver dropped
        let offset = buffer.offset();
        if offset != gst::BUFFER_OFFSET_NONE {
            if let Some(last) = self.last_offset {
                self.dropped += offset.saturating_sub(last + 1);
            }
            self.last_offset = Some(offset);
        }

        let map = buffer.map_readable()?;
        if map.len() != dst.len() {
            return Err(DeviceError::BufferSize {
                expected: dst.len(),
                actual: map.len(),
            });
        }
        dst.copy_from_slice(map.as_slice());
        Ok(())
    }
}

fn build_pipeline_string(
    platform: PlatformInfo,
    device: &str,
    format: &FrameFormat,
    fps: u32,
) -> Result<String, DeviceError> {
    let source = platform::source_element(platform, device);
    let sink = "appsink name=sink max-buffers=4 drop=true sync=false emit-signals=false";

    let bayer = match format.color {
        ColorId::Rggb => Some("rggb"),
        ColorId::Grbg => Some("grbg"),
        ColorId::Gbrg => Some("gbrg"),
        ColorId::Bggr => Some("bggr"),
        _ => None,
    };

    if let Some(order) = bayer {
        if format.bytes_per_channel != 1 {
            return Err(DeviceError::Unsupported("16-bit Bayer".to_string()));
        }
        return Ok(format!(
            "{} ! video/x-bayer,format={},width={},height={},framerate={}/1 ! {}",
            source, order, format.width, format.height, fps, sink
        ));
    }

    let raw = match (format.channels, format.bytes_per_channel, format.color) {
        (1, 1, _) => "GRAY8",
        (1, 2, _) => "GRAY16_LE",
        (3, 1, ColorId::Bgr) => "BGR",
        (3, 1, _) => "RGB",
        (channels, bpc, color) => {
            return Err(DeviceError::Unsupported(format!(
                "{} channel(s) x {} byte(s) {}",
                channels, bpc, color
            )))
        }
    };

    Ok(format!(
        "{} ! queue max-size-buffers=2 leaky=downstream ! videoconvert ! video/x-raw,format={},width={},height={},framerate={}/1 ! {}",
        source, raw, format.width, format.height, fps, sink
    ))
}

impl FrameSource for GstSource {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn exposure(&self) -> Duration {
        self.exposure
    }

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.last_offset = None;
        self.dropped = 0;
        self.set_playing(true)?;
        info!("GStreamer capture started");
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.set_playing(false)?;
        info!(dropped = %self.dropped, "GStreamer capture stopped");
        Ok(())
    }

    fn fetch_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<(), DeviceError> {
        if !self.playing {
            return Err(DeviceError::NotStreaming);
        }
        let sample = self.pull(timeout)?;
        self.copy_sample(&sample, dst)
    }

    fn dropped_frames(&mut self) -> Result<u64, DeviceError> {
        Ok(self.dropped)
    }

    fn start_exposure(&mut self) -> Result<(), DeviceError> {
        self.pending_still = None;
        self.set_playing(true)?;
        self.exposing = true;
        Ok(())
    }

    fn exposure_status(&mut self) -> Result<ExposureStatus, DeviceError> {
        if !self.exposing {
            return Ok(ExposureStatus::Idle);
        }
        if self.pending_still.is_some() {
            return Ok(ExposureStatus::Success);
        }

        match self.pull(Duration::ZERO) {
            Ok(sample) => {
                self.pending_still = Some(sample);
                Ok(ExposureStatus::Success)
            }
            Err(DeviceError::Timeout) => Ok(ExposureStatus::Working),
            Err(e) => {
                warn!(error = %e, "Exposure failed");
                Ok(ExposureStatus::Failed)
            }
        }
    }

    fn download_exposure(&mut self, dst: &mut [u8]) -> Result<(), DeviceError> {
        let sample = self.pending_still.take().ok_or(DeviceError::NotReady)?;
        self.copy_sample(&sample, dst)?;
        self.exposing = false;
        self.set_playing(false)
    }

    fn stop_exposure(&mut self) -> Result<(), DeviceError> {
        self.pending_still = None;
        self.exposing = false;
        self.set_playing(false)
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(channels: u32, bpc: u8, color: ColorId) -> FrameFormat {
        FrameFormat {
            width: 640,
            height: 480,
            channels,
            bytes_per_channel: bpc,
            color,
        }
    }

    #[test]
    fn test_mono_pipeline() {
        let desc = build_pipeline_string(PlatformInfo::Linux, "/dev/video0", &format(1, 2, ColorId::Mono), 30).unwrap();
        assert!(desc.starts_with("v4l2src device=/dev/video0"));
        assert!(desc.contains("format=GRAY16_LE"));
        assert!(desc.ends_with("appsink name=sink max-buffers=4 drop=true sync=false emit-signals=false"));
    }

    #[test]
    fn test_bayer_pipeline() {
        let desc = build_pipeline_string(PlatformInfo::Linux, "/dev/video0", &format(1, 1, ColorId::Rggb), 15).unwrap();
        assert!(desc.contains("video/x-bayer,format=rggb"));
        assert!(!desc.contains("videoconvert"));
    }

    #[test]
    fn test_unsupported_layout() {
        let result = build_pipeline_string(PlatformInfo::Linux, "/dev/video0", &format(3, 2, ColorId::Rgb), 30);
        assert!(matches!(result, Err(DeviceError::Unsupported(_))));
    }
}
