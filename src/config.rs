//! Configuration management for acquisition and recording

use crate::ring::OverflowPolicy;
use crate::ser::{ColorId, Metadata};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub preview: PreviewConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Built-in test pattern
    #[default]
    Synthetic,

    /// GStreamer camera pipeline (needs the `gstreamer` feature)
    Gstreamer,
}

/// Camera and frame format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub kind: DeviceKind,

    /// Camera device path
    /// - macOS: "0" for first webcam, "1" for second, etc.
    /// - Linux: "/dev/video0"
    /// - Raspberry Pi: libcamera camera name
    #[serde(default = "default_device_path")]
    pub path: String,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// 1 for mono/Bayer, 3 for RGB/BGR
    #[serde(default = "default_channels")]
    pub channels: u32,

    /// 1 (8-bit) or 2 (16-bit samples)
    #[serde(default = "default_bytes_per_channel")]
    pub bytes_per_channel: u8,

    #[serde(default)]
    pub color: ColorId,

    /// Frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Exposure time in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::default(),
            path: default_device_path(),
            width: default_width(),
            height: default_height(),
            channels: default_channels(),
            bytes_per_channel: default_bytes_per_channel(),
            color: ColorId::default(),
            fps: default_fps(),
            exposure_ms: default_exposure_ms(),
        }
    }
}

/// Ring buffer and capture loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Memory reserved for frame slots (MiB)
    #[serde(default = "default_buffer_mib")]
    pub buffer_mib: usize,

    /// What happens when the recorder falls behind
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Consecutive fetch timeouts tolerated before logging errors
    #[serde(default = "default_timeout_retry_limit")]
    pub timeout_retry_limit: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_mib: default_buffer_mib(),
            overflow: OverflowPolicy::default(),
            timeout_retry_limit: default_timeout_retry_limit(),
        }
    }
}

/// Output location and header metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Prepended to the timestamped file name
    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub observer: String,

    #[serde(default)]
    pub instrument: String,

    #[serde(default)]
    pub telescope: String,

    /// Write headers in host byte order
    #[serde(default)]
    pub never_swap: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            prefix: String::new(),
            observer: String::new(),
            instrument: String::new(),
            telescope: String::new(),
            never_swap: false,
        }
    }
}

impl RecordingConfig {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            observer: self.observer.clone(),
            instrument: self.instrument.clone(),
            telescope: self.telescope.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Preview refresh rate (0 = every frame)
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
        }
    }
}

// Default value functions
fn default_device_path() -> String {
    "/dev/video0".to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_channels() -> u32 {
    1
}
fn default_bytes_per_channel() -> u8 {
    1
}
fn default_fps() -> u32 {
    30
}
fn default_exposure_ms() -> u64 {
    10
}
fn default_buffer_mib() -> usize {
    512
}
fn default_timeout_retry_limit() -> u32 {
    10
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_target_fps() -> u32 {
    15
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Bytes reserved for the ring buffer
    pub fn buffer_bytes(&self) -> usize {
        self.capture.buffer_mib.saturating_mul(1024 * 1024)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dev = &self.device;

        if dev.width == 0 || dev.height == 0 {
            return Err(ConfigError::Invalid("width and height must be > 0".to_string()));
        }

        if !matches!(dev.channels, 1 | 3) {
            return Err(ConfigError::Invalid(format!(
                "channels must be 1 or 3, got {}",
                dev.channels
            )));
        }

        if dev.color.planes() != dev.channels {
            return Err(ConfigError::Invalid(format!(
                "color {} needs {} channel(s), got {}",
                dev.color,
                dev.color.planes(),
                dev.channels
            )));
        }

        if !matches!(dev.bytes_per_channel, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "bytes_per_channel must be 1 or 2, got {}",
                dev.bytes_per_channel
            )));
        }

        if dev.fps == 0 || dev.fps > 1000 {
            return Err(ConfigError::Invalid(format!(
                "FPS must be between 1 and 1000, got {}",
                dev.fps
            )));
        }

        let slot_bytes = dev.width as usize * dev.height as usize * dev.channels as usize * usize::from(dev.bytes_per_channel);
        if self.buffer_bytes() / slot_bytes < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_mib = {} holds fewer than 2 frames of {} bytes",
                self.capture.buffer_mib, slot_bytes
            )));
        }

        if self.preview.target_fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "preview target_fps must be at most 120, got {}",
                self.preview.target_fps
            )));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.kind, DeviceKind::Synthetic);
        assert_eq!(config.capture.buffer_mib, 512);
        assert_eq!(config.capture.overflow, OverflowPolicy::Overwrite);
        assert_eq!(config.preview.target_fps, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[device]
kind = "synthetic"
width = 1920
height = 1080
channels = 3
bytes_per_channel = 2
color = "rgb"
fps = 60
exposure_ms = 5

[capture]
buffer_mib = 256
overflow = "reject"
timeout_retry_limit = 3

[recording]
output_dir = "/tmp/captures"
prefix = "jupiter_"
observer = "me"
telescope = "C11"
never_swap = true

[preview]
target_fps = 30
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.device.width, 1920);
        assert_eq!(config.device.color, ColorId::Rgb);
        assert_eq!(config.device.bytes_per_channel, 2);
        assert_eq!(config.capture.overflow, OverflowPolicy::Reject);
        assert_eq!(config.capture.timeout_retry_limit, 3);
        assert_eq!(config.recording.output_dir, PathBuf::from("/tmp/captures"));
        assert!(config.recording.never_swap);
        assert_eq!(config.recording.metadata().telescope, "C11");
        assert_eq!(config.preview.target_fps, 30);
    }

    #[test]
    fn test_invalid_channels() {
        let toml = r#"
[device]
channels = 2
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_color_must_match_channels() {
        let toml = r#"
[device]
channels = 1
color = "bgr"
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_buffer_too_small() {
        let toml = r#"
[device]
width = 4096
height = 4096
channels = 3
bytes_per_channel = 2
color = "rgb"

[capture]
buffer_mib = 64
        "#;
        let result = Config::from_str(toml);
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("fewer than 2 frames")));
    }

    #[test]
    fn test_invalid_fps() {
        assert!(Config::from_str("[device]\nfps = 0").is_err());
        assert!(Config::from_str("[preview]\ntarget_fps = 500").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.recording.prefix = "saturn_".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.recording.prefix, "saturn_");
        assert_eq!(loaded.device.width, config.device.width);
    }
}
