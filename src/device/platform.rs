//! Platform detection for raw camera sources

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInfo {
    /// macOS (Darwin)
    MacOS,

    /// Raspberry Pi (detected via the device tree)
    RaspberryPi,

    /// Generic Linux
    Linux,
}

pub fn detect_platform() -> PlatformInfo {
    match env::consts::OS {
        "macos" => PlatformInfo::MacOS,
        "linux" if is_raspberry_pi() => PlatformInfo::RaspberryPi,
        _ => PlatformInfo::Linux,
    }
}

fn is_raspberry_pi() -> bool {
    std::path::Path::new("/proc/device-tree/model").exists()
        || std::path::Path::new("/sys/firmware/devicetree/base/model").exists()
}

/// GStreamer source element reading raw frames from `device`
pub fn source_element(platform: PlatformInfo, device: &str) -> String {
    match platform {
        PlatformInfo::MacOS => format!("avfvideosrc device-index={}", device),
        PlatformInfo::RaspberryPi => format!("libcamerasrc camera-name=\"{}\"", device),
        PlatformInfo::Linux => format!("v4l2src device={}", device),
    }
}
