use framegrab_hw::camera::V4L2_FORMAT_PREFERENCES;
use framegrab_hw::negotiate::DEFAULT_FORMAT_PREFERENCES;
use framegrab_hw::synthetic::STUB_SCHEME;
use framegrab_hw::{CameraSpec, CaptureRequest, CaptureSystem, SyntheticSystem, V4l2System};
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera to use: a V4L2 device path, a `stub://[PixelFormat]` string,
    /// or unset for the first V4L2 capture device.
    pub device: Option<String>,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    /// Pixel formats to try, most preferred first. Unset picks the
    /// backend's own list.
    pub pixel_formats: Option<Vec<String>>,
    /// Save every Nth streamed frame; 0 disables saving.
    pub save_every: u64,
    pub output_dir: PathBuf,
    /// Where `single` writes its frame.
    pub single_output: PathBuf,
    /// How long one fetch waits for a frame.
    pub timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub window_title: String,
}

impl Config {
    /// Load configuration from `FRAMEGRAB_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            device: std::env::var("FRAMEGRAB_DEVICE")
                .ok()
                .filter(|v| !v.is_empty()),
            width: env_i64("FRAMEGRAB_WIDTH", 1280),
            height: env_i64("FRAMEGRAB_HEIGHT", 720),
            fps: env_f64("FRAMEGRAB_FPS", 30.0),
            pixel_formats: std::env::var("FRAMEGRAB_PIXEL_FORMATS")
                .ok()
                .map(|v| parse_list(&v))
                .filter(|list| !list.is_empty()),
            save_every: env_u64("FRAMEGRAB_SAVE_EVERY", 10),
            output_dir: std::env::var("FRAMEGRAB_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("captures")),
            single_output: std::env::var("FRAMEGRAB_SINGLE_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("single_frame.png")),
            timeout_ms: env_u64("FRAMEGRAB_TIMEOUT_MS", 1000),
            max_consecutive_timeouts: env_u32("FRAMEGRAB_MAX_TIMEOUTS", 3),
            window_title: std::env::var("FRAMEGRAB_WINDOW_TITLE")
                .unwrap_or_else(|_| "FLIR Realtime".to_string()),
        }
    }

    pub fn request(&self) -> CaptureRequest {
        CaptureRequest {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn format_preferences(&self) -> Vec<&str> {
        match &self.pixel_formats {
            Some(list) => list.iter().map(String::as_str).collect(),
            None if self.is_synthetic() => DEFAULT_FORMAT_PREFERENCES.to_vec(),
            None => V4L2_FORMAT_PREFERENCES.to_vec(),
        }
    }

    fn is_synthetic(&self) -> bool {
        self.device
            .as_deref()
            .is_some_and(|d| d.starts_with(STUB_SCHEME))
    }

    /// Backend selected by `device`.
    pub fn system(&self) -> Box<dyn CaptureSystem> {
        match self.device.as_deref() {
            Some(device) if self.is_synthetic() => {
                let spec = CameraSpec::from_device_string(device).unwrap_or_default();
                Box::new(SyntheticSystem::new(vec![spec]))
            }
            Some(path) => Box::new(V4l2System::with_device(path)),
            None => Box::new(V4l2System::new()),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
