//! Capture system and device traits shared by all backends.

use crate::frame::RawFrame;
use crate::node::{NodeError, NodeMap};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device busy")]
    Busy,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("device I/O failed: {0}")]
    Io(String),
    #[error("acquisition not started")]
    NotStreaming,
    #[error("frame {0} is not outstanding")]
    UnknownFrame(u64),
}

/// Identification of a discovered device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    /// Serial number, or the device path for V4L2 nodes.
    pub serial: String,
    /// Filesystem path of the device node, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Path with symlinks resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_path: Option<String>,
}

/// Value of the `AcquisitionMode` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    SingleFrame,
    Continuous,
}

impl AcquisitionMode {
    pub fn entry(self) -> &'static str {
        match self {
            AcquisitionMode::SingleFrame => "SingleFrame",
            AcquisitionMode::Continuous => "Continuous",
        }
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry())
    }
}

/// A camera handle.
///
/// `init` gives exclusive ownership, `deinit` gives it back. Frames
/// returned by `next_frame` stay outstanding until `release_frame` is
/// called with their sequence number.
pub trait CaptureDevice: NodeMap {
    fn info(&self) -> DeviceInfo;

    fn init(&mut self) -> Result<(), DeviceError>;

    fn deinit(&mut self) -> Result<(), DeviceError>;

    fn begin_acquisition(&mut self) -> Result<(), DeviceError>;

    fn end_acquisition(&mut self) -> Result<(), DeviceError>;

    /// Block up to `timeout` for the next frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError>;

    fn release_frame(&mut self, sequence: u64) -> Result<(), DeviceError>;
}

/// Process-wide entry point of a backend.
pub trait CaptureSystem {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Enumerate attached cameras, in a stable order.
    fn cameras(&mut self) -> Result<Vec<Box<dyn CaptureDevice>>, DeviceError>;

    /// Called after a camera list obtained from `cameras` was cleared.
    fn on_list_cleared(&mut self) {}

    /// Release the process-wide instance. Called once, last.
    fn release_instance(&mut self) -> Result<(), DeviceError>;
}
