//! In-memory camera backend.
//!
//! Selected with a `stub://` device string. Behaves like a GenICam camera
//! with configurable bounds and node access, and can inject incomplete
//! frames, timeouts and start failures. Every lifecycle call is recorded in
//! a shared [`Journal`] so callers can check teardown order.

use crate::device::{AcquisitionMode, CaptureDevice, CaptureSystem, DeviceError, DeviceInfo};
use crate::frame::RawFrame;
use crate::node::{Access, Node, NodeError, NodeMap, NodeValue};
use crate::normalize::FormatKind;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Scheme prefix selecting this backend.
pub const STUB_SCHEME: &str = "stub://";

/// A lifecycle call seen by the synthetic backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init,
    Deinit,
    BeginAcquisition,
    EndAcquisition,
    FrameReleased(u64),
    ListCleared,
    SystemReleased,
}

/// Shared, append-only event log.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    fn record(&self, event: Event) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Static description of a synthetic camera.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub sensor_width: i64,
    pub sensor_height: i64,
    pub max_fps: f64,
    /// Frame rate before any write.
    pub fps: f64,
    pub pixel_formats: Vec<String>,
    pub pixel_format: String,
    pub resolution_writable: bool,
    pub offsets_writable: bool,
    /// Whether the device exposes `AcquisitionFrameRateEnable` at all.
    pub frame_rate_enable_node: bool,
    pub frame_rate_writable: bool,
    /// Hide Width/Height/AcquisitionFrameRate from reads.
    pub readback_hidden: bool,
    /// Tag frames with the pixel format name.
    pub report_format_name: bool,
    /// Every Nth frame arrives incomplete.
    pub incomplete_every: Option<u64>,
    /// Frames produced before every fetch times out.
    pub frame_limit: Option<u64>,
    pub fail_begin: bool,
    /// Stopping acquisition fails and leaves no `EndAcquisition` event.
    pub fail_end: bool,
    /// Sleep between frames to honour the configured frame rate.
    pub pace: bool,
}

impl Default for CameraSpec {
    fn default() -> Self {
        Self {
            vendor: "framegrab".to_string(),
            model: "Synthetic GenICam Camera".to_string(),
            serial: "00000001".to_string(),
            sensor_width: 1920,
            sensor_height: 1200,
            max_fps: 60.0,
            fps: 30.0,
            pixel_formats: ["Mono8", "RGB8Packed", "BGR8", "BayerRG8"]
                .map(String::from)
                .to_vec(),
            pixel_format: "BayerRG8".to_string(),
            resolution_writable: true,
            offsets_writable: true,
            frame_rate_enable_node: true,
            frame_rate_writable: true,
            readback_hidden: false,
            report_format_name: true,
            incomplete_every: None,
            frame_limit: None,
            fail_begin: false,
            fail_end: false,
            pace: false,
        }
    }
}

impl CameraSpec {
    /// Spec for a `stub://[PixelFormat]` device string.
    ///
    /// Returns `None` when `device` does not use the stub scheme.
    pub fn from_device_string(device: &str) -> Option<Self> {
        let rest = device.strip_prefix(STUB_SCHEME)?;
        let mut spec = CameraSpec {
            pace: true,
            ..CameraSpec::default()
        };
        if !rest.is_empty() {
            if !spec.pixel_formats.iter().any(|f| f == rest) {
                spec.pixel_formats.push(rest.to_string());
            }
            spec.pixel_format = rest.to_string();
        }
        Some(spec)
    }
}

/// Capture system exposing a fixed set of synthetic cameras.
pub struct SyntheticSystem {
    specs: Vec<CameraSpec>,
    journal: Journal,
}

impl SyntheticSystem {
    pub fn new(specs: Vec<CameraSpec>) -> Self {
        Self {
            specs,
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl CaptureSystem for SyntheticSystem {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn cameras(&mut self) -> Result<Vec<Box<dyn CaptureDevice>>, DeviceError> {
        Ok(self
            .specs
            .iter()
            .map(|spec| {
                Box::new(SyntheticCamera::with_journal(spec.clone(), self.journal.clone()))
                    as Box<dyn CaptureDevice>
            })
            .collect())
    }

    fn on_list_cleared(&mut self) {
        self.journal.record(Event::ListCleared);
    }

    fn release_instance(&mut self) -> Result<(), DeviceError> {
        self.journal.record(Event::SystemReleased);
        Ok(())
    }
}

/// One synthetic camera.
pub struct SyntheticCamera {
    spec: CameraSpec,
    journal: Journal,
    initialized: bool,
    streaming: bool,
    mode: AcquisitionMode,
    width: i64,
    height: i64,
    offset_x: i64,
    offset_y: i64,
    fps_enabled: bool,
    fps: f64,
    pixel_format: String,
    produced: u64,
    produced_this_run: u64,
    outstanding: BTreeSet<u64>,
    last_frame_at: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(spec: CameraSpec) -> Self {
        Self::with_journal(spec, Journal::default())
    }

    fn with_journal(spec: CameraSpec, journal: Journal) -> Self {
        Self {
            journal,
            initialized: false,
            streaming: false,
            mode: AcquisitionMode::Continuous,
            width: spec.sensor_width,
            height: spec.sensor_height,
            offset_x: 0,
            offset_y: 0,
            fps_enabled: false,
            fps: spec.fps,
            pixel_format: spec.pixel_format.clone(),
            produced: 0,
            produced_this_run: 0,
            outstanding: BTreeSet::new(),
            last_frame_at: None,
            spec,
        }
    }

    fn render(&self, sequence: u64) -> Result<RawFrame, DeviceError> {
        let channels: u32 = match FormatKind::classify(Some(&self.pixel_format)) {
            FormatKind::Rgb8 | FormatKind::Bgr8 => 3,
            FormatKind::Yuyv => 2,
            _ => 1,
        };
        let (w, h) = (self.width.max(0) as u32, self.height.max(0) as u32);
        let mut data = Vec::with_capacity((w * h * channels) as usize);
        for y in 0..h {
            for x in 0..w {
                for c in 0..channels {
                    let v = (x as u64 + 2 * y as u64 + sequence + 85 * c as u64) % 256;
                    data.push(v as u8);
                }
            }
        }
        let tag = self
            .spec
            .report_format_name
            .then(|| self.pixel_format.clone());
        RawFrame::new(data, w, h, channels, tag, sequence)
            .map_err(|e| DeviceError::Io(e.to_string()))
    }

    fn pace(&mut self) {
        if !self.spec.pace || self.fps <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn check_int(node: Node, value: i64, max: i64) -> Result<(), NodeError> {
        if value < 0 || value > max {
            return Err(NodeError::Rejected {
                node,
                reason: format!("{value} outside [0, {max}]"),
            });
        }
        Ok(())
    }
}

impl NodeMap for SyntheticCamera {
    fn access(&self, node: Node) -> Access {
        let idle = !self.streaming;
        let rw = |writable: bool| Access {
            readable: true,
            writable,
        };
        match node {
            Node::DeviceVendorName | Node::DeviceModelName | Node::DeviceSerialNumber => {
                Access::READ_ONLY
            }
            Node::PixelFormat | Node::AcquisitionMode => rw(idle),
            Node::Width | Node::Height => Access {
                readable: !self.spec.readback_hidden,
                writable: self.spec.resolution_writable && idle,
            },
            Node::OffsetX | Node::OffsetY => rw(self.spec.offsets_writable && idle),
            Node::AcquisitionFrameRateEnable if self.spec.frame_rate_enable_node => rw(true),
            Node::AcquisitionFrameRateEnable => Access::NONE,
            Node::AcquisitionFrameRate => Access {
                readable: !self.spec.readback_hidden,
                writable: self.spec.frame_rate_writable,
            },
        }
    }

    fn read(&self, node: Node) -> Result<NodeValue, NodeError> {
        let access = self.access(node);
        if !access.is_available() {
            return Err(NodeError::NotAvailable(node));
        }
        if !access.readable {
            return Err(NodeError::NotReadable(node));
        }
        Ok(match node {
            Node::DeviceVendorName => NodeValue::Str(self.spec.vendor.clone()),
            Node::DeviceModelName => NodeValue::Str(self.spec.model.clone()),
            Node::DeviceSerialNumber => NodeValue::Str(self.spec.serial.clone()),
            Node::PixelFormat => NodeValue::Enum(self.pixel_format.clone()),
            Node::AcquisitionMode => NodeValue::Enum(self.mode.entry().to_string()),
            Node::Width => NodeValue::Int(self.width),
            Node::Height => NodeValue::Int(self.height),
            Node::OffsetX => NodeValue::Int(self.offset_x),
            Node::OffsetY => NodeValue::Int(self.offset_y),
            Node::AcquisitionFrameRateEnable => NodeValue::Bool(self.fps_enabled),
            Node::AcquisitionFrameRate => NodeValue::Float(self.fps),
        })
    }

    fn max(&self, node: Node) -> Result<NodeValue, NodeError> {
        match node {
            Node::Width => Ok(NodeValue::Int(self.spec.sensor_width - self.offset_x)),
            Node::Height => Ok(NodeValue::Int(self.spec.sensor_height - self.offset_y)),
            Node::OffsetX => Ok(NodeValue::Int(self.spec.sensor_width - self.width)),
            Node::OffsetY => Ok(NodeValue::Int(self.spec.sensor_height - self.height)),
            Node::AcquisitionFrameRate => Ok(NodeValue::Float(self.spec.max_fps)),
            other => Err(NodeError::TypeMismatch {
                node: other,
                expected: "numeric",
                actual: "non-numeric",
            }),
        }
    }

    fn write(&mut self, node: Node, value: NodeValue) -> Result<(), NodeError> {
        if !self.access(node).writable {
            return Err(NodeError::NotWritable(node));
        }
        let max = self.max(node);
        match (node, value) {
            (Node::Width | Node::Height, NodeValue::Int(v)) => {
                if let Ok(NodeValue::Int(max)) = max {
                    Self::check_int(node, v, max)?;
                }
                if v % 2 != 0 {
                    return Err(NodeError::Rejected {
                        node,
                        reason: format!("{v} is not a multiple of 2"),
                    });
                }
                if node == Node::Width {
                    self.width = v;
                } else {
                    self.height = v;
                }
            }
            (Node::OffsetX | Node::OffsetY, NodeValue::Int(v)) => {
                if let Ok(NodeValue::Int(max)) = max {
                    Self::check_int(node, v, max)?;
                }
                if node == Node::OffsetX {
                    self.offset_x = v;
                } else {
                    self.offset_y = v;
                }
            }
            (Node::AcquisitionFrameRateEnable, NodeValue::Bool(b)) => self.fps_enabled = b,
            (Node::AcquisitionFrameRate, NodeValue::Float(f)) => {
                if !(0.0..=self.spec.max_fps).contains(&f) {
                    return Err(NodeError::Rejected {
                        node,
                        reason: format!("{f} outside [0, {}]", self.spec.max_fps),
                    });
                }
                self.fps = f;
            }
            (Node::PixelFormat, NodeValue::Enum(entry)) => {
                if !self.spec.pixel_formats.contains(&entry) {
                    return Err(NodeError::Rejected {
                        node,
                        reason: format!("no entry {entry}"),
                    });
                }
                self.pixel_format = entry;
            }
            (Node::AcquisitionMode, NodeValue::Enum(entry)) => {
                self.mode = match entry.as_str() {
                    "SingleFrame" => AcquisitionMode::SingleFrame,
                    "Continuous" => AcquisitionMode::Continuous,
                    _ => {
                        return Err(NodeError::Rejected {
                            node,
                            reason: format!("no entry {entry}"),
                        })
                    }
                };
            }
            (node, value) => {
                return Err(NodeError::TypeMismatch {
                    node,
                    expected: "matching node type",
                    actual: value.kind(),
                })
            }
        }
        Ok(())
    }

    fn entries(&self, node: Node) -> Result<Vec<String>, NodeError> {
        match node {
            Node::PixelFormat => Ok(self.spec.pixel_formats.clone()),
            Node::AcquisitionMode => Ok(vec!["Continuous".into(), "SingleFrame".into()]),
            other => Err(NodeError::NotAvailable(other)),
        }
    }
}

impl CaptureDevice for SyntheticCamera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            vendor: self.spec.vendor.clone(),
            model: self.spec.model.clone(),
            serial: self.spec.serial.clone(),
            path: None,
            real_path: None,
        }
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        if self.initialized {
            return Err(DeviceError::Busy);
        }
        self.initialized = true;
        self.journal.record(Event::Init);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DeviceError> {
        self.initialized = false;
        self.journal.record(Event::Deinit);
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<(), DeviceError> {
        if self.spec.fail_begin {
            return Err(DeviceError::Io("acquisition start refused".to_string()));
        }
        self.streaming = true;
        self.produced_this_run = 0;
        self.journal.record(Event::BeginAcquisition);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), DeviceError> {
        if !self.streaming {
            return Err(DeviceError::NotStreaming);
        }
        self.streaming = false;
        if self.spec.fail_end {
            return Err(DeviceError::Io("acquisition stop refused".to_string()));
        }
        self.journal.record(Event::EndAcquisition);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError> {
        if !self.streaming {
            return Err(DeviceError::NotStreaming);
        }
        let exhausted = self.spec.frame_limit.is_some_and(|n| self.produced >= n)
            || (self.mode == AcquisitionMode::SingleFrame && self.produced_this_run >= 1);
        if exhausted {
            return Err(DeviceError::Timeout(timeout));
        }

        self.pace();
        self.produced += 1;
        self.produced_this_run += 1;
        let sequence = self.produced;
        self.outstanding.insert(sequence);

        if self
            .spec
            .incomplete_every
            .is_some_and(|n| n > 0 && sequence % n == 0)
        {
            return Ok(RawFrame::incomplete(sequence, "IMAGE_MISSING_PACKETS"));
        }
        self.render(sequence)
    }

    fn release_frame(&mut self, sequence: u64) -> Result<(), DeviceError> {
        if !self.outstanding.remove(&sequence) {
            return Err(DeviceError::UnknownFrame(sequence));
        }
        self.journal.record(Event::FrameReleased(sequence));
        Ok(())
    }
}
