//! V4L2 camera capture via the `v4l` crate.
//!
//! V4L2 devices are mapped onto the node model: `Width`, `Height` and
//! `PixelFormat` go through the format ioctls, `AcquisitionFrameRate`
//! through stream parameters. V4L2 has no ROI offsets or frame-rate enable
//! switch, so those nodes report as unavailable.

use crate::device::{AcquisitionMode, CaptureDevice, CaptureSystem, DeviceError, DeviceInfo};
use crate::frame::RawFrame;
use crate::node::{Access, Node, NodeError, NodeMap, NodeValue};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::{Flags as BufFlags, Type as BufType};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::parameters::{Capabilities as ParamCaps, Parameters};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const BUFFER_COUNT: u32 = 4;

/// V4L2 fourcc codes and their GenICam-style names.
const FOURCC_NAMES: &[(&[u8; 4], &str)] = &[
    (b"GREY", "Mono8"),
    (b"RGB3", "RGB8"),
    (b"BGR3", "BGR8"),
    (b"RGGB", "BayerRG8"),
    (b"GBRG", "BayerGB8"),
    (b"GRBG", "BayerGR8"),
    (b"BA81", "BayerBG8"),
    (b"YUYV", "YUYV"),
];

/// Pixel format name for a fourcc. Unmapped codes keep their fourcc text.
pub fn format_name(fourcc: FourCC) -> String {
    FOURCC_NAMES
        .iter()
        .find(|(code, _)| **code == fourcc.repr)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| String::from_utf8_lossy(&fourcc.repr).trim_end().to_string())
}

/// Inverse of [`format_name`].
pub fn fourcc_for(name: &str) -> Option<FourCC> {
    if let Some((code, _)) = FOURCC_NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(name)) {
        return Some(FourCC::new(code));
    }
    let bytes: [u8; 4] = name.as_bytes().try_into().ok()?;
    Some(FourCC::new(&bytes))
}

/// Pixel formats worth switching a V4L2 device to, most preferred first.
pub const V4L2_FORMAT_PREFERENCES: [&str; 4] = ["BGR8", "RGB8", "YUYV", "Mono8"];

/// Samples per pixel for a known fourcc.
fn channels_for(fourcc: FourCC) -> Option<u32> {
    match &fourcc.repr {
        b"GREY" | b"RGGB" | b"GBRG" | b"GRBG" | b"BA81" => Some(1),
        b"RGB3" | b"BGR3" => Some(3),
        b"YUYV" => Some(2),
        _ => None,
    }
}

/// Samples per pixel, or an error for formats that cannot be unpacked
/// into a fixed-size raster (e.g. MJPG).
fn frame_channels(fourcc: FourCC) -> Result<u32, DeviceError> {
    channels_for(fourcc).ok_or_else(|| {
        DeviceError::Io(format!("unsupported pixel format {}", format_name(fourcc)))
    })
}

/// Capture system over `/dev/video*` nodes.
#[derive(Debug, Default)]
pub struct V4l2System {
    /// Restrict enumeration to this device path.
    only: Option<String>,
}

impl V4l2System {
    pub fn new() -> Self {
        Self::default()
    }

    /// A system that enumerates only `device_path`.
    pub fn with_device(device_path: impl Into<String>) -> Self {
        Self {
            only: Some(device_path.into()),
        }
    }

    /// List available V4L2 video capture devices, ordered by index.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut indices: Vec<u32> = std::fs::read_dir("/dev")
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        e.file_name()
                            .to_str()?
                            .strip_prefix("video")?
                            .parse::<u32>()
                            .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        indices.sort_unstable();

        indices
            .into_iter()
            .filter_map(|i| probe(&format!("/dev/video{i}")))
            .collect()
    }
}

/// Query a device node; `None` unless it is a video capture device.
fn probe(path: &str) -> Option<DeviceInfo> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return None;
    }
    Some(DeviceInfo {
        vendor: caps.driver.clone(),
        model: caps.card.clone(),
        serial: caps.bus.clone(),
        path: Some(path.to_string()),
        real_path: std::fs::canonicalize(path)
            .ok()
            .map(|p| p.to_string_lossy().into_owned()),
    })
}

impl CaptureSystem for V4l2System {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn cameras(&mut self) -> Result<Vec<Box<dyn CaptureDevice>>, DeviceError> {
        let infos = match &self.only {
            Some(path) => {
                if !Path::new(path).exists() {
                    tracing::warn!(device = %path, "device path does not exist");
                    return Ok(Vec::new());
                }
                probe(path).into_iter().collect()
            }
            None => Self::list_devices(),
        };
        Ok(infos
            .into_iter()
            .map(|info| Box::new(V4l2Camera::new(info)) as Box<dyn CaptureDevice>)
            .collect())
    }

    fn release_instance(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// V4L2 camera device handle.
pub struct V4l2Camera {
    info: DeviceInfo,
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    mode: AcquisitionMode,
    sequence: u64,
    frames_this_run: u64,
    outstanding: BTreeSet<u64>,
}

impl V4l2Camera {
    fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            stream: None,
            device: None,
            mode: AcquisitionMode::Continuous,
            sequence: 0,
            frames_this_run: 0,
            outstanding: BTreeSet::new(),
        }
    }

    fn path(&self) -> &str {
        self.info.path.as_deref().unwrap_or_default()
    }

    fn device(&self, node: Node) -> Result<&Device, NodeError> {
        self.device.as_ref().ok_or(NodeError::NotAvailable(node))
    }

    fn idle(&self) -> bool {
        self.device.is_some() && self.stream.is_none()
    }

    fn supports_frame_interval(&self) -> bool {
        self.device
            .as_ref()
            .and_then(|d| d.params().ok())
            .is_some_and(|p| p.capabilities.contains(ParamCaps::TIME_PER_FRAME))
    }

    fn max_extent(&self, node: Node) -> Result<i64, NodeError> {
        let dev = self.device(node)?;
        let fmt = dev.format().map_err(|e| rejected(node, e))?;
        let sizes = dev.enum_framesizes(fmt.fourcc).map_err(|e| rejected(node, e))?;
        let pick = |w: u32, h: u32| if node == Node::Width { w } else { h };
        sizes
            .iter()
            .map(|s| match &s.size {
                FrameSizeEnum::Discrete(d) => pick(d.width, d.height),
                FrameSizeEnum::Stepwise(s) => pick(s.max_width, s.max_height),
            })
            .max()
            .map(i64::from)
            .ok_or(NodeError::NotAvailable(node))
    }

    fn max_fps(&self) -> Result<f64, NodeError> {
        let node = Node::AcquisitionFrameRate;
        let dev = self.device(node)?;
        let fmt = dev.format().map_err(|e| rejected(node, e))?;
        let intervals = dev
            .enum_frameintervals(fmt.fourcc, fmt.width, fmt.height)
            .map_err(|e| rejected(node, e))?;
        intervals
            .iter()
            .map(|i| match &i.interval {
                FrameIntervalEnum::Discrete(f) => fraction_to_fps(f.numerator, f.denominator),
                FrameIntervalEnum::Stepwise(s) => fraction_to_fps(s.min.numerator, s.min.denominator),
            })
            .fold(None, |acc: Option<f64>, fps| Some(acc.map_or(fps, |a| a.max(fps))))
            .ok_or(NodeError::NotAvailable(node))
    }

    fn set_extent(&mut self, node: Node, value: i64) -> Result<(), NodeError> {
        let value = u32::try_from(value).map_err(|_| NodeError::Rejected {
            node,
            reason: format!("{value} is negative"),
        })?;
        let dev = self.device(node)?;
        let mut fmt = dev.format().map_err(|e| rejected(node, e))?;
        if node == Node::Width {
            fmt.width = value;
        } else {
            fmt.height = value;
        }
        let negotiated = dev.set_format(&fmt).map_err(|e| rejected(node, e))?;
        tracing::debug!(
            device = self.path(),
            width = negotiated.width,
            height = negotiated.height,
            "negotiated format"
        );
        Ok(())
    }
}

fn fraction_to_fps(numerator: u32, denominator: u32) -> f64 {
    if numerator == 0 {
        0.0
    } else {
        denominator as f64 / numerator as f64
    }
}

fn rejected(node: Node, e: io::Error) -> NodeError {
    NodeError::Rejected {
        node,
        reason: e.to_string(),
    }
}

impl NodeMap for V4l2Camera {
    fn access(&self, node: Node) -> Access {
        let open = self.device.is_some();
        match node {
            Node::DeviceVendorName | Node::DeviceModelName | Node::DeviceSerialNumber => {
                Access::READ_ONLY
            }
            Node::PixelFormat | Node::AcquisitionMode | Node::Width | Node::Height => Access {
                readable: open,
                writable: self.idle(),
            },
            Node::AcquisitionFrameRate if self.supports_frame_interval() => Access {
                readable: true,
                writable: self.idle(),
            },
            Node::AcquisitionFrameRate
            | Node::OffsetX
            | Node::OffsetY
            | Node::AcquisitionFrameRateEnable => Access::NONE,
        }
    }

    fn read(&self, node: Node) -> Result<NodeValue, NodeError> {
        match node {
            Node::DeviceVendorName => Ok(NodeValue::Str(self.info.vendor.clone())),
            Node::DeviceModelName => Ok(NodeValue::Str(self.info.model.clone())),
            Node::DeviceSerialNumber => Ok(NodeValue::Str(self.info.serial.clone())),
            Node::AcquisitionMode => {
                self.device(node)?;
                Ok(NodeValue::Enum(self.mode.entry().to_string()))
            }
            Node::PixelFormat | Node::Width | Node::Height => {
                let fmt = self.device(node)?.format().map_err(|e| rejected(node, e))?;
                Ok(match node {
                    Node::PixelFormat => NodeValue::Enum(format_name(fmt.fourcc)),
                    Node::Width => NodeValue::Int(fmt.width.into()),
                    _ => NodeValue::Int(fmt.height.into()),
                })
            }
            Node::AcquisitionFrameRate => {
                let params = self.device(node)?.params().map_err(|e| rejected(node, e))?;
                let fps = fraction_to_fps(params.interval.numerator, params.interval.denominator);
                Ok(NodeValue::Float(fps))
            }
            other => Err(NodeError::NotAvailable(other)),
        }
    }

    fn max(&self, node: Node) -> Result<NodeValue, NodeError> {
        match node {
            Node::Width | Node::Height => self.max_extent(node).map(NodeValue::Int),
            Node::AcquisitionFrameRate => self.max_fps().map(NodeValue::Float),
            other => Err(NodeError::NotAvailable(other)),
        }
    }

    fn write(&mut self, node: Node, value: NodeValue) -> Result<(), NodeError> {
        if !self.access(node).writable {
            return Err(NodeError::NotWritable(node));
        }
        match (node, value) {
            (Node::Width | Node::Height, NodeValue::Int(v)) => self.set_extent(node, v),
            (Node::PixelFormat, NodeValue::Enum(name)) => {
                let fourcc = fourcc_for(&name).ok_or_else(|| NodeError::Rejected {
                    node,
                    reason: format!("no fourcc for {name}"),
                })?;
                let dev = self.device(node)?;
                let mut fmt = dev.format().map_err(|e| rejected(node, e))?;
                fmt.fourcc = fourcc;
                let negotiated = dev.set_format(&fmt).map_err(|e| rejected(node, e))?;
                if negotiated.fourcc != fourcc {
                    return Err(NodeError::Rejected {
                        node,
                        reason: format!("driver chose {}", format_name(negotiated.fourcc)),
                    });
                }
                Ok(())
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
                Ok(())
            }
            (Node::AcquisitionFrameRate, NodeValue::Float(fps)) => {
                let params = Parameters::with_fps(fps.round().max(1.0) as u32);
                self.device(node)?
                    .set_params(&params)
                    .map_err(|e| rejected(node, e))?;
                Ok(())
            }
            (node, value) => Err(NodeError::TypeMismatch {
                node,
                expected: "matching node type",
                actual: value.kind(),
            }),
        }
    }

    fn entries(&self, node: Node) -> Result<Vec<String>, NodeError> {
        match node {
            Node::PixelFormat => {
                let formats = self
                    .device(node)?
                    .enum_formats()
                    .map_err(|e| rejected(node, e))?;
                Ok(formats.iter().map(|f| format_name(f.fourcc)).collect())
            }
            Node::AcquisitionMode => Ok(vec!["Continuous".into(), "SingleFrame".into()]),
            other => Err(NodeError::NotAvailable(other)),
        }
    }
}

impl CaptureDevice for V4l2Camera {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    /// Open the device node.
    fn init(&mut self) -> Result<(), DeviceError> {
        if self.device.is_some() {
            return Err(DeviceError::Busy);
        }
        let path = self.path().to_string();
        if !Path::new(&path).exists() {
            return Err(DeviceError::NotFound(path));
        }

        let device = Device::with_path(&path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                DeviceError::Busy
            } else {
                DeviceError::NotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| DeviceError::Io(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::STREAMING) {
            return Err(DeviceError::Io(format!("{path}: streaming not supported")));
        }

        tracing::info!(
            device = %path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        self.device = Some(device);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DeviceError> {
        self.stream = None;
        self.outstanding.clear();
        self.device = None;
        Ok(())
    }

    /// Map the capture buffers. The driver starts streaming on the first
    /// dequeue.
    fn begin_acquisition(&mut self) -> Result<(), DeviceError> {
        let device = self.device.as_ref().ok_or(DeviceError::NotStreaming)?;
        let stream = MmapStream::with_buffers(device, BufType::VideoCapture, BUFFER_COUNT)
            .map_err(|e| DeviceError::Io(format!("failed to create mmap stream: {e}")))?;
        self.stream = Some(stream);
        self.frames_this_run = 0;
        Ok(())
    }

    /// Dropping the stream turns streaming off and unmaps the buffers.
    fn end_acquisition(&mut self) -> Result<(), DeviceError> {
        self.stream.take().ok_or(DeviceError::NotStreaming)?;
        self.outstanding.clear();
        tracing::debug!(device = self.path(), "stream stopped");
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, DeviceError> {
        if self.mode == AcquisitionMode::SingleFrame && self.frames_this_run >= 1 {
            return Err(DeviceError::Timeout(timeout));
        }
        let fmt = self
            .device
            .as_ref()
            .ok_or(DeviceError::NotStreaming)?
            .format()
            .map_err(|e| DeviceError::Io(format!("failed to get format: {e}")))?;
        let channels = frame_channels(fmt.fourcc)?;
        let stream = self.stream.as_mut().ok_or(DeviceError::NotStreaming)?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => DeviceError::Timeout(timeout),
            _ => DeviceError::Io(format!("failed to dequeue buffer: {e}")),
        })?;

        self.sequence += 1;
        self.frames_this_run += 1;
        let sequence = self.sequence;
        self.outstanding.insert(sequence);

        let pixels = fmt.width as usize * fmt.height as usize;
        let used = (meta.bytesused as usize).min(buf.len());
        let expected = pixels * channels as usize;

        if meta.flags.contains(BufFlags::ERROR) {
            return Ok(RawFrame::incomplete(sequence, "buffer error flag set"));
        }
        if used < expected {
            return Ok(RawFrame::incomplete(
                sequence,
                format!("short buffer: expected {expected} bytes, got {used}"),
            ));
        }

        RawFrame::new(
            buf[..expected].to_vec(),
            fmt.width,
            fmt.height,
            channels,
            Some(format_name(fmt.fourcc)),
            sequence,
        )
        .map_err(|e| DeviceError::Io(e.to_string()))
    }

    /// Retire a frame. The mmap buffer itself is requeued by the stream on
    /// the next dequeue, since the data was already copied out.
    fn release_frame(&mut self, sequence: u64) -> Result<(), DeviceError> {
        if self.outstanding.remove(&sequence) {
            Ok(())
        } else {
            Err(DeviceError::UnknownFrame(sequence))
        }
    }
}
