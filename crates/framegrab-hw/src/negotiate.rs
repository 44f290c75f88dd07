//! Capture parameter negotiation: pixel format, resolution, ROI offsets
//! and frame rate.
//!
//! Nothing in here fails. A node that is missing, locked or rejects a
//! write is logged and left at the device's current value.

use crate::node::{Node, NodeMap, NodeValue};
use serde::Serialize;

/// Preferred pixel formats, most preferred first.
pub const DEFAULT_FORMAT_PREFERENCES: [&str; 3] = ["RGB8Packed", "BGR8", "Mono8"];

/// Requested capture geometry and rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub width: i64,
    pub height: i64,
    pub fps: f64,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

/// Values read back from the device after negotiation.
///
/// Unreadable fields hold `-1` (`-1.0` for `fps`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectiveConfiguration {
    pub width: i64,
    pub height: i64,
    pub offset_x: i64,
    pub offset_y: i64,
    pub fps: f64,
}

/// Clamp a requested extent to `[0, max]` and round it down to even.
pub fn clamp_even(requested: i64, max: i64) -> i64 {
    let value = requested.clamp(0, max.max(0));
    value - value % 2
}

/// Apply `request` to the device and report what it ended up with.
pub fn negotiate(nodes: &mut dyn NodeMap, request: &CaptureRequest) -> EffectiveConfiguration {
    apply_resolution(nodes, request.width, request.height);
    center_offsets(nodes);
    apply_frame_rate(nodes, request.fps);

    let applied = read_back(nodes);
    tracing::info!(
        width = applied.width,
        height = applied.height,
        offset_x = applied.offset_x,
        offset_y = applied.offset_y,
        fps = format!("{:.2}", applied.fps),
        "applied capture configuration"
    );
    applied
}

fn apply_resolution(nodes: &mut dyn NodeMap, width: i64, height: i64) {
    if !(nodes.is_writable(Node::Width) && nodes.is_writable(Node::Height)) {
        tracing::warn!("Width/Height not writable; keeping device resolution");
        return;
    }

    let (Ok(max_w), Ok(max_h)) = (nodes.max_int(Node::Width), nodes.max_int(Node::Height)) else {
        tracing::warn!("Width/Height bounds not readable; keeping device resolution");
        return;
    };

    let width = clamp_even(width, max_w);
    let height = clamp_even(height, max_h);

    if write_logged(nodes, Node::Width, NodeValue::Int(width))
        && write_logged(nodes, Node::Height, NodeValue::Int(height))
    {
        tracing::info!(width, height, "resolution set");
    }
}

/// Center the region of interest. Best effort; silent when offsets are locked.
fn center_offsets(nodes: &mut dyn NodeMap) {
    if !(nodes.is_writable(Node::OffsetX) && nodes.is_writable(Node::OffsetY)) {
        return;
    }
    let (Ok(max_x), Ok(max_y)) = (nodes.max_int(Node::OffsetX), nodes.max_int(Node::OffsetY)) else {
        return;
    };
    write_logged(nodes, Node::OffsetX, NodeValue::Int(max_x.max(0) / 2));
    write_logged(nodes, Node::OffsetY, NodeValue::Int(max_y.max(0) / 2));
}

fn apply_frame_rate(nodes: &mut dyn NodeMap, fps: f64) {
    if nodes.is_writable(Node::AcquisitionFrameRateEnable) {
        write_logged(nodes, Node::AcquisitionFrameRateEnable, NodeValue::Bool(true));
    } else {
        tracing::warn!("AcquisitionFrameRateEnable not writable (might be always on)");
    }

    if !nodes.is_writable(Node::AcquisitionFrameRate) {
        tracing::warn!("cannot set AcquisitionFrameRate; keeping device rate");
        return;
    }

    let fps = match nodes.max_float(Node::AcquisitionFrameRate) {
        Ok(max) => fps.min(max),
        Err(e) => {
            tracing::warn!(error = %e, "frame rate bound not readable; writing request as-is");
            fps
        }
    }
    .max(0.0);

    if write_logged(nodes, Node::AcquisitionFrameRate, NodeValue::Float(fps)) {
        tracing::info!(fps = format!("{fps:.2}"), "frame rate set");
    }
}

fn read_back(nodes: &dyn NodeMap) -> EffectiveConfiguration {
    let int_or = |node| {
        if nodes.is_readable(node) {
            nodes.read_int(node).unwrap_or(-1)
        } else {
            -1
        }
    };
    let fps = if nodes.is_readable(Node::AcquisitionFrameRate) {
        nodes.read_float(Node::AcquisitionFrameRate).unwrap_or(-1.0)
    } else {
        -1.0
    };

    EffectiveConfiguration {
        width: int_or(Node::Width),
        height: int_or(Node::Height),
        offset_x: int_or(Node::OffsetX),
        offset_y: int_or(Node::OffsetY),
        fps,
    }
}

fn write_logged(nodes: &mut dyn NodeMap, node: Node, value: NodeValue) -> bool {
    match nodes.write(node, value) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(node = %node, error = %e, "write failed; leaving as-is");
            false
        }
    }
}

/// Current `PixelFormat` entry, if readable.
pub fn current_pixel_format(nodes: &dyn NodeMap) -> Option<String> {
    if !nodes.is_readable(Node::PixelFormat) {
        tracing::warn!("PixelFormat is not readable");
        return None;
    }
    match nodes.read_text(Node::PixelFormat) {
        Ok(symbolic) => {
            tracing::info!(pixel_format = %symbolic, "current pixel format");
            Some(symbolic)
        }
        Err(e) => {
            tracing::warn!(error = %e, "current PixelFormat entry is not readable");
            None
        }
    }
}

/// Switch to the first of `preferences` that the device offers.
///
/// Returns the entry that was set, or `None` when the device keeps its
/// current format.
pub fn select_pixel_format(nodes: &mut dyn NodeMap, preferences: &[&str]) -> Option<String> {
    if !nodes.is_writable(Node::PixelFormat) {
        tracing::warn!("cannot write PixelFormat; using current format");
        return None;
    }

    let entries = nodes.entries(Node::PixelFormat).unwrap_or_default();
    let Some(choice) = preferences
        .iter()
        .find(|pref| entries.iter().any(|e| e == *pref))
    else {
        tracing::warn!(?entries, "no preferred PixelFormat found; using default");
        return None;
    };

    if write_logged(nodes, Node::PixelFormat, NodeValue::Enum(choice.to_string())) {
        tracing::info!(pixel_format = %choice, "pixel format set");
        Some(choice.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{CameraSpec, SyntheticCamera};

    fn camera(spec: CameraSpec) -> SyntheticCamera {
        SyntheticCamera::new(spec)
    }

    #[test]
    fn test_clamp_even() {
        assert_eq!(clamp_even(4000, 1920), 1920);
        assert_eq!(clamp_even(4000, 1921), 1920);
        assert_eq!(clamp_even(1281, 1920), 1280);
        assert_eq!(clamp_even(-5, 1920), 0);
    }

    #[test]
    fn test_oversize_request_clamps_to_even_max() {
        let mut cam = camera(CameraSpec {
            sensor_width: 1441,
            sensor_height: 1081,
            ..CameraSpec::default()
        });
        let applied = negotiate(
            &mut cam,
            &CaptureRequest {
                width: 5000,
                height: 5000,
                fps: 30.0,
            },
        );
        assert_eq!(applied.width, 1440);
        assert_eq!(applied.height, 1080);
    }

    #[test]
    fn test_odd_request_rounds_down() {
        let mut cam = camera(CameraSpec::default());
        let applied = negotiate(
            &mut cam,
            &CaptureRequest {
                width: 1281,
                height: 721,
                fps: 30.0,
            },
        );
        assert_eq!((applied.width, applied.height), (1280, 720));
    }

    #[test]
    fn test_offsets_are_centered() {
        // 1290x740 sensor with a 1280x720 window leaves offset maxima (10, 20).
        let mut cam = camera(CameraSpec {
            sensor_width: 1290,
            sensor_height: 740,
            ..CameraSpec::default()
        });
        let applied = negotiate(&mut cam, &CaptureRequest::default());
        assert_eq!((applied.offset_x, applied.offset_y), (5, 10));
    }

    #[test]
    fn test_frame_rate_clamped_to_max() {
        let mut cam = camera(CameraSpec {
            max_fps: 24.0,
            ..CameraSpec::default()
        });
        let applied = negotiate(
            &mut cam,
            &CaptureRequest {
                fps: 60.0,
                ..CaptureRequest::default()
            },
        );
        assert_eq!(applied.fps, 24.0);
    }

    #[test]
    fn test_locked_nodes_keep_defaults() {
        let mut cam = camera(CameraSpec {
            sensor_width: 640,
            sensor_height: 480,
            resolution_writable: false,
            offsets_writable: false,
            frame_rate_writable: false,
            ..CameraSpec::default()
        });
        let applied = negotiate(&mut cam, &CaptureRequest::default());
        assert_eq!((applied.width, applied.height), (640, 480));
        assert_eq!((applied.offset_x, applied.offset_y), (0, 0));
        assert_eq!(applied.fps, 30.0);
    }

    #[test]
    fn test_unreadable_nodes_report_sentinels() {
        let mut cam = camera(CameraSpec {
            readback_hidden: true,
            ..CameraSpec::default()
        });
        let applied = negotiate(&mut cam, &CaptureRequest::default());
        assert_eq!(applied.width, -1);
        assert_eq!(applied.height, -1);
        assert_eq!(applied.fps, -1.0);
    }

    #[test]
    fn test_select_pixel_format_prefers_rgb() {
        let mut cam = camera(CameraSpec {
            pixel_formats: vec!["Mono8".into(), "BGR8".into(), "RGB8Packed".into()],
            pixel_format: "Mono8".into(),
            ..CameraSpec::default()
        });
        assert_eq!(current_pixel_format(&cam).as_deref(), Some("Mono8"));
        let chosen = select_pixel_format(&mut cam, &DEFAULT_FORMAT_PREFERENCES);
        assert_eq!(chosen.as_deref(), Some("RGB8Packed"));
        assert_eq!(current_pixel_format(&cam).as_deref(), Some("RGB8Packed"));
    }

    #[test]
    fn test_select_pixel_format_without_match_keeps_current() {
        let mut cam = camera(CameraSpec {
            pixel_formats: vec!["BayerRG8".into()],
            pixel_format: "BayerRG8".into(),
            ..CameraSpec::default()
        });
        assert_eq!(select_pixel_format(&mut cam, &DEFAULT_FORMAT_PREFERENCES), None);
        assert_eq!(current_pixel_format(&cam).as_deref(), Some("BayerRG8"));
    }
}
