//! framegrab-hw: hardware abstraction for camera capture.
//!
//! Models a GenICam-style camera SDK (system → camera list → camera →
//! node map) as traits, with a V4L2 backend and an in-memory synthetic
//! backend. On top of that sit the pixel-format normalizer, the capture
//! parameter negotiator and the scoped acquisition session.

pub mod camera;
pub mod device;
pub mod frame;
pub mod negotiate;
pub mod node;
pub mod normalize;
pub mod session;
pub mod synthetic;

pub use camera::V4l2System;
pub use device::{AcquisitionMode, CaptureDevice, CaptureSystem, DeviceError, DeviceInfo};
pub use frame::{CanonicalFrame, RawFrame};
pub use negotiate::{CaptureRequest, EffectiveConfiguration};
pub use node::{Access, Node, NodeError, NodeMap, NodeValue};
pub use normalize::{normalize, Confidence, FormatKind, Normalized};
pub use session::{AcquisitionSession, CameraList, CaptureContext, FrameGuard, SessionError};
pub use synthetic::{CameraSpec, Event, Journal, SyntheticCamera, SyntheticSystem};
