//! framegrab-core: capture loop driver on top of `framegrab-hw`.
//!
//! Drives an acquisition session in single-frame or continuous mode,
//! measures the delivered rate, draws it onto each frame, saves every Nth
//! frame and hands frames to a display sink.

pub mod display;
pub mod driver;
pub mod overlay;
pub mod rate;
pub mod save;

pub use display::{Display, DisplayError, NullDisplay, QUIT_KEY};
pub use driver::{capture_single, CaptureLoop, DriverError, LoopSummary, StopReason, StopSignal};
pub use overlay::{draw_fps, fps_label, OverlayError};
pub use rate::RateMeter;
pub use save::{save_image, SaveError, SavePolicy};
