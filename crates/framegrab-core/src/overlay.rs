//! Measured frame rate drawn onto canonical frames.
//!
//! Text goes through OpenCV's `imgproc::put_text` when the `opencv` feature
//! is on. Without it frames pass through untouched.

use framegrab_hw::CanonicalFrame;

/// Overlay color, B, G, R.
pub const FPS_COLOR: [u8; 3] = [0, 255, 0];
/// Left edge and baseline of the FPS label.
pub const FPS_ORIGIN: (i32, i32) = (10, 30);
pub const FPS_FONT_SCALE: f64 = 1.0;
pub const FPS_THICKNESS: i32 = 2;

#[derive(Debug, thiserror::Error)]
#[error("overlay failed: {0}")]
pub struct OverlayError(pub String);

pub fn fps_label(fps: f64) -> String {
    format!("FPS: {fps:.1}")
}

/// Whether `draw_fps` actually renders text in this build.
pub const fn renders_text() -> bool {
    cfg!(feature = "opencv")
}

/// Draw `FPS: x.y` in the top-left corner.
#[cfg(feature = "opencv")]
pub fn draw_fps(frame: &mut CanonicalFrame, fps: f64) -> Result<(), OverlayError> {
    use opencv::{
        core::{self, Mat, Point, Scalar},
        imgproc,
    };

    let rows = frame.height() as i32;
    let cols = frame.width() as i32;
    let bytes = frame.as_bytes_mut();
    // The Mat writes into `bytes` and is dropped before they are.
    let mut mat = unsafe {
        Mat::new_rows_cols_with_data(
            rows,
            cols,
            core::CV_8UC3,
            bytes.as_mut_ptr() as *mut std::ffi::c_void,
            core::Mat_AUTO_STEP,
        )
    }
    .map_err(|e| OverlayError(format!("failed to wrap frame: {e}")))?;

    let [b, g, r] = FPS_COLOR;
    imgproc::put_text(
        &mut mat,
        &fps_label(fps),
        Point::new(FPS_ORIGIN.0, FPS_ORIGIN.1),
        imgproc::FONT_HERSHEY_SIMPLEX,
        FPS_FONT_SCALE,
        Scalar::new(b as f64, g as f64, r as f64, 0.0),
        FPS_THICKNESS,
        imgproc::LINE_8,
        false,
    )
    .map_err(|e| OverlayError(format!("failed to draw text: {e}")))
}

#[cfg(not(feature = "opencv"))]
pub fn draw_fps(_frame: &mut CanonicalFrame, _fps: f64) -> Result<(), OverlayError> {
    Ok(())
}
