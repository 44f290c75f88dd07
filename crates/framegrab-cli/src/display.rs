use framegrab_core::{Display, NullDisplay};

/// Pick the preview sink. Falls back to headless when built without the
/// `display` feature.
pub fn open(headless: bool, title: &str) -> anyhow::Result<Box<dyn Display>> {
    if headless {
        return Ok(Box::new(NullDisplay));
    }
    open_window(title)
}

#[cfg(feature = "display")]
fn open_window(title: &str) -> anyhow::Result<Box<dyn Display>> {
    Ok(Box::new(highgui_window::HighguiDisplay::new(title)?))
}

#[cfg(not(feature = "display"))]
fn open_window(title: &str) -> anyhow::Result<Box<dyn Display>> {
    tracing::warn!(
        window = title,
        "built without the `display` feature; streaming headless"
    );
    Ok(Box::new(NullDisplay))
}

#[cfg(feature = "display")]
mod highgui_window {
    use framegrab_core::{Display, DisplayError};
    use framegrab_hw::CanonicalFrame;
    use opencv::{
        core::{self, Mat},
        highgui,
    };

    /// OpenCV window showing BGR frames.
    pub struct HighguiDisplay {
        title: String,
    }

    impl HighguiDisplay {
        pub fn new(title: &str) -> anyhow::Result<Self> {
            highgui::named_window(title, highgui::WINDOW_AUTOSIZE)?;
            Ok(Self {
                title: title.to_string(),
            })
        }
    }

    impl Display for HighguiDisplay {
        fn show(&mut self, frame: &CanonicalFrame) -> Result<Option<char>, DisplayError> {
            let bytes = frame.as_bytes();
            // The Mat borrows `bytes` and is dropped before they are.
            let mat = unsafe {
                Mat::new_rows_cols_with_data(
                    frame.height() as i32,
                    frame.width() as i32,
                    core::CV_8UC3,
                    bytes.as_ptr() as *mut std::ffi::c_void,
                    core::Mat_AUTO_STEP,
                )
            }
            .map_err(|e| DisplayError(format!("failed to wrap frame: {e}")))?;

            highgui::imshow(&self.title, &mat)
                .map_err(|e| DisplayError(format!("failed to show frame: {e}")))?;
            let key = highgui::wait_key(1)
                .map_err(|e| DisplayError(format!("failed to poll key: {e}")))?;
            Ok((key >= 0).then(|| char::from((key & 0xFF) as u8)))
        }
    }

    impl Drop for HighguiDisplay {
        fn drop(&mut self) {
            let _ = highgui::destroy_window(&self.title);
        }
    }
}
