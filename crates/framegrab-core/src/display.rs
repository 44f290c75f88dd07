use framegrab_hw::CanonicalFrame;
use thiserror::Error;

/// Key that ends a continuous capture.
pub const QUIT_KEY: char = 'q';

#[derive(Error, Debug)]
#[error("display failed: {0}")]
pub struct DisplayError(pub String);

/// A live preview sink.
pub trait Display {
    /// Render `frame` and poll the keyboard once without blocking.
    ///
    /// Returns the pressed key, if any.
    fn show(&mut self, frame: &CanonicalFrame) -> Result<Option<char>, DisplayError>;
}

/// Discards frames. Used when running headless.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

impl Display for NullDisplay {
    fn show(&mut self, _frame: &CanonicalFrame) -> Result<Option<char>, DisplayError> {
        Ok(None)
    }
}
