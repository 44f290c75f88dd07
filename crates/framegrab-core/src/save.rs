//! Periodic frame persistence.

use chrono::{DateTime, Local};
use framegrab_hw::CanonicalFrame;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("frame buffer does not match {width}x{height}")]
    Buffer { width: u32, height: u32 },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Save every Nth produced frame into a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePolicy {
    every: u64,
    output_dir: PathBuf,
}

impl SavePolicy {
    /// Save every `every` frames as PNG. `every == 0` never saves.
    pub fn new(every: u64, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            every,
            output_dir: output_dir.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, "")
    }

    pub fn every(&self) -> u64 {
        self.every
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_enabled(&self) -> bool {
        self.every > 0
    }

    /// Whether the `count`-th produced frame (1-based) is saved.
    pub fn should_save(&self, count: u64) -> bool {
        self.every > 0 && count > 0 && count % self.every == 0
    }

    /// `frame_<YYYYMMDD_HHMMSS>_<count:06>.png`
    pub fn file_name(&self, count: u64, at: DateTime<Local>) -> String {
        format!("frame_{}_{count:06}.png", at.format("%Y%m%d_%H%M%S"))
    }

    pub fn path_for(&self, count: u64, at: DateTime<Local>) -> PathBuf {
        self.output_dir.join(self.file_name(count, at))
    }

    /// Create the output directory if it does not exist.
    pub fn ensure_dir(&self) -> Result<(), SaveError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|source| SaveError::CreateDir {
            path: self.output_dir.clone(),
            source,
        })
    }

    /// Write `frame` as the `count`-th frame, stamped with the current time.
    pub fn save(&self, frame: &CanonicalFrame, count: u64) -> Result<PathBuf, SaveError> {
        self.ensure_dir()?;
        let path = self.path_for(count, Local::now());
        save_image(frame, &path)?;
        Ok(path)
    }
}

/// Encode a canonical frame to `path`. The format follows the extension.
pub fn save_image(frame: &CanonicalFrame, path: &Path) -> Result<(), SaveError> {
    let (width, height) = (frame.width(), frame.height());
    let img = image::RgbImage::from_raw(width, height, frame.to_rgb_bytes())
        .ok_or(SaveError::Buffer { width, height })?;
    img.save(path).map_err(|source| SaveError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "saved frame");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_tenth_of_thirty_five() {
        let policy = SavePolicy::new(10, "captures");
        let saved: Vec<u64> = (1..=35).filter(|&i| policy.should_save(i)).collect();
        assert_eq!(saved, vec![10, 20, 30]);
    }

    #[test]
    fn test_disabled_never_saves() {
        let policy = SavePolicy::disabled();
        assert!(!policy.is_enabled());
        assert!((0..100).all(|i| !policy.should_save(i)));
    }

    #[test]
    fn test_file_name_layout() {
        let policy = SavePolicy::new(10, "captures");
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(policy.file_name(20, at), "frame_20240309_070501_000020.png");
        assert_eq!(
            policy.path_for(20, at),
            Path::new("captures").join("frame_20240309_070501_000020.png")
        );
    }

    #[test]
    fn test_save_creates_directory_and_png() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("captures");
        let policy = SavePolicy::new(1, &dir);

        let mut frame = CanonicalFrame::black(4, 2);
        frame.put_pixel(0, 0, [255, 0, 0]);
        let path = policy.save(&frame, 1).unwrap();

        assert!(path.starts_with(&dir));
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (4, 2));
        // Stored BGR blue comes back as RGB blue.
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_save_image_encodes_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("single.jpg");
        save_image(&CanonicalFrame::black(8, 8), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
