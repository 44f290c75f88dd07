//! Pixel-format normalization to the canonical BGR layout.
//!
//! Format tags are classified by an ordered, case-insensitive substring
//! table, then dispatched on [`FormatKind`]. Nothing here fails: formats we
//! cannot identify go through a low-confidence fallback that guesses from
//! the buffer's channel count, and a warning is logged.

use crate::frame::{self, CanonicalFrame, RawFrame};

/// 2x2 color filter layout, named by its first row (GenICam convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerPattern {
    Rg,
    Gb,
    Gr,
    Bg,
}

/// Index of a color within a BGR pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Blue = 0,
    Green = 1,
    Red = 2,
}

impl BayerPattern {
    fn layout(self) -> [[Color; 2]; 2] {
        use Color::*;
        match self {
            BayerPattern::Rg => [[Red, Green], [Green, Blue]],
            BayerPattern::Gb => [[Green, Blue], [Red, Green]],
            BayerPattern::Gr => [[Green, Red], [Blue, Green]],
            BayerPattern::Bg => [[Blue, Green], [Green, Red]],
        }
    }

    fn color_at(self, x: usize, y: usize) -> Color {
        self.layout()[y % 2][x % 2]
    }
}

/// Recognized pixel formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatKind {
    Mono8,
    Rgb8,
    Bgr8,
    Bayer(BayerPattern),
    Yuyv,
    /// A tag was reported but nothing in the table matched it.
    Unknown(String),
    /// The device reported no tag at all.
    Unnamed,
}

/// Ordered classification table. First match wins.
///
/// Bayer tags precede the packed color ones: "BAYERGB8" contains "RGB8".
const FORMAT_TABLE: &[(&str, FormatKind)] = &[
    ("MONO8", FormatKind::Mono8),
    ("BAYERRG8", FormatKind::Bayer(BayerPattern::Rg)),
    ("BAYERGB8", FormatKind::Bayer(BayerPattern::Gb)),
    ("BAYERGR8", FormatKind::Bayer(BayerPattern::Gr)),
    ("BAYERBG8", FormatKind::Bayer(BayerPattern::Bg)),
    ("RGB8", FormatKind::Rgb8),
    ("BGR8", FormatKind::Bgr8),
    ("YUYV", FormatKind::Yuyv),
    ("YUV422", FormatKind::Yuyv),
];

impl FormatKind {
    pub fn classify(tag: Option<&str>) -> FormatKind {
        let Some(tag) = tag else {
            return FormatKind::Unnamed;
        };
        let upper = tag.to_ascii_uppercase();
        FORMAT_TABLE
            .iter()
            .find(|(needle, _)| upper.contains(needle))
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| FormatKind::Unknown(tag.to_string()))
    }

    /// Channel count a buffer of this format must have.
    fn expected_channels(&self) -> Option<u32> {
        match self {
            FormatKind::Mono8 | FormatKind::Bayer(_) => Some(1),
            FormatKind::Rgb8 | FormatKind::Bgr8 => Some(3),
            FormatKind::Yuyv => Some(2),
            FormatKind::Unknown(_) | FormatKind::Unnamed => None,
        }
    }
}

/// How much to trust a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// The format was recognized and converted by its own routine.
    Exact,
    /// The layout was guessed from the buffer's channel count.
    Fallback,
}

#[derive(Debug)]
pub struct Normalized {
    pub frame: CanonicalFrame,
    pub kind: FormatKind,
    pub confidence: Confidence,
}

/// Convert a raw frame to canonical BGR.
///
/// BGR8 input is moved through without copying.
pub fn normalize(raw: RawFrame) -> Normalized {
    let kind = FormatKind::classify(raw.pixel_format.as_deref());
    let (width, height) = (raw.width, raw.height);

    let mismatch = kind
        .expected_channels()
        .is_some_and(|expected| expected != raw.channels);

    let (data, confidence) = match &kind {
        _ if mismatch => {
            tracing::warn!(
                format = ?raw.pixel_format,
                channels = raw.channels,
                "pixel format does not match buffer layout; using generic conversion"
            );
            (fallback(raw), Confidence::Fallback)
        }
        FormatKind::Mono8 => (gray_to_bgr(raw.data()), Confidence::Exact),
        FormatKind::Rgb8 => (rgb_to_bgr(raw), Confidence::Exact),
        FormatKind::Bgr8 => (raw.into_data(), Confidence::Exact),
        FormatKind::Bayer(pattern) => (
            demosaic_bilinear(raw.data(), width as usize, height as usize, *pattern),
            Confidence::Exact,
        ),
        FormatKind::Yuyv => match frame::yuyv_to_bgr(raw.data(), width, height) {
            Ok(bgr) => (bgr, Confidence::Exact),
            Err(e) => {
                tracing::warn!(error = %e, "YUYV conversion failed; using generic conversion");
                (fallback(raw), Confidence::Fallback)
            }
        },
        FormatKind::Unknown(tag) => {
            tracing::warn!(format = %tag, "unhandled pixel format; using generic conversion");
            (fallback(raw), Confidence::Fallback)
        }
        FormatKind::Unnamed => {
            tracing::warn!(
                channels = raw.channels,
                "pixel format without name; using generic conversion"
            );
            (fallback(raw), Confidence::Fallback)
        }
    };

    // Every branch yields width * height * 3 bytes.
    let frame = CanonicalFrame::from_bgr(data, width, height).unwrap_or_else(|e| {
        tracing::warn!(
            error = %e,
            width,
            height,
            "conversion produced a short frame; using black"
        );
        CanonicalFrame::black(width, height)
    });

    Normalized {
        frame,
        kind,
        confidence,
    }
}

/// Dimensionality heuristic: single plane is gray, anything else is RGB-ordered.
fn fallback(raw: RawFrame) -> Vec<u8> {
    match raw.channels {
        1 => gray_to_bgr(raw.data()),
        3 => rgb_to_bgr(raw),
        n => {
            let n = n as usize;
            if n > 3 {
                raw.data()
                    .chunks_exact(n)
                    .flat_map(|px| [px[2], px[1], px[0]])
                    .collect()
            } else {
                // Two samples per pixel: keep the first as luma.
                gray_to_bgr(&raw.data().iter().step_by(n.max(1)).copied().collect::<Vec<_>>())
            }
        }
    }
}

fn gray_to_bgr(gray: &[u8]) -> Vec<u8> {
    gray.iter().flat_map(|&v| [v, v, v]).collect()
}

fn rgb_to_bgr(raw: RawFrame) -> Vec<u8> {
    let mut data = raw.into_data();
    frame::swap_red_blue(&mut data, 3);
    data
}

/// Bilinear demosaic.
///
/// Each pixel keeps its own sample for its filter color; the other two
/// colors are the mean of the same-colored pixels in its 3x3
/// neighbourhood. Edges use only in-bounds neighbours.
fn demosaic_bilinear(raw: &[u8], width: usize, height: usize, pattern: BayerPattern) -> Vec<u8> {
    let mut bgr = vec![0u8; width * height * 3];

    for y in 0..height {
        for x in 0..width {
            let center = raw[y * width + x];
            let own = pattern.color_at(x, y);
            let mut sum = [0u32; 3];
            let mut count = [0u32; 3];

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    if nx == x && ny == y {
                        continue;
                    }
                    let color = pattern.color_at(nx, ny) as usize;
                    sum[color] += raw[ny * width + nx] as u32;
                    count[color] += 1;
                }
            }

            let out = &mut bgr[(y * width + x) * 3..][..3];
            for color in [Color::Blue, Color::Green, Color::Red] {
                let c = color as usize;
                out[c] = if color == own || count[c] == 0 {
                    center
                } else {
                    ((sum[c] + count[c] / 2) / count[c]) as u8
                };
            }
        }
    }

    bgr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: Vec<u8>, w: u32, h: u32, channels: u32, tag: Option<&str>) -> RawFrame {
        RawFrame::new(data, w, h, channels, tag.map(str::to_string), 1).unwrap()
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(FormatKind::classify(Some("Mono8")), FormatKind::Mono8);
        assert_eq!(FormatKind::classify(Some("RGB8Packed")), FormatKind::Rgb8);
        assert_eq!(FormatKind::classify(Some("bgr8")), FormatKind::Bgr8);
        assert_eq!(
            FormatKind::classify(Some("BayerGB8")),
            FormatKind::Bayer(BayerPattern::Gb)
        );
        assert_eq!(
            FormatKind::classify(Some("BayerGR8")),
            FormatKind::Bayer(BayerPattern::Gr)
        );
        assert_eq!(
            FormatKind::classify(Some("BayerBG8")),
            FormatKind::Bayer(BayerPattern::Bg)
        );
        assert_eq!(FormatKind::classify(Some("YUV422Packed")), FormatKind::Yuyv);
        assert_eq!(
            FormatKind::classify(Some("Mono12p")),
            FormatKind::Unknown("Mono12p".into())
        );
        assert_eq!(FormatKind::classify(None), FormatKind::Unnamed);
    }

    #[test]
    fn test_every_format_yields_three_channels() {
        let (w, h) = (4u32, 2u32);
        let n = (w * h) as usize;
        let cases: Vec<(Option<&str>, u32)> = vec![
            (Some("Mono8"), 1),
            (Some("RGB8"), 3),
            (Some("BGR8"), 3),
            (Some("BayerRG8"), 1),
            (Some("BayerGB8"), 1),
            (Some("BayerGR8"), 1),
            (Some("BayerBG8"), 1),
            (Some("YUYV"), 2),
            (Some("Mono16"), 1),
            (Some("Coord3D_ABC8"), 3),
            (None, 1),
            (None, 3),
            (None, 4),
        ];
        for (tag, channels) in cases {
            let data: Vec<u8> = (0..n * channels as usize).map(|i| i as u8).collect();
            let out = normalize(raw(data, w, h, channels, tag));
            assert_eq!(out.frame.width(), w, "{tag:?}");
            assert_eq!(out.frame.height(), h, "{tag:?}");
            assert_eq!(out.frame.channels(), 3);
            assert_eq!(out.frame.as_bytes().len(), n * 3, "{tag:?}");
        }
    }

    #[test]
    fn test_bgr_is_passed_through() {
        let data: Vec<u8> = (0..18).collect();
        let out = normalize(raw(data.clone(), 3, 2, 3, Some("BGR8")));
        assert_eq!(out.frame.as_bytes(), data.as_slice());
        assert_eq!(out.confidence, Confidence::Exact);

        // Normalizing the result again changes nothing.
        let again = normalize(raw(out.frame.as_bytes().to_vec(), 3, 2, 3, Some("BGR8")));
        assert_eq!(again.frame, out.frame);
    }

    #[test]
    fn test_rgb_is_swapped() {
        let out = normalize(raw(vec![10, 20, 30], 1, 1, 3, Some("RGB8")));
        assert_eq!(out.frame.pixel(0, 0), [30, 20, 10]);
    }

    #[test]
    fn test_mono_is_expanded() {
        let out = normalize(raw(vec![7, 200], 2, 1, 1, Some("Mono8")));
        assert_eq!(out.frame.as_bytes(), &[7, 7, 7, 200, 200, 200]);
    }

    #[test]
    fn test_bayer_rg_2x2() {
        // R G
        // G B
        let out = normalize(raw(vec![200, 100, 100, 50], 2, 2, 1, Some("BayerRG8")));
        assert_eq!(out.frame.pixel(0, 0), [50, 100, 200]);
        assert_eq!(out.frame.pixel(1, 1), [50, 100, 200]);
    }

    #[test]
    fn test_bayer_bg_swaps_red_and_blue_sites() {
        let out = normalize(raw(vec![200, 100, 100, 50], 2, 2, 1, Some("BayerBG8")));
        assert_eq!(out.frame.pixel(0, 0), [200, 100, 50]);
    }

    #[test]
    fn test_bayer_uniform_field_stays_uniform() {
        for tag in ["BayerRG8", "BayerGB8", "BayerGR8", "BayerBG8"] {
            let out = normalize(raw(vec![90u8; 6 * 4], 6, 4, 1, Some(tag)));
            assert!(out.frame.as_bytes().iter().all(|&v| v == 90), "{tag}");
        }
    }

    #[test]
    fn test_unknown_tag_falls_back_by_dimensionality() {
        let gray = normalize(raw(vec![42], 1, 1, 1, Some("Polarized8")));
        assert_eq!(gray.frame.pixel(0, 0), [42, 42, 42]);
        assert_eq!(gray.confidence, Confidence::Fallback);
        assert_eq!(gray.kind, FormatKind::Unknown("Polarized8".into()));

        let color = normalize(raw(vec![1, 2, 3], 1, 1, 3, Some("Polarized8")));
        assert_eq!(color.frame.pixel(0, 0), [3, 2, 1]);
    }

    #[test]
    fn test_unnamed_falls_back_by_dimensionality() {
        let out = normalize(raw(vec![1, 2, 3, 255], 1, 1, 4, None));
        assert_eq!(out.kind, FormatKind::Unnamed);
        assert_eq!(out.frame.pixel(0, 0), [3, 2, 1]);
    }

    #[test]
    fn test_mislabelled_buffer_uses_fallback() {
        // Claims Mono8 but carries three samples per pixel.
        let out = normalize(raw(vec![1, 2, 3], 1, 1, 3, Some("Mono8")));
        assert_eq!(out.confidence, Confidence::Fallback);
        assert_eq!(out.frame.pixel(0, 0), [3, 2, 1]);
    }
}
