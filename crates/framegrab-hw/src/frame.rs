//! Frame types: raw sensor buffers and the canonical BGR frame.

/// A frame as delivered by a device, in its sensor-native layout.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Samples per pixel. 1 means a single-plane buffer.
    pub channels: u32,
    /// Symbolic pixel format name (e.g. "BayerRG8"), when the device reports one.
    pub pixel_format: Option<String>,
    pub sequence: u64,
    pub incomplete: bool,
    /// Device-specific status text for incomplete frames.
    pub status: Option<String>,
    pub timestamp: std::time::Instant,
}

impl RawFrame {
    /// Build a complete frame. `data` must hold `width * height * channels` bytes.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u32,
        pixel_format: Option<String>,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize) * (channels as usize);
        if channels == 0 || data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            pixel_format,
            sequence,
            incomplete: false,
            status: None,
            timestamp: std::time::Instant::now(),
        })
    }

    /// A frame the device flagged as incomplete. Its payload is not usable.
    pub fn incomplete(sequence: u64, status: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            channels: 0,
            pixel_format: None,
            sequence,
            incomplete: true,
            status: Some(status.into()),
            timestamp: std::time::Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_single_plane(&self) -> bool {
        self.channels == 1
    }
}

/// Interleaved 3-channel frame in B, G, R byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl CanonicalFrame {
    pub const CHANNELS: u32 = 3;

    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        Self::CHANNELS
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// `[b, g, r]` at (x, y). Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = self.offset(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Write `[b, g, r]` at (x, y); out-of-bounds writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = self.offset(x, y);
        self.data[i..i + 3].copy_from_slice(&bgr);
    }

    /// Copy out in R, G, B order, as image encoders expect.
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let mut rgb = self.data.clone();
        swap_red_blue(&mut rgb, 3);
        rgb
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }
}

/// Swap the first and third sample of every `stride`-byte pixel in place.
pub(crate) fn swap_red_blue(data: &mut [u8], stride: usize) {
    for px in data.chunks_exact_mut(stride) {
        px.swap(0, 2);
    }
}

/// Convert packed YUYV (4:2:2) to BGR using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut bgr = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            bgr.push(clamp_to_u8(y + 1.772 * u));
            bgr.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            bgr.push(clamp_to_u8(y + 1.402 * v));
        }
    }
    Ok(bgr)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
