use std::fmt;

use crate::foundation::error::{FractError, FractResult};

/// Upper bound on the device pixel buffer (4 GiB, e.g. 16384x16384).
pub const MAX_PIXEL_BUFFER_BYTES: u64 = 1 << 32;

/// Output raster dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> FractResult<Self> {
        if width == 0 || height == 0 {
            return Err(FractError::config(format!(
                "canvas must be non-empty, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Size in bytes of the float pixel buffer backing this canvas. Canvases whose buffer would
    /// exceed [`MAX_PIXEL_BUFFER_BYTES`] are a configuration error.
    pub fn pixel_buffer_bytes(self) -> FractResult<u64> {
        self.pixel_count()
            .checked_mul(Pixel::BYTES as u64)
            .filter(|&bytes| bytes <= MAX_PIXEL_BUFFER_BYTES)
            .ok_or_else(|| {
                FractError::config(format!(
                    "canvas {self} needs more than {MAX_PIXEL_BUFFER_BYTES} bytes of pixel memory"
                ))
            })
    }

    /// Size in bytes of the packed RGBA8 output.
    pub fn rgba8_bytes(self) -> usize {
        (self.pixel_count() as usize) * 4
    }
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
        }
    }
}

impl fmt::Display for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Edge lengths of one tile. Every tile of a grid has the same size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
}

impl TileSize {
    pub fn square(edge: u32) -> Self {
        Self {
            width: edge,
            height: edge,
        }
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self::square(32)
    }
}

impl fmt::Display for TileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One device-resident pixel: four float channels, each expected in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pixel {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Pixel {
    /// Size of one pixel in device memory.
    pub const BYTES: usize = 16;

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn channels(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Decode a pixel from its 16-byte little-endian device layout.
    pub fn from_le_bytes(bytes: &[u8]) -> FractResult<Self> {
        if bytes.len() != Self::BYTES {
            return Err(FractError::device(format!(
                "pixel must be {} bytes, got {}",
                Self::BYTES,
                bytes.len()
            )));
        }
        let mut c = [0f32; 4];
        for (dst, src) in c.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
        Ok(Self::new(c[0], c[1], c[2], c[3]))
    }
}

/// One of the two independent execution tracks.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum LaneId {
    Zero,
    One,
}

impl LaneId {
    pub const ALL: [LaneId; 2] = [LaneId::Zero, LaneId::One];

    /// Checkerboard parity: even sums go to lane 0, odd sums to lane 1.
    pub fn from_parity(sum: u64) -> Self {
        if sum % 2 == 0 { Self::Zero } else { Self::One }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane{}", self.index())
    }
}

/// Tightly packed straight-alpha RGBA8 raster, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RasterRgba8 {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RasterRgba8 {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y as usize) * (self.width as usize) + x as usize) * 4;
        let px = self.data.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
