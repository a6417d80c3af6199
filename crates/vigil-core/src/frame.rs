//! Frame type and pixel sampling — image decoding, grid sampling, JPEG encoding.

use std::path::{Path, PathBuf};

/// A decoded RGB image.
///
/// Frames own their pixel buffer; dropping the frame releases it. Gallery
/// scans decode one candidate at a time so at most one reference frame is
/// alive per worker. Every constructor keeps `data.len() == width * height * 3`.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data.
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap an existing packed RGB8 buffer.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
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

    /// Build a frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...) into RGB8.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// Read and decode an image file.
    pub fn open(path: &Path) -> Result<Self, FrameError> {
        let bytes = std::fs::read(path).map_err(|source| FrameError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&bytes)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB8 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Total number of pixels.
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// RGB value at (x, y). Caller guarantees the coordinates are in bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Iterate pixels on a sparse grid: every `stride`-th row and column,
    /// starting at (0, 0). A stride of 0 is treated as 1.
    pub fn sample_grid(&self, stride: u32) -> impl Iterator<Item = [u8; 3]> + '_ {
        let step = stride.max(1) as usize;
        (0..self.height)
            .step_by(step)
            .flat_map(move |y| (0..self.width).step_by(step).map(move |x| self.pixel(x, y)))
    }

    /// Encode as JPEG at the given quality (1–100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        {
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
            encoder.encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}
