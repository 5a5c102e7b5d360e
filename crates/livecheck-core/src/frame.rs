//! Camera frame abstraction and the analyzer's reusable pixel buffer.

use image::RgbaImage;
use thiserror::Error;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame has zero size ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("row stride {stride} is shorter than a {width}px RGBA row")]
    StrideTooSmall { stride: usize, width: u32 },
    #[error("pixel plane holds {actual} bytes, {expected} required")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("plane size overflows: stride {stride} x {height} rows")]
    PlaneOverflow { stride: usize, height: u32 },
    #[error("unsupported rotation: {0} degrees")]
    UnsupportedRotation(u32),
}

/// One frame delivered by the capture pipeline.
///
/// The plane is RGBA8888, rows `row_stride()` bytes apart. Frames are owned
/// by the analyzer for the duration of one call and released by dropping
/// them, so any resource behind an implementation should be freed in `Drop`.
pub trait CameraFrame {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Clockwise rotation that brings the sensor image upright.
    fn rotation_degrees(&self) -> u32;
    fn row_stride(&self) -> usize;
    fn pixels(&self) -> &[u8];
}

/// Heap-backed frame, used by the CLI replay path and by tests.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rotation_degrees: u32,
    pub row_stride: usize,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Tightly packed RGBA frame.
    pub fn new(width: u32, height: u32, rotation_degrees: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rotation_degrees,
            row_stride: width as usize * BYTES_PER_PIXEL,
            data,
        }
    }

    pub fn from_image(image: RgbaImage, rotation_degrees: u32) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, rotation_degrees, image.into_raw())
    }
}

impl CameraFrame for RawFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn rotation_degrees(&self) -> u32 {
        self.rotation_degrees
    }

    fn row_stride(&self) -> usize {
        self.row_stride
    }

    fn pixels(&self) -> &[u8] {
        &self.data
    }
}

/// Reusable RGBA buffer, allocated on the first frame and overwritten after.
///
/// A frame whose plane is malformed is rejected before any byte is copied,
/// so the previous contents survive a failed copy.
#[derive(Default)]
pub struct PixelBuffer {
    image: Option<RgbaImage>,
}

impl PixelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        self.image.as_ref()
    }

    /// Copy the frame's plane into the buffer, reallocating only when the
    /// frame dimensions differ from the cached buffer.
    pub fn copy_from<F: CameraFrame + ?Sized>(&mut self, frame: &F) -> Result<&RgbaImage, FrameError> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }

        let stride = frame.row_stride();
        let row_bytes = (width as usize)
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or(FrameError::PlaneOverflow { stride, height })?;
        if stride < row_bytes {
            return Err(FrameError::StrideTooSmall { stride, width });
        }

        let plane = frame.pixels();
        let expected = stride
            .checked_mul(height as usize - 1)
            .and_then(|n| n.checked_add(row_bytes))
            .ok_or(FrameError::PlaneOverflow { stride, height })?;
        if plane.len() < expected {
            return Err(FrameError::BufferTooSmall {
                expected,
                actual: plane.len(),
            });
        }

        match &self.image {
            Some(old) if old.dimensions() == (width, height) => {}
            Some(old) => {
                tracing::info!(
                    old_width = old.width(),
                    old_height = old.height(),
                    width,
                    height,
                    "frame size changed, reallocating pixel buffer"
                );
                self.image = None;
            }
            None => tracing::info!(width, height, "allocating pixel buffer"),
        }
        let image = self
            .image
            .get_or_insert_with(|| RgbaImage::new(width, height));

        for (row, dst) in image.chunks_exact_mut(row_bytes).enumerate() {
            let start = row * stride;
            dst.copy_from_slice(&plane[start..start + row_bytes]);
        }

        Ok(&*image)
    }
}
