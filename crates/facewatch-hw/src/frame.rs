//! Frame type and pixel-format conversion to RGB.

use image::{ImageFormat, RgbImage};

/// A captured camera frame, converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601, studio range).
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Decode one MJPG buffer.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8())
}

/// Wrap a packed RGB24 buffer.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 3;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    RgbImage::from_raw(width, height, buf[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })
}
