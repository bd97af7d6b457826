//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one JPEG per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Self::Mjpg),
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            _ => None,
        }
    }
}

/// An open, streaming V4L2 camera.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open a camera (e.g. "/dev/video0") at the requested resolution.
    ///
    /// MJPG is requested first; the driver may substitute YUYV or RGB3.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.raw_os_error() == Some(16) {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {} (need MJPG, YUYV or RGB3)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, CAPTURE_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Block until the next frame is ready and convert it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let image = match self.pixel_format {
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(data)?,
            PixelFormat::Yuyv => frame::yuyv_to_rgb(data, self.width, self.height)?,
            PixelFormat::Rgb3 => frame::rgb24_to_rgb(data, self.width, self.height)?,
        };

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}
