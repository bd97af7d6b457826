//! facewatch-hw — camera capture.
//!
//! V4L2 streaming capture with conversion of MJPG, YUYV and RGB3 buffers
//! into RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
