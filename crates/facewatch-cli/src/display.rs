use facewatch_pipeline::FrameSink;
use image::RgbImage;
use minifb::{Key, Window, WindowOptions};

/// Live preview window. Closing it, Esc or `q` ends the session.
pub struct WindowSink {
    window: Window,
    buffer: Vec<u32>,
}

impl WindowSink {
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self, minifb::Error> {
        let window = Window::new(
            title,
            width as usize,
            height as usize,
            WindowOptions {
                resize: true,
                ..WindowOptions::default()
            },
        )?;
        Ok(Self {
            window,
            buffer: Vec::new(),
        })
    }
}

impl FrameSink for WindowSink {
    type Error = minifb::Error;

    fn present(&mut self, frame: &RgbImage) -> Result<bool, minifb::Error> {
        if !self.window.is_open() || self.window.is_key_down(Key::Escape) || self.window.is_key_down(Key::Q) {
            return Ok(false);
        }

        pack_rgb(frame, &mut self.buffer);
        self.window
            .update_with_buffer(&self.buffer, frame.width() as usize, frame.height() as usize)?;
        Ok(true)
    }
}

/// RGB8 to minifb's 0RGB u32 layout.
fn pack_rgb(frame: &RgbImage, out: &mut Vec<u32>) {
    out.clear();
    out.extend(
        frame
            .pixels()
            .map(|p| (u32::from(p[0]) << 16) | (u32::from(p[1]) << 8) | u32::from(p[2])),
    );
}
