//! Overlay of cached match results onto display frames.

use crate::cache::MatchSnapshot;
use ab_glyph::{FontVec, PxScale};
use facewatch_core::{BoundingBox, Identity, MatchResult};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
];

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to read font {path}: {source}")]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("not a usable font file: {0}")]
    FontInvalid(PathBuf),
}

/// Parse `"#RRGGBB"` (leading `#` optional).
pub fn parse_color(s: &str) -> Option<Rgb<u8>> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(Rgb([channel(0)?, channel(2)?, channel(4)?]))
}

/// Colours for overlay boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub known: Rgb<u8>,
    pub unknown: Rgb<u8>,
    /// Overrides `known` for specific labels.
    pub labels: HashMap<String, Rgb<u8>>,
    /// Box outline width in pixels.
    pub thickness: u32,
    pub font_size: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            known: Rgb([0, 255, 0]),
            unknown: Rgb([255, 0, 0]),
            labels: HashMap::new(),
            thickness: 2,
            font_size: 18.0,
        }
    }
}

impl OverlayStyle {
    pub fn color_for(&self, identity: &Identity) -> Rgb<u8> {
        match identity {
            Identity::Known(label) => self.labels.get(label).copied().unwrap_or(self.known),
            Identity::Unknown => self.unknown,
        }
    }
}

/// One box ready to draw, in display coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayBox {
    pub rect: BoundingBox,
    pub caption: String,
    pub color: Rgb<u8>,
}

/// `"<label> (<similarity>)"`, with `" (Age: N)"` appended when known.
pub fn caption(result: &MatchResult) -> String {
    let mut text = format!("{} ({:.2})", result.identity.label(), result.similarity);
    if let Some(age) = result.age {
        text.push_str(&format!(" (Age: {age:.0})"));
    }
    text
}

pub struct Overlay {
    style: OverlayStyle,
    font: Option<FontVec>,
}

impl Overlay {
    pub fn new(style: OverlayStyle, font: Option<FontVec>) -> Self {
        Self { style, font }
    }

    /// Boxes for `snapshot`, rescaled by its recorded factors and clamped to
    /// a `frame_w` x `frame_h` frame. No snapshot means no boxes.
    pub fn layout(
        snapshot: Option<&MatchSnapshot>,
        frame_w: u32,
        frame_h: u32,
        style: &OverlayStyle,
    ) -> Vec<OverlayBox> {
        let Some(snapshot) = snapshot else {
            return Vec::new();
        };
        let (fw, fh) = (frame_w as f32, frame_h as f32);

        snapshot
            .results
            .iter()
            .filter_map(|result| {
                let [x0, y0, x1, y1] = result.bbox.scaled(snapshot.scale.x, snapshot.scale.y).corners();
                let (x0, x1) = (x0.clamp(0.0, fw), x1.clamp(0.0, fw));
                let (y0, y1) = (y0.clamp(0.0, fh), y1.clamp(0.0, fh));
                if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
                    return None;
                }
                Some(OverlayBox {
                    rect: BoundingBox::from_corners(x0, y0, x1, y1),
                    caption: caption(result),
                    color: style.color_for(&result.identity),
                })
            })
            .collect()
    }

    /// Draw outlines, and captions when a font is loaded.
    pub fn draw(&self, image: &mut RgbImage, boxes: &[OverlayBox]) {
        for b in boxes {
            let (x, y) = (b.rect.x.round() as i32, b.rect.y.round() as i32);
            let (w, h) = (b.rect.width.round().max(1.0) as u32, b.rect.height.round().max(1.0) as u32);

            for inset in 0..self.style.thickness.min(w / 2).min(h / 2).max(1) {
                let rect = Rect::at(x + inset as i32, y + inset as i32)
                    .of_size(w - 2 * inset, h - 2 * inset);
                draw_hollow_rect_mut(image, rect, b.color);
            }

            if let Some(font) = &self.font {
                let size = self.style.font_size;
                // Above the box, or inside it at the top edge.
                let text_y = if y as f32 >= size + 2.0 { y - size as i32 - 2 } else { y + 2 };
                draw_text_mut(image, b.color, x, text_y, PxScale::from(size), font, &b.caption);
            }
        }
    }

    /// Lay out and draw `snapshot` onto `image`.
    pub fn render(&self, image: &mut RgbImage, snapshot: Option<&MatchSnapshot>) {
        let boxes = Self::layout(snapshot, image.width(), image.height(), &self.style);
        self.draw(image, &boxes);
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }
}

pub fn load_font(path: &Path) -> Result<FontVec, OverlayError> {
    let data = std::fs::read(path).map_err(|source| OverlayError::FontRead {
        path: path.to_path_buf(),
        source,
    })?;
    FontVec::try_from_vec(data).map_err(|_| OverlayError::FontInvalid(path.to_path_buf()))
}

/// First usable font among common system locations.
pub fn find_system_font() -> Option<FontVec> {
    FONT_CANDIDATES
        .iter()
        .map(Path::new)
        .filter(|p| p.exists())
        .find_map(|p| match load_font(p) {
            Ok(font) => {
                tracing::debug!(path = %p.display(), "loaded caption font");
                Some(font)
            }
            Err(e) => {
                tracing::debug!(error = %e, "skipping font");
                None
            }
        })
}
