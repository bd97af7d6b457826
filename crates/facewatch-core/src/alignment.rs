//! Five-point face alignment to the canonical ArcFace 112×112 crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit over point pairs (closed form on centred coordinates).
    ///
    /// Degenerate input (all source points coincident) yields the identity.
    pub fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut var = 0.0f32;
        let mut cos_term = 0.0f32;
        let mut sin_term = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - smx, s.1 - smy);
            let (dx, dy) = (d.0 - dmx, d.1 - dmy);
            var += sx * sx + sy * sy;
            cos_term += sx * dx + sy * dy;
            sin_term += sx * dy - sy * dx;
        }

        if var < 1e-12 {
            return Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        }

        let a = cos_term / var;
        let b = sin_term / var;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map a destination point back into source coordinates.
    fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Warp the face described by `landmarks` into a 112×112 crop.
///
/// Bilinear sampling; pixels mapped outside the source are black.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS);
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        if let Some((sx, sy)) = transform.invert((ox as f32, oy as f32)) {
            *pixel = sample_bilinear(image, sx, sy);
        }
    }

    out
}

/// Square crop of side `side` centred on `center`, resampled to `out_size`.
pub fn crop_centered(image: &RgbImage, center: (f32, f32), side: f32, out_size: u32) -> RgbImage {
    let scale = out_size as f32 / side.max(1.0);
    let half = out_size as f32 / 2.0;
    let transform = Similarity {
        a: scale,
        b: 0.0,
        tx: half - scale * center.0,
        ty: half - scale * center.1,
    };

    let mut out = RgbImage::new(out_size, out_size);
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        if let Some((sx, sy)) = transform.invert((ox as f32, oy as f32)) {
            *pixel = sample_bilinear(image, sx, sy);
        }
    }
    out
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let fetch = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let p = image.get_pixel(px as u32, py as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut rgb = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        rgb[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(rgb)
}
