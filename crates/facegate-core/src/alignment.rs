//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a similarity transform (scale, rotation, translation) from the five
//! detected landmarks to the InsightFace reference positions and resamples the
//! face into a 112×112 grayscale crop.

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// 2×3 similarity transform `[a, -b, tx, b, a, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit mapping `src` onto `dst`.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (sx, sy) = mean(src);
        let (dx, dy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(px, py), &(qx, qy)) in src.iter().zip(dst.iter()) {
            let (px, py) = (px - sx, py - sy);
            let (qx, qy) = (qx - dx, qy - dy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            norm += px * px + py * py;
        }

        if norm < 1e-12 {
            return Self { a: 1.0, b: 0.0, tx: dx - sx, ty: dy - sy };
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        }
    }

    /// Map an output coordinate back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (ux, uy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * ux + self.b * uy) / det,
            (-self.b * ux + self.a * uy) / det,
        ))
    }
}

fn sample_bilinear(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let pixel = |px: f32, py: f32| -> f32 {
        if px < 0.0 || py < 0.0 || px >= width as f32 || py >= height as f32 {
            return 0.0;
        }
        frame[py as usize * width + px as usize] as f32
    };

    pixel(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + pixel(x0 + 1.0, y0) * fx * (1.0 - fy)
        + pixel(x0, y0 + 1.0) * (1.0 - fx) * fy
        + pixel(x0 + 1.0, y0 + 1.0) * fx * fy
}

/// Align a detected face to a canonical 112×112 crop.
///
/// Pixels falling outside the source frame are black.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS);
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) else {
                return out;
            };
            out[oy * ALIGNED_SIZE + ox] =
                sample_bilinear(frame, w, h, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}
