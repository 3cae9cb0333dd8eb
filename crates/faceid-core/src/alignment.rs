//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps five detected landmarks onto canonical positions and warps the RGB
//! frame into a square chip for descriptor extraction.

use image::{Rgb, RgbImage};

/// Canonical landmark positions for a 112×112 chip. Scaled for other sizes.
const CANONICAL_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Canonical landmark positions scaled to a `size`×`size` chip.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let s = size as f32 / 112.0;
    CANONICAL_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    const IDENTITY: Similarity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares estimate of the transform taking `src` onto `dst`.
    ///
    /// Each point pair contributes two rows to an overdetermined system in
    /// `[a, b, tx, ty]`, solved through its 4×4 normal equations.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut normal = [[0.0f32; 5]; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (row, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        normal[j][k] += row[j] * row[k];
                    }
                    normal[j][4] += row[j] * rhs;
                }
            }
        }

        match solve(normal) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    /// Map a point from output (chip) space back into frame space.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let dx = x - self.tx;
        let dy = y - self.ty;
        Some(((self.a * dx + self.b * dy) / det, (self.a * dy - self.b * dx) / det))
    }
}

/// Gaussian elimination with partial pivoting on an augmented 4×5 matrix.
#[allow(clippy::needless_range_loop)]
fn solve(mut m: [[f32; 5]; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-6 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of one pixel; outside the frame reads as black.
fn sample(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let at = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && py >= 0 && (px as u32) < frame.width() && (py as u32) < frame.height() {
            let p = frame.get_pixel(px as u32, py as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (at(x0, y0), at(x0 + 1, y0), at(x0, y0 + 1), at(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `frame` through `transform` into a `size`×`size` chip.
pub fn warp(frame: &RgbImage, transform: &Similarity, size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |ox, oy| {
        match transform.invert_point(ox as f32, oy as f32) {
            Some((sx, sy)) => sample(frame, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    })
}

/// Align a detected face to a canonical `size`×`size` chip.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &reference_landmarks(size));
    warp(frame, &transform, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_estimate() {
        let pts = reference_landmarks(150);
        let t = Similarity::estimate(&pts, &pts);
        assert!((t.a - 1.0).abs() < 1e-3, "a = {}", t.a);
        assert!(t.b.abs() < 1e-3, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-2, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-2, "ty = {}", t.ty);
    }

    #[test]
    fn test_half_scale_estimate() {
        let dst = reference_landmarks(112);
        let src = dst.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = Similarity::estimate(&src, &dst);
        assert!((t.a - 0.5).abs() < 0.01, "a = {}", t.a);
        assert!(t.b.abs() < 0.01, "b = {}", t.b);
    }

    #[test]
    fn test_degenerate_landmarks_fall_back_to_identity() {
        let src = [(10.0, 10.0); 5];
        let t = Similarity::estimate(&src, &reference_landmarks(150));
        // every source point identical: the system is singular
        assert_eq!(t, Similarity::IDENTITY);
    }

    #[test]
    fn test_reference_landmarks_scale() {
        let r = reference_landmarks(224);
        assert!((r[0].0 - 38.2946 * 2.0).abs() < 1e-3);
        assert!((r[4].1 - 92.2041 * 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_align_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([90, 120, 200]));
        let chip = align_face(&frame, &reference_landmarks(150), 150);
        assert_eq!(chip.dimensions(), (150, 150));
        // interior of a uniform frame stays uniform
        assert_eq!(chip.get_pixel(75, 75).0, [90, 120, 200]);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut frame = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // bright 5x5 patch on the left eye
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let chip = align_face(&frame, &src, 112);
        let (rx, ry) = reference_landmarks(112)[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);

        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| chip.get_pixel(x, y).0[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "expected bright patch near ({rx}, {ry}), max={brightest}");
    }
}
