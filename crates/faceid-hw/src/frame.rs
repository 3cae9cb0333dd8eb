//! Frame type and pixel conversion: YUYV to RGB, dark-frame detection.

use image::RgbImage;

/// Luma below which a pixel counts as dark.
const DARK_LUMA: f32 = 32.0;

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an image, classifying it as dark or not.
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&image, 0.95);
        Self {
            image,
            sequence,
            timestamp: std::time::Instant::now(),
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0)).sum::<f32>() / pixels as f32
    }
}

/// BT.601 luma of an RGB pixel.
fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert packed YUYV 4:2:2 into RGB (BT.601, limited range).
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push(clamp_u8(c + 1.596 * v));
            rgb.push(clamp_u8(c - 0.392 * u - 0.813 * v));
            rgb.push(clamp_u8(c + 2.017 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// True if more than `threshold_pct` of the pixels are dark.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.pixels().len();
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p.0) < DARK_LUMA).count();
    (dark as f32 / total as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_grey_pixels() {
        // Neutral chroma: R = G = B
        let yuyv = vec![126, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let p0 = rgb.get_pixel(0, 0).0;
        assert_eq!(p0[0], p0[1]);
        assert_eq!(p0[1], p0[2]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_black_level() {
        let yuyv = vec![16, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_yuyv_red_dominates_with_high_v() {
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 200 && g < 60 && b < 60, "got ({r}, {g}, {b})");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_classification() {
        assert!(is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([0, 0, 0])), 0.95));
        assert!(!is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96 of 100 dark -> dark; 94 of 100 dark -> not dark
        let mostly_dark = RgbImage::from_fn(10, 10, |x, y| {
            if y * 10 + x < 96 { Rgb([5, 5, 5]) } else { Rgb([200, 200, 200]) }
        });
        assert!(is_dark_frame(&mostly_dark, 0.95));

        let borderline = RgbImage::from_fn(10, 10, |x, y| {
            if y * 10 + x < 94 { Rgb([5, 5, 5]) } else { Rgb([200, 200, 200]) }
        });
        assert!(!is_dark_frame(&borderline, 0.95));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])), 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
        assert!(!frame.is_dark);
    }
}
