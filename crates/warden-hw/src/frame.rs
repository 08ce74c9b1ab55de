//! Raw capture buffer → RGB conversion.

use image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601, limited range).
///
/// Every 4 bytes `[Y0, U, Y1, V]` describe two horizontally adjacent pixels
/// sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Expand 8-bit grayscale to RGB by replicating the luma channel.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = width as usize * height as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: grey.len() });
    }
    let rgb = grey[..expected].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: grey.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1: black and white with neutral chroma.
        let img = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_dominant() {
        // High Cr pushes red up, green down.
        let img = yuyv_to_rgb(&[82, 90, 82, 240], 2, 1).unwrap();
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r > 200, "r={r}");
        assert!(g < 40, "g={g}");
        assert!(b < 40, "b={b}");
    }

    #[test]
    fn test_yuyv_short_buffer() {
        assert!(matches!(
            yuyv_to_rgb(&[0, 0], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_replicates_channels() {
        let img = grey_to_rgb(&[7, 200, 33, 90], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [200, 200, 200]);
        assert_eq!(img.get_pixel(0, 1).0, [33, 33, 33]);
    }

    #[test]
    fn test_grey_short_buffer() {
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }
}
