//! Output size guard and persistence.

use crate::core::error::{EngineError, EngineResult};
use crate::core::types::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Dimensions before and after a ceiling downscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResize {
    /// Original width and height.
    pub from: (u32, u32),
    /// Scaled width and height.
    pub to: (u32, u32),
}

/// Dimensions that keep `width * height` at or below `ceiling`.
///
/// Returns `None` when no scaling is needed.
pub fn ceiling_dimensions(width: u32, height: u32, ceiling: u64) -> Option<(u32, u32)> {
    let pixels = width as u64 * height as u64;
    if pixels <= ceiling || ceiling == 0 {
        return None;
    }
    let scale = (ceiling as f64 / pixels as f64).sqrt();
    let mut w = ((width as f64 * scale).floor() as u32).max(1);
    let mut h = ((height as f64 * scale).floor() as u32).max(1);
    // floating point can land one row above the ceiling
    while w as u64 * h as u64 > ceiling && (w > 1 || h > 1) {
        if w >= h {
            w -= 1;
        } else {
            h -= 1;
        }
    }
    Some((w, h))
}

/// Downscale `image` so it fits below `ceiling` pixels, preserving aspect ratio.
pub fn fit_to_ceiling(image: RgbaImage, ceiling: u64) -> (RgbaImage, Option<OutputResize>) {
    let (width, height) = image.dimensions();
    match ceiling_dimensions(width, height, ceiling) {
        Some((w, h)) => {
            info!(
                "Output {}x{} exceeds {} px, downscaling to {}x{}",
                width, height, ceiling, w, h
            );
            let resized = image::imageops::resize(&image, w, h, FilterType::Triangle);
            (
                resized,
                Some(OutputResize {
                    from: (width, height),
                    to: (w, h),
                }),
            )
        }
        None => (image, None),
    }
}

/// Save an output image, using `quality` for JPEG targets.
///
/// JPEG has no alpha channel, so alpha is dropped for those targets.
pub fn write_output(image: &RgbaImage, path: &Path, quality: u8) -> EngineResult<()> {
    let format = ImageFormat::from_path(path);
    debug!("Writing {:?} output to {}", format, path.display());
    match format {
        ImageFormat::Jpeg => {
            let file = File::create(path)?;
            let mut writer = BufWriter::new(file);
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)?;
            Ok(())
        }
        other => {
            let target = other.to_image_format().ok_or_else(|| {
                EngineError::InvalidInput(format!("unsupported output format: {}", path.display()))
            })?;
            image.save_with_format(path, target)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_ceiling_untouched() {
        assert_eq!(ceiling_dimensions(100, 100, 10_000), None);
        let (img, resize) = fit_to_ceiling(RgbaImage::new(10, 10), 1000);
        assert!(resize.is_none());
        assert_eq!(img.dimensions(), (10, 10));
    }

    #[test]
    fn test_downscale_preserves_aspect() {
        let (w, h) = ceiling_dimensions(4000, 2000, 2_000_000).unwrap();
        assert!(w as u64 * h as u64 <= 2_000_000);
        assert_eq!((w, h), (2000, 1000));
    }

    #[test]
    fn test_fit_reports_resize() {
        let (img, resize) = fit_to_ceiling(RgbaImage::new(40, 30), 300);
        let resize = resize.unwrap();
        assert_eq!(resize.from, (40, 30));
        assert_eq!(img.dimensions(), resize.to);
        assert!(img.width() as u64 * img.height() as u64 <= 300);
    }

    #[test]
    fn test_write_jpeg_and_png() {
        let dir = tempfile::tempdir().unwrap();
        let img = RgbaImage::from_pixel(8, 8, image::Rgba([200, 100, 50, 255]));
        let jpg = dir.path().join("out.jpg");
        write_output(&img, &jpg, 95).unwrap();
        let back = image::open(&jpg).unwrap().to_rgba8();
        assert_eq!(back.dimensions(), (8, 8));
        assert!((back.get_pixel(3, 3)[0] as i32 - 200).abs() < 8);

        let png = dir.path().join("out.png");
        write_output(&img, &png, 90).unwrap();
        assert_eq!(image::open(&png).unwrap().to_rgba8(), img);
    }
}
