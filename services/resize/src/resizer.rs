//! The image transform itself: decode, scale to a fixed width, re-encode.

use image::imageops::FilterType;
use image::{GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use thiserror::Error;

/// Errors from the image transform
#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(image::ImageError),
}

/// Resize encoded image bytes to the target width, preserving the aspect
/// ratio, and re-encode as PNG. Input format is sniffed from the bytes.
pub fn resize_to_width(bytes: &[u8], target_width: u32) -> Result<Vec<u8>, ResizeError> {
    let image = image::load_from_memory(bytes).map_err(ResizeError::Decode)?;

    let target_height = scaled_height(image.width(), image.height(), target_width);
    let resized = image.resize_exact(target_width, target_height, FilterType::Lanczos3);

    let mut out = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .map_err(ResizeError::Encode)?;
    Ok(out)
}

/// Height matching the target width at the source aspect ratio, never
/// below one pixel
fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return 1;
    }
    let scaled = (height as u64 * target_width as u64 + (width as u64 / 2)) / width as u64;
    (scaled as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn encoded_image(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([120, 40, 200, 255]),
        ));
        let mut out = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_scaled_height_preserves_aspect() {
        assert_eq!(scaled_height(1000, 500, 500), 250);
        assert_eq!(scaled_height(400, 400, 500), 500);
        assert_eq!(scaled_height(2000, 1, 500), 1);
        assert_eq!(scaled_height(0, 100, 500), 1);
    }

    #[test]
    fn test_resize_downscales_to_target_width() {
        let bytes = encoded_image(64, 32);
        let resized = resize_to_width(&bytes, 16).unwrap();

        let decoded = image::load_from_memory(&resized).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_resize_upscales_small_images() {
        let bytes = encoded_image(8, 8);
        let resized = resize_to_width(&bytes, 16).unwrap();

        let decoded = image::load_from_memory(&resized).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn test_resize_rejects_garbage() {
        assert!(matches!(
            resize_to_width(b"not an image", 16),
            Err(ResizeError::Decode(_))
        ));
    }
}
