use anyhow::Result;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::llm::media::encode_png;

pub const DEFAULT_UPSCALE_WIDTH: u32 = 3840;

/// Target size for a width-driven resample. The height is the exact
/// proportional value, truncated.
pub fn upscale_dimensions(width: u32, height: u32, target_width: u32) -> (u32, u32) {
    let width = width.max(1) as u64;
    let target_height = (height as u64 * target_width as u64) / width;
    (target_width, target_height.max(1) as u32)
}

pub fn upscale(image: &DynamicImage, target_width: u32) -> DynamicImage {
    let (width, height) = upscale_dimensions(image.width(), image.height(), target_width);
    image.resize_exact(width, height, FilterType::Lanczos3)
}

/// CPU-bound; callers run it on the blocking pool.
pub fn render_upscaled_png(image: &DynamicImage, target_width: u32) -> Result<Vec<u8>> {
    encode_png(&upscale(image, target_width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_aspect_ratio_exactly() {
        assert_eq!(upscale_dimensions(1000, 500, 3840), (3840, 1920));
        assert_eq!(upscale_dimensions(1024, 1536, 3840), (3840, 5760));
    }

    #[test]
    fn truncates_fractional_heights() {
        // 700 * 3840 / 1000 = 2688; 333 * 3840 / 1000 = 1278.72
        assert_eq!(upscale_dimensions(1000, 700, 3840), (3840, 2688));
        assert_eq!(upscale_dimensions(1000, 333, 3840), (3840, 1278));
    }

    #[test]
    fn upscales_a_wide_result_to_4k() {
        let source = DynamicImage::new_rgb8(1000, 500);
        let upscaled = upscale(&source, DEFAULT_UPSCALE_WIDTH);
        assert_eq!((upscaled.width(), upscaled.height()), (3840, 1920));
    }

    #[test]
    fn resamples_to_target_size() {
        let source = DynamicImage::new_rgb8(100, 50);
        let upscaled = upscale(&source, 384);
        assert_eq!((upscaled.width(), upscaled.height()), (384, 192));
    }
}
