use image::DynamicImage;

use crate::error::{CropError, Result};
use crate::geometry::CropRect;

/// Cut `rect` out of `image` without resampling.
///
/// The rectangle must lie within the image; anything else is reported as a
/// degenerate result rather than silently clamped.
pub fn apply_crop(image: &DynamicImage, rect: CropRect) -> Result<DynamicImage> {
    if !rect.fits_within(image.width(), image.height()) {
        return Err(CropError::DegenerateResult {
            width: rect.width(),
            height: rect.height(),
        });
    }

    Ok(image.crop_imm(rect.x1, rect.y1, rect.width(), rect.height()))
}
