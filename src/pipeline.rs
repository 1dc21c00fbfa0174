use std::path::Path;

use image::{DynamicImage, ImageError, ImageReader};
use tracing::{debug, info, instrument};

use crate::config::{CropOptions, LevelMethod};
use crate::detection::{analysis_gray, detections, DetectorMethod};
use crate::error::{CropError, Result};
use crate::geometry::CropRect;
use crate::leveling::{level_background, select_method};
use crate::orientation::{detect_orientation, rotate, Orientation};
use crate::selection::{select_candidate, Attempt};
use crate::stats::ImageStats;
use crate::transform::apply_crop;

/// Outcome of a successful `detect_and_crop` call
#[derive(Debug, Clone)]
pub struct CropResult {
    /// Cropped (and possibly rotated) image
    pub image: DynamicImage,
    /// Padded crop rectangle in source coordinates
    pub rect: CropRect,
    /// Detector whose candidate was accepted
    pub method: DetectorMethod,
    /// Fraction of the source area removed, measured before padding
    pub area_reduction: f64,
    /// Rotation applied after cropping
    pub orientation: Orientation,
    /// Statistics of the source image, before leveling
    pub stats: ImageStats,
    /// Every detector tried, ending with the accepted one
    pub attempts: Vec<Attempt>,
}

/// Find the content region of a scanned document, crop to it and
/// optionally rotate the result upright.
#[instrument(skip_all, fields(width = image.width(), height = image.height()))]
pub fn detect_and_crop(image: &DynamicImage, options: &CropOptions) -> Result<CropResult> {
    options.validate()?;

    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(CropError::DegenerateResult { width, height });
    }

    let gray = analysis_gray(image);
    let stats = ImageStats::compute(&gray);
    debug!(
        mean = stats.mean,
        std_dev = stats.std_dev,
        min = stats.min,
        max = stats.max,
        "Image statistics"
    );

    let leveled = options.level_background.then(|| {
        let method = match options.level_method {
            LevelMethod::Auto => select_method(&stats),
            method => method,
        };
        level_background(image, method, options.level_intensity)
    });

    // The leveled image is a different picture and gets its own statistics
    let selection = match &leveled {
        Some(leveled) => {
            drop(gray);
            let leveled_gray = analysis_gray(leveled);
            let leveled_stats = ImageStats::compute(&leveled_gray);
            select_candidate(
                detections(&leveled_gray, &leveled_stats, options),
                width,
                height,
                options,
            )?
        }
        None => {
            let selection =
                select_candidate(detections(&gray, &stats, options), width, height, options)?;
            drop(gray);
            selection
        }
    };
    let source = leveled.as_ref().unwrap_or(image);
    let candidate = selection.candidate;

    let rect = candidate
        .rect
        .pad(options.padding_px, width, height)
        .ok_or(CropError::DegenerateResult { width, height })?;
    debug!(?rect, padding = options.padding_px, "Padded crop rectangle");

    let cropped = apply_crop(source, rect)?;
    drop(leveled);

    let orientation = if options.auto_rotate {
        detect_orientation(&cropped, &options.orientation)
    } else {
        Orientation::Deg0
    };
    let image = match orientation {
        Orientation::Deg0 => cropped,
        _ => rotate(&cropped, orientation),
    };

    info!(
        method = %candidate.method,
        area_reduction = candidate.area_reduction,
        degrees = orientation.degrees(),
        output_width = image.width(),
        output_height = image.height(),
        "Cropped document"
    );

    Ok(CropResult {
        image,
        rect,
        method: candidate.method,
        area_reduction: candidate.area_reduction,
        orientation,
        stats,
        attempts: selection.attempts,
    })
}

/// Open and decode an image file
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let load_err = |source: ImageError| CropError::Load {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| load_err(ImageError::IoError(e)))?
        .decode()
        .map_err(load_err)
}

/// Encode an image, format chosen from the file extension
pub fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    image.save(path).map_err(|source| CropError::Save {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn document(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> DynamicImage {
        let (x1, y1, x2, y2) = rect;
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            if x >= x1 && x < x2 && y >= y1 && y < y2 {
                Luma([60])
            } else {
                Luma([220])
            }
        }))
    }

    #[test]
    fn test_crop_includes_padding() {
        let img = document(400, 300, (100, 75, 300, 225));
        let options = CropOptions {
            auto_rotate: false,
            ..CropOptions::default()
        };
        let result = detect_and_crop(&img, &options).unwrap();

        assert!(result.rect.x1 <= 100 && result.rect.x1 >= 85);
        assert!(result.rect.y1 <= 75 && result.rect.y1 >= 60);
        assert!(result.rect.x2 >= 300 && result.rect.x2 <= 315);
        assert!(result.rect.y2 >= 225 && result.rect.y2 <= 240);
        assert_eq!(result.image.width(), result.rect.width());
        assert_eq!(result.image.height(), result.rect.height());
        assert_eq!(result.orientation, Orientation::Deg0);
        assert_eq!(result.attempts.last().map(|a| a.method), Some(result.method));
    }

    #[test]
    fn test_zero_area_is_degenerate() {
        let img = DynamicImage::new_luma8(0, 10);
        assert!(matches!(
            detect_and_crop(&img, &CropOptions::default()),
            Err(CropError::DegenerateResult { width: 0, height: 10 })
        ));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let img = document(100, 100, (25, 25, 75, 75));
        let options = CropOptions {
            min_area_ratio: 0.9,
            max_area_ratio: 0.1,
            ..CropOptions::default()
        };
        assert!(matches!(
            detect_and_crop(&img, &options),
            Err(CropError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_input_not_modified() {
        let img = document(400, 300, (100, 75, 300, 225));
        let before = img.clone();
        let _ = detect_and_crop(&img, &CropOptions::default());
        assert_eq!(img, before);
    }

    #[test]
    fn test_single_pixel_has_no_boundary() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([10])));
        let options = CropOptions {
            level_background: true,
            ..CropOptions::default()
        };
        assert!(matches!(
            detect_and_crop(&img, &options),
            Err(CropError::NoValidBoundary { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_image(Path::new("/nonexistent/scan.png")).unwrap_err();
        assert!(matches!(err, CropError::Load { .. }));
    }
}
