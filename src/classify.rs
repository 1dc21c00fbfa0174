use std::fmt;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Scan resolutions tried when estimating DPI
pub const CANDIDATE_DPI: [u32; 5] = [150, 200, 300, 400, 600];

/// Confidence reported when no check type matches within tolerance
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Aspect ratio above which an unmatched check is treated as a wide check
const WIDE_ASPECT: f64 = 2.0;

/// Wide checks narrower than this are personal checks
const PERSONAL_MAX_WIDTH_INCHES: f64 = 7.0;

/// Reference check formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Personal,
    Business,
    Commercial,
}

/// Physical dimensions and matching tolerance of one check format
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckFormat {
    pub width_inches: f64,
    pub height_inches: f64,
    pub aspect_ratio: f64,
    pub tolerance: f64,
}

impl CheckKind {
    pub const ALL: [CheckKind; 3] = [CheckKind::Personal, CheckKind::Business, CheckKind::Commercial];

    pub fn format(self) -> CheckFormat {
        match self {
            CheckKind::Personal => CheckFormat {
                width_inches: 6.0,
                height_inches: 2.75,
                aspect_ratio: 2.18,
                tolerance: 0.3,
            },
            CheckKind::Business => CheckFormat {
                width_inches: 8.5,
                height_inches: 3.5,
                aspect_ratio: 2.43,
                tolerance: 0.3,
            },
            // Voucher style
            CheckKind::Commercial => CheckFormat {
                width_inches: 8.5,
                height_inches: 11.0,
                aspect_ratio: 0.77,
                tolerance: 0.4,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CheckKind::Personal => "personal",
            CheckKind::Business => "business",
            CheckKind::Commercial => "commercial",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Measured size of a check image
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dimensions {
    pub width_pixels: u32,
    pub height_pixels: u32,
    pub width_inches: f64,
    pub height_inches: f64,
    pub aspect_ratio: f64,
    pub estimated_dpi: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub kind: CheckKind,
    /// `1 - score` for a tolerance match, a fixed 0.5 for the aspect fallback
    pub confidence: f64,
    pub dimensions: Dimensions,
}

/// Guess the scan resolution by matching the pixel size against every
/// reference format at every candidate DPI
pub fn estimate_dpi(width: u32, height: u32) -> u32 {
    let mut best_dpi = 300;
    let mut min_error = f64::INFINITY;

    for kind in CheckKind::ALL {
        let format = kind.format();
        for dpi in CANDIDATE_DPI {
            let expected_width = format.width_inches * dpi as f64;
            let expected_height = format.height_inches * dpi as f64;
            let error = (width as f64 - expected_width).abs() / expected_width
                + (height as f64 - expected_height).abs() / expected_height;
            if error < min_error {
                min_error = error;
                best_dpi = dpi;
            }
        }
    }

    best_dpi
}

/// Label a cropped check image as personal, business or commercial
pub fn classify(image: &DynamicImage) -> Classification {
    classify_dimensions(image.width(), image.height())
}

pub fn classify_dimensions(width: u32, height: u32) -> Classification {
    let dpi = estimate_dpi(width, height);
    let width_inches = width as f64 / dpi as f64;
    let height_inches = height as f64 / dpi as f64;
    let aspect_ratio = if height_inches > 0.0 {
        width_inches / height_inches
    } else {
        0.0
    };

    let dimensions = Dimensions {
        width_pixels: width,
        height_pixels: height,
        width_inches,
        height_inches,
        aspect_ratio,
        estimated_dpi: dpi,
    };

    let mut best: Option<(CheckKind, f64)> = None;
    for kind in CheckKind::ALL {
        let format = kind.format();
        let score = (width_inches - format.width_inches).abs() / format.width_inches
            + (height_inches - format.height_inches).abs() / format.height_inches
            + (aspect_ratio - format.aspect_ratio).abs() / format.aspect_ratio;

        let improves = best.map_or(true, |(_, best_score)| score < best_score);
        if improves && score < format.tolerance {
            best = Some((kind, score));
        }
    }

    match best {
        Some((kind, score)) => Classification {
            kind,
            confidence: (1.0 - score).max(0.0),
            dimensions,
        },
        None => {
            let kind = if aspect_ratio > WIDE_ASPECT {
                if width_inches < PERSONAL_MAX_WIDTH_INCHES {
                    CheckKind::Personal
                } else {
                    CheckKind::Business
                }
            } else {
                CheckKind::Commercial
            };
            Classification {
                kind,
                confidence: FALLBACK_CONFIDENCE,
                dimensions,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_formats_at_300_dpi() {
        let personal = classify_dimensions(1800, 825);
        assert_eq!(personal.kind, CheckKind::Personal);
        assert_eq!(personal.dimensions.estimated_dpi, 300);
        assert!(personal.confidence > 0.95);

        let business = classify_dimensions(2550, 1050);
        assert_eq!(business.kind, CheckKind::Business);
        assert!(business.confidence > 0.95);

        let commercial = classify_dimensions(2550, 3300);
        assert_eq!(commercial.kind, CheckKind::Commercial);
        assert!(commercial.confidence > 0.95);
    }

    #[test]
    fn test_dpi_estimate() {
        assert_eq!(estimate_dpi(900, 413), 150);
        assert_eq!(estimate_dpi(3600, 1650), 600);
        assert_eq!(estimate_dpi(1700, 700), 200);
    }

    #[test]
    fn test_wide_fallback() {
        // Reads as 9" x 2" at 200 DPI, too elongated for any format
        let strip = classify_dimensions(1800, 400);
        assert_eq!(strip.dimensions.estimated_dpi, 200);
        assert_eq!(strip.kind, CheckKind::Business);
        assert_eq!(strip.confidence, 0.5);
    }

    #[test]
    fn test_square_falls_back_to_commercial() {
        let square = classify_dimensions(1000, 1000);
        assert_eq!(square.kind, CheckKind::Commercial);
        assert_eq!(square.confidence, 0.5);
    }

    #[test]
    fn test_classify_image() {
        let img = DynamicImage::new_rgb8(1200, 550);
        let result = classify(&img);
        assert_eq!(result.kind, CheckKind::Personal);
        assert_eq!(result.dimensions.estimated_dpi, 200);
    }
}
