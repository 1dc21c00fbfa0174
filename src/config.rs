use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{CropError, Result};

/// Background leveling algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LevelMethod {
    /// Large-kernel grayscale closing, subtracted out
    #[default]
    Morphological,
    /// Large-radius blur, divided out
    Gaussian,
    /// Least-squares polynomial surface, divided out
    Polynomial,
    /// Pick one of the above from the image statistics
    Auto,
}

/// How aggressively the leveler flattens the background
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LevelIntensity {
    #[default]
    Gentle,
    Medium,
    Strong,
}

/// Tuning for the orientation detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationOptions {
    /// Width/height ratio above which content is taken as already horizontal
    pub horizontal_aspect: f64,
    /// Weight of the Hough line analysis in the combined score
    pub line_weight: f64,
    /// Weight of the run-length structure analysis in the combined score
    pub structure_weight: f64,
    /// Minimum length of an edge run counted as a line structure
    pub structure_run_length: u32,
    /// Hough accumulator votes needed to report a line
    pub hough_vote_threshold: u32,
    /// Scores within this distance of the best are treated as tied
    pub tie_tolerance: f64,
}

impl Default for OrientationOptions {
    fn default() -> Self {
        Self {
            horizontal_aspect: 1.2,
            line_weight: 0.4,
            structure_weight: 0.6,
            structure_run_length: 40,
            hough_vote_threshold: 100,
            tie_tolerance: 0.05,
        }
    }
}

/// Options threaded through every stage of a single `detect_and_crop` call.
///
/// The defaults are empirically tuned constants; the ratio band and the
/// detector priority order are kept as-is rather than re-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropOptions {
    pub auto_rotate: bool,
    pub level_background: bool,
    pub level_method: LevelMethod,
    pub level_intensity: LevelIntensity,
    /// Safety margin added around the detected content, in pixels
    pub padding_px: u32,
    /// Smallest accepted fraction of the image area removed by a crop
    pub min_area_ratio: f64,
    /// Largest accepted fraction of the image area removed by a crop
    pub max_area_ratio: f64,
    /// Minimum width and height of an accepted crop
    pub min_dimension_px: u32,
    pub canny_threshold1: f32,
    pub canny_threshold2: f32,
    /// Components whose bounding box covers less than this fraction of the
    /// image are ignored by the detectors
    pub min_component_ratio: f64,
    /// Side length of the tiles used by the edge-density detector
    pub edge_tile_size: u32,
    /// A tile is content when its edge density exceeds this multiple of the
    /// global density
    pub edge_density_factor: f64,
    /// Fraction below the global mean at which a row or column counts as
    /// content for the brightness detector
    pub brightness_deviation: f64,
    pub orientation: OrientationOptions,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            auto_rotate: true,
            level_background: false,
            level_method: LevelMethod::Morphological,
            level_intensity: LevelIntensity::Gentle,
            padding_px: 10,
            min_area_ratio: 0.10,
            max_area_ratio: 0.80,
            min_dimension_px: 20,
            canny_threshold1: 50.0,
            canny_threshold2: 150.0,
            min_component_ratio: 0.01,
            edge_tile_size: 16,
            edge_density_factor: 1.0,
            brightness_deviation: 0.05,
            orientation: OrientationOptions::default(),
        }
    }
}

impl OrientationOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CropError::InvalidOptions(msg));
        if !(self.horizontal_aspect.is_finite() && self.horizontal_aspect > 0.0) {
            return invalid(format!(
                "horizontal_aspect must be a positive number, got {}",
                self.horizontal_aspect
            ));
        }
        let weight_ok = |w: f64| w.is_finite() && w >= 0.0;
        if !weight_ok(self.line_weight) || !weight_ok(self.structure_weight) {
            return invalid(format!(
                "orientation weights must be non-negative, got {}/{}",
                self.line_weight, self.structure_weight
            ));
        }
        if self.line_weight + self.structure_weight <= 0.0 {
            return invalid("at least one orientation weight must be positive".to_string());
        }
        if !(self.tie_tolerance.is_finite() && self.tie_tolerance >= 0.0) {
            return invalid(format!(
                "tie_tolerance must be non-negative, got {}",
                self.tie_tolerance
            ));
        }
        if self.hough_vote_threshold == 0 || self.structure_run_length == 0 {
            return invalid(
                "hough_vote_threshold and structure_run_length must be > 0".to_string(),
            );
        }
        Ok(())
    }
}

impl CropOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&text)
            .map_err(|e| CropError::InvalidOptions(format!("{}: {}", path.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.min_area_ratio) || !in_unit(self.max_area_ratio) {
            return Err(CropError::InvalidOptions(format!(
                "area ratios must lie in [0, 1], got {}..{}",
                self.min_area_ratio, self.max_area_ratio
            )));
        }
        if self.min_area_ratio > self.max_area_ratio {
            return Err(CropError::InvalidOptions(format!(
                "min_area_ratio {} exceeds max_area_ratio {}",
                self.min_area_ratio, self.max_area_ratio
            )));
        }
        // Negated comparisons so NaN is rejected too
        if !(self.canny_threshold1 > 0.0 && self.canny_threshold1 <= self.canny_threshold2)
            || !self.canny_threshold2.is_finite()
        {
            return Err(CropError::InvalidOptions(format!(
                "canny thresholds must satisfy 0 < low <= high, got {}/{}",
                self.canny_threshold1, self.canny_threshold2
            )));
        }
        if !in_unit(self.min_component_ratio) || !in_unit(self.brightness_deviation) {
            return Err(CropError::InvalidOptions(
                "min_component_ratio and brightness_deviation must lie in [0, 1]".to_string(),
            ));
        }
        if self.edge_tile_size == 0 {
            return Err(CropError::InvalidOptions("edge_tile_size must be > 0".to_string()));
        }
        if !(self.edge_density_factor.is_finite() && self.edge_density_factor > 0.0) {
            return Err(CropError::InvalidOptions(format!(
                "edge_density_factor must be a positive number, got {}",
                self.edge_density_factor
            )));
        }
        self.orientation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = CropOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.min_area_ratio, 0.10);
        assert_eq!(options.max_area_ratio, 0.80);
    }

    #[test]
    fn test_inverted_band_rejected() {
        let options = CropOptions {
            min_area_ratio: 0.9,
            max_area_ratio: 0.2,
            ..CropOptions::default()
        };
        assert!(matches!(options.validate(), Err(CropError::InvalidOptions(_))));
    }

    #[test]
    fn test_inverted_canny_rejected() {
        let options = CropOptions {
            canny_threshold1: 200.0,
            canny_threshold2: 100.0,
            ..CropOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_non_finite_and_negative_values_rejected() {
        let nan_canny = CropOptions {
            canny_threshold1: f32::NAN,
            ..CropOptions::default()
        };
        assert!(matches!(nan_canny.validate(), Err(CropError::InvalidOptions(_))));

        let infinite_canny = CropOptions {
            canny_threshold2: f32::INFINITY,
            ..CropOptions::default()
        };
        assert!(infinite_canny.validate().is_err());

        let negative_density = CropOptions {
            edge_density_factor: -1.0,
            ..CropOptions::default()
        };
        assert!(negative_density.validate().is_err());

        let nan_ratio = CropOptions {
            min_area_ratio: f64::NAN,
            ..CropOptions::default()
        };
        assert!(nan_ratio.validate().is_err());
    }

    #[test]
    fn test_orientation_options_checked() {
        assert!(OrientationOptions::default().validate().is_ok());

        let cases = [
            OrientationOptions {
                hough_vote_threshold: 0,
                ..OrientationOptions::default()
            },
            OrientationOptions {
                line_weight: -0.4,
                ..OrientationOptions::default()
            },
            OrientationOptions {
                line_weight: 0.0,
                structure_weight: 0.0,
                ..OrientationOptions::default()
            },
            OrientationOptions {
                tie_tolerance: f64::NAN,
                ..OrientationOptions::default()
            },
            OrientationOptions {
                horizontal_aspect: 0.0,
                ..OrientationOptions::default()
            },
        ];
        for orientation in cases {
            let options = CropOptions {
                orientation,
                ..CropOptions::default()
            };
            assert!(matches!(options.validate(), Err(CropError::InvalidOptions(_))));
        }
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let result = CropOptions::from_json_file(std::path::Path::new("/nonexistent/options.json"));
        assert!(matches!(result, Err(CropError::Io(_))));
    }

    #[test]
    fn test_config_file_parsing() {
        let dir = std::env::temp_dir().join(format!("check-crop-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let malformed = dir.join("malformed.json");
        std::fs::write(&malformed, r#"{"padding_px": "#).unwrap();
        assert!(matches!(
            CropOptions::from_json_file(&malformed),
            Err(CropError::InvalidOptions(_))
        ));

        let out_of_range = dir.join("out_of_range.json");
        std::fs::write(&out_of_range, r#"{"min_area_ratio": 0.9, "max_area_ratio": 0.1}"#).unwrap();
        assert!(matches!(
            CropOptions::from_json_file(&out_of_range),
            Err(CropError::InvalidOptions(_))
        ));

        let partial = dir.join("partial.json");
        std::fs::write(&partial, r#"{"padding_px": 4, "auto_rotate": false}"#).unwrap();
        let options = CropOptions::from_json_file(&partial).unwrap();
        assert_eq!(options.padding_px, 4);
        assert!(!options.auto_rotate);
        assert_eq!(options.min_area_ratio, 0.10);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: CropOptions =
            serde_json::from_str(r#"{"padding_px": 25, "level_method": "polynomial"}"#).unwrap();
        assert_eq!(options.padding_px, 25);
        assert_eq!(options.level_method, LevelMethod::Polynomial);
        assert_eq!(options.canny_threshold2, 150.0);
        assert_eq!(options.orientation, OrientationOptions::default());
    }
}
