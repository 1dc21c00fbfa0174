use clap::Parser;
use std::path::{Path, PathBuf};

use crate::config::{CropOptions, LevelIntensity, LevelMethod};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "check-crop")]
#[command(version, about = "Detect and crop the document region of scanned check images")]
pub struct Cli {
    /// Input image path, or a directory with --batch
    #[arg(required = true)]
    pub input: PathBuf,

    /// Output path [default: input_cropped.<ext>], or output directory with --batch
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Process every image in the input directory
    #[arg(long)]
    pub batch: bool,

    /// Write a JSON summary of the batch to this file [default: <output>/batch_summary.json]
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Load crop options from a JSON file; flags given here override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Even out uneven scan illumination before detection
    #[arg(long)]
    pub level_background: bool,

    /// Background leveling method
    #[arg(long, value_enum)]
    pub level_method: Option<LevelMethod>,

    /// Background leveling strength
    #[arg(long, value_enum)]
    pub level_intensity: Option<LevelIntensity>,

    /// Keep the cropped image in its scanned orientation
    #[arg(long)]
    pub no_auto_rotate: bool,

    /// Margin kept around the detected content, in pixels
    #[arg(short, long)]
    pub padding: Option<u32>,

    /// Smallest accepted fraction of the image removed by a crop
    #[arg(long, value_parser = parse_ratio)]
    pub min_area_ratio: Option<f64>,

    /// Largest accepted fraction of the image removed by a crop
    #[arg(long, value_parser = parse_ratio)]
    pub max_area_ratio: Option<f64>,

    /// Lower Canny hysteresis threshold
    #[arg(long)]
    pub canny_low: Option<f32>,

    /// Upper Canny hysteresis threshold
    #[arg(long)]
    pub canny_high: Option<f32>,

    /// Show detection details
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Output file for single-image mode
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| cropped_path(&self.input, self.input.parent().unwrap_or(Path::new("."))))
    }

    /// Output directory for batch mode
    pub fn output_dir(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input.join("cropped"))
    }

    /// Destination of the batch JSON summary
    pub fn summary_path(&self) -> PathBuf {
        self.summary
            .clone()
            .unwrap_or_else(|| self.output_dir().join("batch_summary.json"))
    }

    /// Build crop options from the config file, if any, then apply flags.
    pub fn crop_options(&self) -> Result<CropOptions> {
        let mut options = match &self.config {
            Some(path) => CropOptions::from_json_file(path)?,
            None => CropOptions::default(),
        };

        if self.level_background {
            options.level_background = true;
        }
        if let Some(method) = self.level_method {
            options.level_method = method;
        }
        if let Some(intensity) = self.level_intensity {
            options.level_intensity = intensity;
        }
        if self.no_auto_rotate {
            options.auto_rotate = false;
        }
        if let Some(padding) = self.padding {
            options.padding_px = padding;
        }
        if let Some(ratio) = self.min_area_ratio {
            options.min_area_ratio = ratio;
        }
        if let Some(ratio) = self.max_area_ratio {
            options.max_area_ratio = ratio;
        }
        if let Some(low) = self.canny_low {
            options.canny_threshold1 = low;
        }
        if let Some(high) = self.canny_high {
            options.canny_threshold2 = high;
        }

        options.validate()?;
        Ok(options)
    }
}

/// `<dir>/<stem>_cropped.<ext>`, keeping the input's extension
pub fn cropped_path(input: &Path, dir: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    dir.join(format!("{}_cropped.{}", stem, ext))
}

fn parse_ratio(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("Invalid ratio '{}', expected a number", s))?;

    if !(0.0..=1.0).contains(&value) {
        return Err(format!("Ratio must lie in [0, 1], got {}", value));
    }

    Ok(value)
}
