use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use imageproc::edges::canny;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::OrientationOptions;
use crate::detection::analysis_gray;

/// Longest side of the copy used for orientation scoring
const ANALYSIS_SIZE: u32 = 512;

/// Lines within this many degrees of an axis count towards it
const AXIS_TOLERANCE_DEGREES: f64 = 15.0;

/// Clockwise rotation needed to bring content to a horizontal layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Trial order; earlier entries win ties
    pub const ALL: [Orientation; 4] = [
        Orientation::Deg0,
        Orientation::Deg90,
        Orientation::Deg180,
        Orientation::Deg270,
    ];

    pub fn degrees(self) -> u32 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Orientation::Deg0),
            90 => Some(Orientation::Deg90),
            180 => Some(Orientation::Deg180),
            270 => Some(Orientation::Deg270),
            _ => None,
        }
    }

    /// The rotation that undoes this one
    pub fn inverse(self) -> Self {
        match self {
            Orientation::Deg0 => Orientation::Deg0,
            Orientation::Deg90 => Orientation::Deg270,
            Orientation::Deg180 => Orientation::Deg180,
            Orientation::Deg270 => Orientation::Deg90,
        }
    }
}

/// Rotate clockwise by a multiple of 90 degrees, without resampling
pub fn rotate(image: &DynamicImage, orientation: Orientation) -> DynamicImage {
    match orientation {
        Orientation::Deg0 => image.clone(),
        Orientation::Deg90 => image.rotate90(),
        Orientation::Deg180 => image.rotate180(),
        Orientation::Deg270 => image.rotate270(),
    }
}

fn rotate_gray(gray: &GrayImage, orientation: Orientation) -> GrayImage {
    match orientation {
        Orientation::Deg0 => gray.clone(),
        Orientation::Deg90 => imageops::rotate90(gray),
        Orientation::Deg180 => imageops::rotate180(gray),
        Orientation::Deg270 => imageops::rotate270(gray),
    }
}

/// Determine the rotation that makes the content horizontal.
///
/// Clearly landscape content short-circuits to `Deg0`. Otherwise every
/// trial rotation is scored for horizontal structure and the first one
/// within `tie_tolerance` of the best score wins, so inconclusive images
/// are left alone.
#[instrument(skip_all, fields(width = image.width(), height = image.height()))]
pub fn detect_orientation(image: &DynamicImage, options: &OrientationOptions) -> Orientation {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Orientation::Deg0;
    }

    let aspect = width as f64 / height as f64;
    if aspect > options.horizontal_aspect {
        debug!(aspect, "Clearly horizontal, skipping line analysis");
        return Orientation::Deg0;
    }

    let gray = working_copy(&analysis_gray(image));
    let scores: Vec<(Orientation, f64)> = Orientation::ALL
        .iter()
        .map(|&o| (o, horizontal_score(&rotate_gray(&gray, o), options)))
        .collect();

    let chosen = choose_orientation(&scores, options.tie_tolerance);
    debug!(?scores, ?chosen, "Orientation scores");
    chosen
}

fn working_copy(gray: &GrayImage) -> GrayImage {
    let (width, height) = gray.dimensions();
    let longest = width.max(height);
    if longest <= ANALYSIS_SIZE {
        return gray.clone();
    }
    let scale = ANALYSIS_SIZE as f64 / longest as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    imageops::resize(gray, new_width, new_height, FilterType::Triangle)
}

/// First orientation whose score is within `tolerance` of the best
fn choose_orientation(scores: &[(Orientation, f64)], tolerance: f64) -> Orientation {
    let best = scores
        .iter()
        .map(|&(_, score)| score)
        .fold(f64::NEG_INFINITY, f64::max);
    if !best.is_finite() {
        return Orientation::Deg0;
    }

    scores
        .iter()
        .find(|&&(_, score)| score >= best - tolerance)
        .map(|&(orientation, _)| orientation)
        .unwrap_or_default()
}

/// Combined horizontal-minus-vertical structure score in roughly [-1, 1]
fn horizontal_score(gray: &GrayImage, options: &OrientationOptions) -> f64 {
    let edges = canny(gray, 50.0, 150.0);
    let lines = line_affinity(&edges, options.hough_vote_threshold);
    let structure = structure_affinity(&edges, options.structure_run_length);
    options.line_weight * lines + options.structure_weight * structure
}

/// Direction of a Hough line in degrees, normalized to -90..=90
fn line_direction_degrees(line: &PolarLine) -> f64 {
    // The Hough angle is that of the line's normal
    let mut degrees = line.angle_in_degrees as f64 - 90.0;

    while degrees > 90.0 {
        degrees -= 180.0;
    }
    while degrees < -90.0 {
        degrees += 180.0;
    }

    degrees
}

/// Count edge pixels lying on a Hough line
fn estimate_line_length(edges: &GrayImage, line: &PolarLine) -> f64 {
    let (width, height) = edges.dimensions();
    let theta = (line.angle_in_degrees as f64).to_radians();
    let r = line.r as f64;

    let cos_t = theta.cos();
    let sin_t = theta.sin();

    let mut count = 0;

    if sin_t.abs() > cos_t.abs() {
        // Mostly horizontal line, walk along x
        for x in 0..width {
            let y = ((r - x as f64 * cos_t) / sin_t).round() as i64;
            if y >= 0 && y < height as i64 && edges.get_pixel(x, y as u32)[0] > 0 {
                count += 1;
            }
        }
    } else {
        for y in 0..height {
            let x = ((r - y as f64 * sin_t) / cos_t).round() as i64;
            if x >= 0 && x < width as i64 && edges.get_pixel(x as u32, y)[0] > 0 {
                count += 1;
            }
        }
    }

    count as f64
}

/// Length-weighted share of horizontal lines minus share of vertical lines
fn line_affinity(edges: &GrayImage, vote_threshold: u32) -> f64 {
    let options = LineDetectionOptions {
        vote_threshold,
        suppression_radius: 8,
    };
    let lines = detect_lines(edges, options);

    let mut horizontal = 0.0;
    let mut vertical = 0.0;
    let mut total = 0.0;
    for line in &lines {
        let length = estimate_line_length(edges, line);
        let direction = line_direction_degrees(line).abs();
        if direction <= AXIS_TOLERANCE_DEGREES {
            horizontal += length;
        } else if direction >= 90.0 - AXIS_TOLERANCE_DEGREES {
            vertical += length;
        }
        total += length;
    }

    if total == 0.0 {
        return 0.0;
    }
    (horizontal - vertical) / total
}

/// Share of edge pixels on long horizontal runs minus share on long vertical runs.
///
/// Keeping only runs of at least `run_length` pixels is the same as a
/// morphological opening with a 1 x `run_length` line kernel.
fn structure_affinity(edges: &GrayImage, run_length: u32) -> f64 {
    let (width, height) = edges.dimensions();
    let is_edge = |x: u32, y: u32| edges.get_pixel(x, y)[0] > 0;

    let total = edges.pixels().filter(|p| p[0] > 0).count() as u64;
    if total == 0 {
        return 0.0;
    }

    let mut horizontal = 0u64;
    for y in 0..height {
        horizontal += long_run_pixels((0..width).map(|x| is_edge(x, y)), run_length);
    }

    let mut vertical = 0u64;
    for x in 0..width {
        vertical += long_run_pixels((0..height).map(|y| is_edge(x, y)), run_length);
    }

    (horizontal as f64 - vertical as f64) / total as f64
}

/// Number of set cells belonging to runs of at least `run_length`
fn long_run_pixels(cells: impl Iterator<Item = bool>, run_length: u32) -> u64 {
    let mut counted = 0u64;
    let mut run = 0u64;
    for set in cells {
        if set {
            run += 1;
        } else {
            if run >= run_length as u64 {
                counted += run;
            }
            run = 0;
        }
    }
    if run >= run_length as u64 {
        counted += run;
    }
    counted
}
