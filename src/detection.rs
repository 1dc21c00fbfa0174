use std::fmt;

use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::sobel_gradients;
use imageproc::morphology;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CropOptions;
use crate::geometry::{BoundsAccumulator, CropRect};
use crate::stats::ImageStats;

/// Canny threshold pairs tried after the configured one, faint edges first
const CANNY_LADDER: [(f32, f32); 3] = [(30.0, 100.0), (100.0, 200.0), (20.0, 60.0)];

/// (block radius, offset) pairs for local-mean binarization
const ADAPTIVE_LADDER: [(u32, i32); 3] = [(15, 10), (7, 5), (25, 15)];

/// Structuring element radii for the morphological detector
const MORPH_LADDER: [u8; 4] = [2, 1, 3, 4];

/// Radius used to bridge nearby edge or ink pixels into one cluster
const CLUSTER_BRIDGE: u8 = 2;

/// Sobel magnitude below which an image is considered featureless
const MIN_GRADIENT: u16 = 40;

/// Brightness spread below which Otsu binarization is meaningless
const MIN_CONTRAST: u8 = 16;

/// Alpha below which a pixel counts as background
const ALPHA_THRESHOLD: u8 = 10;

/// Smallest side length the detectors will look at
const MIN_ANALYSIS_SIZE: u32 = 2;

/// The boundary detection methods, in descending order of trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorMethod {
    Canny,
    AdaptiveThreshold,
    MorphologicalContour,
    EdgeDensity,
    Brightness,
}

impl DetectorMethod {
    /// Fixed evaluation order; structural detectors before the statistical fallback
    pub const PRIORITY: [DetectorMethod; 5] = [
        DetectorMethod::Canny,
        DetectorMethod::AdaptiveThreshold,
        DetectorMethod::MorphologicalContour,
        DetectorMethod::EdgeDensity,
        DetectorMethod::Brightness,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DetectorMethod::Canny => "canny edge detection",
            DetectorMethod::AdaptiveThreshold => "adaptive threshold",
            DetectorMethod::MorphologicalContour => "morphological contour",
            DetectorMethod::EdgeDensity => "edge density",
            DetectorMethod::Brightness => "brightness (fallback)",
        }
    }

    /// Run this detector over a grayscale analysis image.
    ///
    /// `stats` must describe `gray`. Images smaller than the minimum crop
    /// size cannot hold a valid candidate and are never analysed.
    pub fn detect(self, gray: &GrayImage, stats: &ImageStats, options: &CropOptions) -> Detection {
        let floor = options.min_dimension_px.max(MIN_ANALYSIS_SIZE);
        if gray.width() < floor || gray.height() < floor {
            return Detection::NotFound;
        }
        let detection = match self {
            DetectorMethod::Canny => detect_canny(gray, options),
            DetectorMethod::AdaptiveThreshold => detect_adaptive_threshold(gray, options),
            DetectorMethod::MorphologicalContour => detect_morphological(gray, stats, options),
            DetectorMethod::EdgeDensity => detect_edge_density(gray, options),
            DetectorMethod::Brightness => detect_brightness(gray, stats, options),
        };
        debug!(method = self.name(), ?detection, "Detector finished");
        detection
    }
}

impl fmt::Display for DetectorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a single detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Found(CropRect),
    NotFound,
}

impl From<Option<CropRect>> for Detection {
    fn from(rect: Option<CropRect>) -> Self {
        rect.map_or(Detection::NotFound, Detection::Found)
    }
}

/// Lazily run every detector in priority order.
///
/// Each detector only runs when the iterator is advanced to it. The
/// statistics of `gray` are shared by all of them.
pub fn detections<'a>(
    gray: &'a GrayImage,
    stats: &'a ImageStats,
    options: &'a CropOptions,
) -> impl Iterator<Item = (DetectorMethod, Detection)> + 'a {
    DetectorMethod::PRIORITY
        .into_iter()
        .map(move |method| (method, method.detect(gray, stats, options)))
}

/// Convert to grayscale for analysis, treating transparent pixels as white background
pub fn analysis_gray(img: &DynamicImage) -> GrayImage {
    if !img.color().has_alpha() {
        return img.to_luma8();
    }

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut gray = GrayImage::new(width, height);

    for (x, y, pixel) in rgba.enumerate_pixels() {
        if pixel[3] >= ALPHA_THRESHOLD {
            let luma = (0.299 * pixel[0] as f64
                + 0.587 * pixel[1] as f64
                + 0.114 * pixel[2] as f64) as u8;
            gray.put_pixel(x, y, Luma([luma]));
        } else {
            gray.put_pixel(x, y, Luma([255]));
        }
    }

    gray
}

fn min_component_area(gray: &GrayImage, options: &CropOptions) -> u64 {
    let total = gray.width() as u64 * gray.height() as u64;
    ((total as f64 * options.min_component_ratio).ceil() as u64).max(1)
}

/// Bounding box of the largest cluster in `clusters`, measured over the
/// non-zero pixels of `members` only.
///
/// `clusters` is usually a dilated copy of `members`, so nearby strokes are
/// grouped while the box still hugs the real pixels.
fn largest_cluster(clusters: &GrayImage, members: &GrayImage, min_area: u64) -> Option<CropRect> {
    let labels = connected_components(clusters, Connectivity::Eight, Luma([0u8]));
    let mut bounds: Vec<BoundsAccumulator> = Vec::new();

    for (x, y, pixel) in members.enumerate_pixels() {
        if pixel[0] == 0 {
            continue;
        }
        let label = labels.get_pixel(x, y)[0] as usize;
        if label == 0 {
            continue;
        }
        if label >= bounds.len() {
            bounds.resize(label + 1, BoundsAccumulator::new());
        }
        bounds[label].add(x, y);
    }

    bounds
        .iter()
        .filter_map(BoundsAccumulator::rect)
        .filter(|rect| rect.area() >= min_area)
        .max_by_key(CropRect::area)
}

// -- Canny --------------------------------------------------------------------

fn detect_canny(gray: &GrayImage, options: &CropOptions) -> Detection {
    let blurred = gaussian_blur_f32(gray, 1.0);
    let min_area = min_component_area(gray, options);
    let configured = (options.canny_threshold1, options.canny_threshold2);

    let ladder = std::iter::once(configured)
        .chain(CANNY_LADDER.into_iter().filter(|pair| *pair != configured));

    for (low, high) in ladder {
        let edges = canny(&blurred, low, high);
        let clusters = morphology::dilate(&edges, Norm::LInf, CLUSTER_BRIDGE);
        if let Some(rect) = largest_cluster(&clusters, &edges, min_area) {
            debug!(low, high, ?rect, "Canny edge cluster found");
            return Detection::Found(rect);
        }
    }

    Detection::NotFound
}

// -- Adaptive threshold -------------------------------------------------------

fn detect_adaptive_threshold(gray: &GrayImage, options: &CropOptions) -> Detection {
    let min_area = min_component_area(gray, options);
    let integral = compute_integral_image(gray);

    for (block_radius, c) in ADAPTIVE_LADDER {
        let binary = adaptive_binarize(gray, &integral, block_radius, c);
        let clusters = morphology::dilate(&binary, Norm::LInf, CLUSTER_BRIDGE);
        if let Some(rect) = largest_cluster(&clusters, &binary, min_area) {
            debug!(block_radius, c, ?rect, "Adaptive threshold component found");
            return Detection::Found(rect);
        }
    }

    Detection::NotFound
}

/// Mark pixels darker than their local mean minus `c` as foreground (255)
fn adaptive_binarize(gray: &GrayImage, integral: &[u64], block_radius: u32, c: i32) -> GrayImage {
    let (width, height) = gray.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let local_mean = region_mean(integral, width, height, x, y, block_radius);
        let threshold = local_mean as i32 - c;
        if (gray.get_pixel(x, y)[0] as i32) < threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Summed-area table with a zero-padded first row and column
fn compute_integral_image(gray: &GrayImage) -> Vec<u64> {
    let (w, h) = gray.dimensions();
    let stride = (w + 1) as usize;
    let mut table = vec![0u64; stride * (h + 1) as usize];

    for y in 0..h {
        let mut row_sum: u64 = 0;
        for x in 0..w {
            row_sum += gray.get_pixel(x, y)[0] as u64;
            let idx = (y + 1) as usize * stride + (x + 1) as usize;
            let above = y as usize * stride + (x + 1) as usize;
            table[idx] = row_sum + table[above];
        }
    }

    table
}

/// Mean of the square window of `radius` around (cx, cy), clipped to the image
fn region_mean(
    integral: &[u64],
    img_width: u32,
    img_height: u32,
    cx: u32,
    cy: u32,
    radius: u32,
) -> f64 {
    let stride = (img_width + 1) as usize;

    let x1 = cx.saturating_sub(radius) as usize;
    let y1 = cy.saturating_sub(radius) as usize;
    let x2 = ((cx + radius + 1) as usize).min(img_width as usize);
    let y2 = ((cy + radius + 1) as usize).min(img_height as usize);

    let area = ((x2 - x1) * (y2 - y1)) as f64;
    if area == 0.0 {
        return 128.0;
    }

    let sum = integral[y2 * stride + x2] as f64 - integral[y1 * stride + x2] as f64
        - integral[y2 * stride + x1] as f64
        + integral[y1 * stride + x1] as f64;

    sum / area
}

// -- Morphological contour ----------------------------------------------------

fn detect_morphological(gray: &GrayImage, stats: &ImageStats, options: &CropOptions) -> Detection {
    if stats.dynamic_range() < MIN_CONTRAST {
        return Detection::NotFound;
    }
    let min_area = min_component_area(gray, options);
    let level = otsu_level(gray);

    // Content is darker than the background
    let binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] <= level {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    for radius in MORPH_LADDER {
        let closed = morphology::close(&binary, Norm::LInf, radius);
        let cleaned = morphology::open(&closed, Norm::LInf, radius);
        if let Some(rect) = largest_outer_contour(&cleaned, min_area) {
            debug!(level, radius, ?rect, "Morphological contour found");
            return Detection::Found(rect);
        }
    }

    Detection::NotFound
}

fn largest_outer_contour(binary: &GrayImage, min_area: u64) -> Option<CropRect> {
    find_contours::<u32>(binary)
        .iter()
        .filter(|contour| matches!(contour.border_type, BorderType::Outer))
        .filter_map(|contour| {
            let mut bounds = BoundsAccumulator::new();
            for point in &contour.points {
                bounds.add(point.x, point.y);
            }
            bounds.rect()
        })
        .filter(|rect| rect.area() >= min_area)
        .max_by_key(CropRect::area)
}

// -- Edge density -------------------------------------------------------------

fn detect_edge_density(gray: &GrayImage, options: &CropOptions) -> Detection {
    let (width, height) = gray.dimensions();
    let gradients = sobel_gradients(&gaussian_blur_f32(gray, 1.0));
    let max = gradients.pixels().map(|p| p[0]).max().unwrap_or(0);
    if max < MIN_GRADIENT {
        return Detection::NotFound;
    }
    let edge_level = (max as f64 * 0.2) as u16;

    let tile = options.edge_tile_size;
    let tiles_x = width.div_ceil(tile);
    let tiles_y = height.div_ceil(tile);
    let mut counts = vec![0u32; (tiles_x * tiles_y) as usize];
    let mut total_edges = 0u64;

    for (x, y, pixel) in gradients.enumerate_pixels() {
        if pixel[0] > edge_level {
            counts[((y / tile) * tiles_x + x / tile) as usize] += 1;
            total_edges += 1;
        }
    }
    if total_edges == 0 {
        return Detection::NotFound;
    }

    let global_density = total_edges as f64 / (width as u64 * height as u64) as f64;
    let mut content: Option<CropRect> = None;
    let mut content_tiles = 0;

    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x1 = tx * tile;
            let y1 = ty * tile;
            let x2 = (x1 + tile).min(width);
            let y2 = (y1 + tile).min(height);
            let Some(tile_rect) = CropRect::new(x1, y1, x2, y2) else {
                continue;
            };
            let density = counts[(ty * tiles_x + tx) as usize] as f64 / tile_rect.area() as f64;
            if density > global_density * options.edge_density_factor {
                content_tiles += 1;
                content = Some(content.map_or(tile_rect, |r| r.union(&tile_rect)));
            }
        }
    }

    debug!(content_tiles, global_density, "Edge density map computed");
    content
        .filter(|rect| rect.area() >= min_component_area(gray, options))
        .into()
}

// -- Brightness fallback ------------------------------------------------------

fn detect_brightness(gray: &GrayImage, stats: &ImageStats, options: &CropOptions) -> Detection {
    let (width, height) = gray.dimensions();
    if stats.dynamic_range() == 0 {
        return Detection::NotFound;
    }

    let mut row_sums = vec![0u64; height as usize];
    let mut col_sums = vec![0u64; width as usize];
    for (x, y, pixel) in gray.enumerate_pixels() {
        row_sums[y as usize] += pixel[0] as u64;
        col_sums[x as usize] += pixel[0] as u64;
    }
    let row_means: Vec<f64> = row_sums.iter().map(|&s| s as f64 / width as f64).collect();
    let col_means: Vec<f64> = col_sums.iter().map(|&s| s as f64 / height as f64).collect();

    let min_area = min_component_area(gray, options);
    let deviations = [options.brightness_deviation, options.brightness_deviation / 2.0];

    for deviation in deviations {
        let threshold = stats.mean * (1.0 - deviation);
        let rows = content_span(&row_means, threshold);
        let cols = content_span(&col_means, threshold);
        if let (Some((y1, y2)), Some((x1, x2))) = (rows, cols) {
            let rect = CropRect::from_inclusive(x1, y1, x2, y2).filter(|r| r.area() >= min_area);
            if rect.is_some() {
                debug!(deviation, ?rect, "Brightness profile content found");
                return rect.into();
            }
        }
    }

    Detection::NotFound
}

/// First and last index whose profile value is darker than `threshold`
fn content_span(profile: &[f64], threshold: f64) -> Option<(u32, u32)> {
    let first = profile.iter().position(|&v| v < threshold)?;
    let last = profile.iter().rposition(|&v| v < threshold)?;
    Some((first as u32, last as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_rect(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> GrayImage {
        let (x1, y1, x2, y2) = rect;
        GrayImage::from_fn(width, height, |x, y| {
            if (x1..x2).contains(&x) && (y1..y2).contains(&y) {
                Luma([60])
            } else {
                Luma([220])
            }
        })
    }

    fn run(method: DetectorMethod, gray: &GrayImage, options: &CropOptions) -> Detection {
        method.detect(gray, &ImageStats::compute(gray), options)
    }

    fn assert_close(rect: CropRect, expected: (u32, u32, u32, u32), tolerance: u32) {
        let diff = |a: u32, b: u32| a.abs_diff(b);
        assert!(
            diff(rect.x1, expected.0) <= tolerance
                && diff(rect.y1, expected.1) <= tolerance
                && diff(rect.x2, expected.2) <= tolerance
                && diff(rect.y2, expected.3) <= tolerance,
            "{:?} not within {} of {:?}",
            rect,
            tolerance,
            expected
        );
    }

    #[test]
    fn test_every_detector_finds_dark_rectangle() {
        let expected = (100, 75, 300, 225);
        let gray = page_with_rect(400, 300, expected);
        let options = CropOptions::default();

        for method in DetectorMethod::PRIORITY {
            match run(method, &gray, &options) {
                Detection::Found(rect) => {
                    let tolerance = if method == DetectorMethod::EdgeDensity { 20 } else { 4 };
                    assert_close(rect, expected, tolerance);
                }
                Detection::NotFound => panic!("{} found nothing", method),
            }
        }
    }

    #[test]
    fn test_uniform_image_has_no_candidates() {
        let gray = GrayImage::from_pixel(200, 150, Luma([128]));
        let options = CropOptions::default();
        for method in DetectorMethod::PRIORITY {
            assert_eq!(run(method, &gray, &options), Detection::NotFound, "{}", method);
        }
    }

    #[test]
    fn test_empty_image_has_no_candidates() {
        let gray = GrayImage::new(0, 0);
        let options = CropOptions::default();
        for method in DetectorMethod::PRIORITY {
            assert_eq!(run(method, &gray, &options), Detection::NotFound);
        }
    }

    #[test]
    fn test_tiny_images_have_no_candidates() {
        let options = CropOptions::default();
        for (w, h) in [(1, 1), (1, 50), (2, 2), (19, 400)] {
            let gray = GrayImage::from_pixel(w, h, Luma([10]));
            for method in DetectorMethod::PRIORITY {
                assert_eq!(run(method, &gray, &options), Detection::NotFound, "{}x{}", w, h);
            }
        }
        // A zero size floor still keeps 1x1 images away from the labelling step
        let permissive = CropOptions {
            min_dimension_px: 0,
            ..CropOptions::default()
        };
        let dot = GrayImage::from_pixel(1, 1, Luma([10]));
        assert_eq!(run(DetectorMethod::Canny, &dot, &permissive), Detection::NotFound);
    }

    #[test]
    fn test_speck_below_area_floor_is_ignored() {
        // 4x4 speck on a 200x200 page is far below the 1% floor
        let gray = page_with_rect(200, 200, (50, 50, 54, 54));
        let options = CropOptions::default();
        assert_eq!(
            run(DetectorMethod::Canny, &gray, &options),
            Detection::NotFound
        );
        assert_eq!(
            run(DetectorMethod::MorphologicalContour, &gray, &options),
            Detection::NotFound
        );
    }

    #[test]
    fn test_detections_are_lazy_and_ordered() {
        let gray = page_with_rect(120, 90, (30, 20, 90, 70));
        let options = CropOptions::default();
        let stats = ImageStats::compute(&gray);
        let mut iter = detections(&gray, &stats, &options);
        let (first, _) = iter.next().unwrap();
        assert_eq!(first, DetectorMethod::Canny);
        let rest: Vec<_> = iter.map(|(m, _)| m).collect();
        assert_eq!(rest, &DetectorMethod::PRIORITY[1..]);
    }

    #[test]
    fn test_analysis_gray_transparent_is_white() {
        let mut rgba = image::RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 1, image::Rgba([0, 0, 0, 255]));
        let gray = analysis_gray(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(gray.get_pixel(0, 0)[0], 255);
        assert_eq!(gray.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn test_region_mean() {
        let gray = GrayImage::from_fn(3, 3, |x, _| Luma([(x * 10) as u8]));
        let integral = compute_integral_image(&gray);
        assert!((region_mean(&integral, 3, 3, 1, 1, 1) - 10.0).abs() < 1e-9);
        assert!((region_mean(&integral, 3, 3, 0, 0, 0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_content_span() {
        let profile = [200.0, 200.0, 90.0, 200.0, 80.0, 200.0];
        assert_eq!(content_span(&profile, 150.0), Some((2, 4)));
        assert_eq!(content_span(&profile, 10.0), None);
    }
}
