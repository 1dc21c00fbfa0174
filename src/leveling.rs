use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, LumaA, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{grayscale_close, Mask};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, instrument, warn};

use crate::config::{LevelIntensity, LevelMethod};
use crate::error::{CropError, Result};
use crate::stats::ImageStats;

/// Longest side of the copy used for background estimation
const WORKING_SIZE: u32 = 256;

/// Added to the background estimate before dividing
const EPSILON: f32 = 1.0;

/// Level the background of an image, returning the original unchanged if
/// leveling is not possible.
pub fn level_background(
    image: &DynamicImage,
    method: LevelMethod,
    intensity: LevelIntensity,
) -> DynamicImage {
    match try_level_background(image, method, intensity) {
        Ok(leveled) => leveled,
        Err(err) => {
            warn!(%err, ?method, "Leveling failed, keeping original image");
            image.clone()
        }
    }
}

/// Level the background of an image.
///
/// Color images are leveled per channel, alpha is carried over untouched.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn try_level_background(
    image: &DynamicImage,
    method: LevelMethod,
    intensity: LevelIntensity,
) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(CropError::Leveling("image has zero area".to_string()));
    }

    let method = match method {
        LevelMethod::Auto => select_method(&ImageStats::compute(&image.to_luma8())),
        other => other,
    };
    debug!(?method, ?intensity, "Leveling background");

    let leveled = level_8bit(image, method, intensity)?;
    Ok(restore_color_type(image, leveled))
}

/// Level in 8-bit working precision, per channel, carrying alpha over
fn level_8bit(
    image: &DynamicImage,
    method: LevelMethod,
    intensity: LevelIntensity,
) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    let color = image.color();
    if color.has_color() {
        let rgba = image.to_rgba8();
        let mut channels = Vec::with_capacity(3);
        for c in 0..3 {
            let channel = GrayImage::from_fn(width, height, |x, y| Luma([rgba.get_pixel(x, y)[c]]));
            channels.push(level_channel(&channel, method, intensity)?);
        }

        if color.has_alpha() {
            let out = RgbaImage::from_fn(width, height, |x, y| {
                Rgba([
                    channels[0].get_pixel(x, y)[0],
                    channels[1].get_pixel(x, y)[0],
                    channels[2].get_pixel(x, y)[0],
                    rgba.get_pixel(x, y)[3],
                ])
            });
            Ok(DynamicImage::ImageRgba8(out))
        } else {
            let out = RgbImage::from_fn(width, height, |x, y| {
                Rgb([
                    channels[0].get_pixel(x, y)[0],
                    channels[1].get_pixel(x, y)[0],
                    channels[2].get_pixel(x, y)[0],
                ])
            });
            Ok(DynamicImage::ImageRgb8(out))
        }
    } else if color.has_alpha() {
        let la = image.to_luma_alpha8();
        let luma = GrayImage::from_fn(width, height, |x, y| Luma([la.get_pixel(x, y)[0]]));
        let leveled = level_channel(&luma, method, intensity)?;
        let out = image::GrayAlphaImage::from_fn(width, height, |x, y| {
            LumaA([leveled.get_pixel(x, y)[0], la.get_pixel(x, y)[1]])
        });
        Ok(DynamicImage::ImageLumaA8(out))
    } else {
        let leveled = level_channel(&image.to_luma8(), method, intensity)?;
        Ok(DynamicImage::ImageLuma8(leveled))
    }
}

/// Convert the 8-bit result back to the input's pixel type.
///
/// Alpha is copied from the input at full depth.
fn restore_color_type(original: &DynamicImage, leveled: DynamicImage) -> DynamicImage {
    match original {
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma16(leveled.to_luma16()),
        DynamicImage::ImageLumaA16(src) => {
            let mut out = leveled.to_luma_alpha16();
            for (dst, src) in out.pixels_mut().zip(src.pixels()) {
                dst[1] = src[1];
            }
            DynamicImage::ImageLumaA16(out)
        }
        DynamicImage::ImageRgb16(_) => DynamicImage::ImageRgb16(leveled.to_rgb16()),
        DynamicImage::ImageRgba16(src) => {
            let mut out = leveled.to_rgba16();
            for (dst, src) in out.pixels_mut().zip(src.pixels()) {
                dst[3] = src[3];
            }
            DynamicImage::ImageRgba16(out)
        }
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb32F(leveled.to_rgb32f()),
        DynamicImage::ImageRgba32F(src) => {
            let mut out = leveled.to_rgba32f();
            for (dst, src) in out.pixels_mut().zip(src.pixels()) {
                dst[3] = src[3];
            }
            DynamicImage::ImageRgba32F(out)
        }
        _ => leveled,
    }
}

/// Choose a leveling method from the brightness statistics.
///
/// A narrow dynamic range means a soft illumination gradient, which a smooth
/// surface models best; a large spread points at hard shadows.
pub fn select_method(stats: &ImageStats) -> LevelMethod {
    if stats.dynamic_range() < 64 {
        LevelMethod::Polynomial
    } else if stats.std_dev > 60.0 {
        LevelMethod::Morphological
    } else {
        LevelMethod::Gaussian
    }
}

fn level_channel(
    channel: &GrayImage,
    method: LevelMethod,
    intensity: LevelIntensity,
) -> Result<GrayImage> {
    match method {
        LevelMethod::Morphological => level_morphological(channel, intensity),
        LevelMethod::Gaussian => level_gaussian(channel, intensity),
        LevelMethod::Polynomial => level_polynomial(channel, intensity),
        LevelMethod::Auto => {
            let resolved = select_method(&ImageStats::compute(channel));
            level_channel(channel, resolved, intensity)
        }
    }
}

// -- Morphological ------------------------------------------------------------

fn level_morphological(gray: &GrayImage, intensity: LevelIntensity) -> Result<GrayImage> {
    let (divisor, min_kernel) = match intensity {
        LevelIntensity::Gentle => (40, 15),
        LevelIntensity::Medium => (25, 21),
        LevelIntensity::Strong => (15, 31),
    };
    let kernel = odd((gray.width().min(gray.height()) / divisor).max(min_kernel));
    let background = morphological_background(gray, kernel);

    let (mean, std) = mean_std(gray.pixels().map(|p| p[0] as f64));
    let diffs: Vec<f64> = gray
        .pixels()
        .zip(background.pixels())
        .map(|(g, b)| g[0] as f64 - b[0] as f64)
        .collect();
    let (diff_mean, diff_std) = mean_std(diffs.iter().copied());

    if diff_std <= f64::EPSILON {
        return Ok(gray.clone());
    }

    let gain = std / diff_std;
    let values: Vec<u8> = diffs
        .iter()
        .map(|d| ((d - diff_mean) * gain + mean).clamp(0.0, 255.0) as u8)
        .collect();
    GrayImage::from_raw(gray.width(), gray.height(), values)
        .ok_or_else(|| CropError::Leveling("buffer size mismatch".to_string()))
}

/// Grayscale closing with a disk of diameter `kernel`, then smoothed.
///
/// Closing removes dark content narrower than the disk, leaving the
/// lighter background.
fn morphological_background(gray: &GrayImage, kernel: u32) -> GrayImage {
    estimate_background(gray, |small, scale| {
        let radius = ((kernel / 2) as f64 * scale)
            .round()
            .clamp(1.0, u8::MAX as f64) as u8;
        let closed = grayscale_close(small, &Mask::disk(radius));
        let sigma = ((kernel / 3) as f64 * scale).max(0.5) as f32;
        gaussian_blur_f32(&closed, sigma)
    })
}

// -- Gaussian -----------------------------------------------------------------

fn level_gaussian(gray: &GrayImage, intensity: LevelIntensity) -> Result<GrayImage> {
    let min_radius = match intensity {
        LevelIntensity::Gentle => 15,
        LevelIntensity::Medium => 25,
        LevelIntensity::Strong => 35,
    };
    let radius = (gray.width().min(gray.height()) / 8).max(min_radius);

    let background = estimate_background(gray, |small, scale| {
        let sigma = (radius as f64 / 3.0 * scale).max(0.5) as f32;
        gaussian_blur_f32(small, sigma)
    });

    Ok(divide_out(gray, |x, y| background.get_pixel(x, y)[0] as f32))
}

// -- Polynomial ---------------------------------------------------------------

fn level_polynomial(gray: &GrayImage, intensity: LevelIntensity) -> Result<GrayImage> {
    let (width, height) = gray.dimensions();
    let min_dim = width.min(height);
    let (degree, step) = match intensity {
        LevelIntensity::Gentle => (2, (min_dim / 50).max(20)),
        LevelIntensity::Medium => (3, (min_dim / 75).max(15)),
        LevelIntensity::Strong => (3, (min_dim / 100).max(10)),
    };

    let samples = patch_medians(gray, step);
    let terms = (degree + 1) * (degree + 2) / 2;
    if samples.len() < terms * 2 {
        return Err(CropError::Leveling(format!(
            "{} background samples are too few for a degree {} surface",
            samples.len(),
            degree
        )));
    }

    let coefficients = fit_surface(&samples, degree, width, height)?;
    debug!(degree, samples = samples.len(), "Fitted background surface");

    let u: Vec<f64> = (0..width).map(|x| normalize(x as f64, width)).collect();
    let v: Vec<f64> = (0..height).map(|y| normalize(y as f64, height)).collect();

    Ok(divide_out(gray, |x, y| {
        evaluate_surface(&coefficients, degree, u[x as usize], v[y as usize]) as f32
    }))
}

/// One (x, y, median) sample per `step`-sized patch
fn patch_medians(gray: &GrayImage, step: u32) -> Vec<(f64, f64, f64)> {
    let (width, height) = gray.dimensions();
    let mut samples = Vec::new();
    let mut values = Vec::with_capacity((step * step) as usize);

    for py in (0..height).step_by(step as usize) {
        for px in (0..width).step_by(step as usize) {
            let x_end = (px + step).min(width);
            let y_end = (py + step).min(height);
            values.clear();
            for y in py..y_end {
                for x in px..x_end {
                    values.push(gray.get_pixel(x, y)[0]);
                }
            }
            values.sort_unstable();
            let median = values[values.len() / 2] as f64;
            let cx = (px + x_end) as f64 / 2.0;
            let cy = (py + y_end) as f64 / 2.0;
            samples.push((cx, cy, median));
        }
    }

    samples
}

/// Least-squares fit of a bivariate polynomial over normalized coordinates
fn fit_surface(
    samples: &[(f64, f64, f64)],
    degree: usize,
    width: u32,
    height: u32,
) -> Result<DVector<f64>> {
    let terms = (degree + 1) * (degree + 2) / 2;
    let mut design = DMatrix::<f64>::zeros(samples.len(), terms);
    let mut target = DVector::<f64>::zeros(samples.len());

    for (row, &(x, y, z)) in samples.iter().enumerate() {
        let u = normalize(x, width);
        let v = normalize(y, height);
        for (col, value) in monomials(degree, u, v).enumerate() {
            design[(row, col)] = value;
        }
        target[row] = z;
    }

    let normal = design.transpose() * &design;
    let rhs = design.transpose() * target;
    let cholesky = normal
        .cholesky()
        .ok_or_else(|| CropError::Leveling("background surface is ill-conditioned".to_string()))?;
    let coefficients = cholesky.solve(&rhs);

    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(CropError::Leveling("background surface diverged".to_string()));
    }
    Ok(coefficients)
}

fn evaluate_surface(coefficients: &DVector<f64>, degree: usize, u: f64, v: f64) -> f64 {
    monomials(degree, u, v)
        .zip(coefficients.iter())
        .map(|(m, c)| m * c)
        .sum()
}

/// u^i * v^j for every i + j <= degree, in a fixed order
fn monomials(degree: usize, u: f64, v: f64) -> impl Iterator<Item = f64> {
    (0..=degree).flat_map(move |i| (0..=degree - i).map(move |j| u.powi(i as i32) * v.powi(j as i32)))
}

/// Map [0, extent] onto [-1, 1]
fn normalize(value: f64, extent: u32) -> f64 {
    2.0 * value / extent.max(1) as f64 - 1.0
}

// -- Shared helpers -----------------------------------------------------------

/// Run `estimate` on a downscaled copy and resize the result back.
///
/// The closure receives the small image and the scale factor from the
/// original to the small image, so kernel sizes can be adjusted.
fn estimate_background<F>(gray: &GrayImage, estimate: F) -> GrayImage
where
    F: FnOnce(&GrayImage, f64) -> GrayImage,
{
    let (width, height) = gray.dimensions();
    let longest = width.max(height);
    if longest <= WORKING_SIZE {
        return estimate(gray, 1.0);
    }

    let scale = WORKING_SIZE as f64 / longest as f64;
    let small_w = ((width as f64 * scale).round() as u32).max(1);
    let small_h = ((height as f64 * scale).round() as u32).max(1);
    let small = imageops::resize(gray, small_w, small_h, FilterType::Triangle);
    let background = estimate(&small, scale);
    imageops::resize(&background, width, height, FilterType::Triangle)
}

/// original / (background + 1) * mean(original), clipped
fn divide_out<F>(gray: &GrayImage, background: F) -> GrayImage
where
    F: Fn(u32, u32) -> f32,
{
    let (mean, _) = mean_std(gray.pixels().map(|p| p[0] as f64));
    let mean = mean as f32;
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let bg = background(x, y).max(0.0);
        let value = gray.get_pixel(x, y)[0] as f32 / (bg + EPSILON) * mean;
        Luma([value.clamp(0.0, 255.0) as u8])
    })
}

fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

fn odd(value: u32) -> u32 {
    if value % 2 == 0 {
        value + 1
    } else {
        value
    }
}
