use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::classify::{classify, CheckKind, Classification};
use crate::cli::cropped_path;
use crate::config::CropOptions;
use crate::detection::DetectorMethod;
use crate::error::{CropError, Result};
use crate::geometry::CropRect;
use crate::orientation::Orientation;
use crate::pipeline::{detect_and_crop, load_image, save_image};

/// Batch-level settings, separate from the per-image crop options
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Checks laid out on one printed page
    pub checks_per_page: usize,
    /// Keep the uncropped image when no crop boundary is found instead of
    /// failing the slot
    pub keep_uncropped: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            checks_per_page: 3,
            keep_uncropped: true,
        }
    }
}

/// How the crop of one batch item went
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CropSummary {
    pub rect: CropRect,
    pub method: DetectorMethod,
    pub area_reduction: f64,
    pub orientation: Orientation,
}

/// A successfully processed image
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub source: PathBuf,
    pub image: DynamicImage,
    /// `None` when the uncropped image was kept
    pub crop: Option<CropSummary>,
    pub classification: Classification,
}

/// An image that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub source: PathBuf,
    pub message: String,
}

/// Checks of one kind that share a printed page
#[derive(Debug, Clone)]
pub struct PrintGroup<'a> {
    pub kind: CheckKind,
    /// Zero-based page index within the kind
    pub page: usize,
    pub items: Vec<&'a BatchItem>,
}

/// Per-input outcomes, in input order
#[derive(Debug)]
pub struct BatchReport {
    pub slots: Vec<std::result::Result<BatchItem, BatchFailure>>,
    pub checks_per_page: usize,
}

/// One line of the JSON summary
#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    pub source: PathBuf,
    pub kind: CheckKind,
    pub confidence: f64,
    pub width_inches: f64,
    pub height_inches: f64,
    pub estimated_dpi: u32,
    pub crop: Option<CropSummary>,
}

/// Serializable overview of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total_inputs: usize,
    pub total_processed: usize,
    pub total_cropped: usize,
    pub total_errors: usize,
    pub classification_summary: BTreeMap<CheckKind, usize>,
    pub pages: BTreeMap<CheckKind, usize>,
    pub checks: Vec<CheckRecord>,
    pub errors: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn items(&self) -> impl Iterator<Item = &BatchItem> {
        self.slots.iter().filter_map(|slot| slot.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchFailure> {
        self.slots.iter().filter_map(|slot| slot.as_ref().err())
    }

    /// Group items by check kind, then split each kind into pages
    pub fn print_groups(&self) -> Vec<PrintGroup<'_>> {
        let mut by_kind: BTreeMap<CheckKind, Vec<&BatchItem>> = BTreeMap::new();
        for item in self.items() {
            by_kind
                .entry(item.classification.kind)
                .or_default()
                .push(item);
        }

        let per_page = self.checks_per_page.max(1);
        by_kind
            .into_iter()
            .flat_map(|(kind, items)| {
                items
                    .chunks(per_page)
                    .enumerate()
                    .map(|(page, chunk)| PrintGroup {
                        kind,
                        page,
                        items: chunk.to_vec(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let mut classification_summary = BTreeMap::new();
        for item in self.items() {
            *classification_summary
                .entry(item.classification.kind)
                .or_insert(0) += 1;
        }

        let mut pages = BTreeMap::new();
        for group in self.print_groups() {
            *pages.entry(group.kind).or_insert(0) += 1;
        }

        let checks: Vec<CheckRecord> = self
            .items()
            .map(|item| CheckRecord {
                source: item.source.clone(),
                kind: item.classification.kind,
                confidence: item.classification.confidence,
                width_inches: item.classification.dimensions.width_inches,
                height_inches: item.classification.dimensions.height_inches,
                estimated_dpi: item.classification.dimensions.estimated_dpi,
                crop: item.crop,
            })
            .collect();
        let errors: Vec<BatchFailure> = self.failures().cloned().collect();

        BatchSummary {
            total_inputs: self.slots.len(),
            total_processed: checks.len(),
            total_cropped: checks.iter().filter(|c| c.crop.is_some()).count(),
            total_errors: errors.len(),
            classification_summary,
            pages,
            checks,
            errors,
        }
    }
}

/// Load, crop and classify every file in parallel.
///
/// A failing image only fails its own slot.
#[instrument(skip_all, fields(inputs = paths.len()))]
pub fn process_batch(paths: &[PathBuf], options: &CropOptions, batch: &BatchOptions) -> BatchReport {
    let slots = paths
        .par_iter()
        .map(|path| {
            load_image(path)
                .and_then(|image| process_image(path, image, options, batch))
                .map_err(|err| failure(path, err))
        })
        .collect();

    finish(slots, batch)
}

/// Crop and classify already decoded images in parallel
#[instrument(skip_all, fields(inputs = images.len()))]
pub fn process_images(
    images: Vec<(PathBuf, DynamicImage)>,
    options: &CropOptions,
    batch: &BatchOptions,
) -> BatchReport {
    let slots = images
        .into_par_iter()
        .map(|(source, image)| {
            process_image(&source, image, options, batch).map_err(|err| failure(&source, err))
        })
        .collect();

    finish(slots, batch)
}

/// Write every item to `<output_dir>/<stem>_cropped.<ext>`.
///
/// An item that cannot be written becomes a failure in its slot, so the
/// summary never counts it as processed. Returns the number saved.
#[instrument(skip_all, fields(output = %output_dir.display()))]
pub fn save_outputs(report: &mut BatchReport, output_dir: &Path) -> usize {
    report
        .slots
        .par_iter_mut()
        .map(|slot| {
            let err = match slot {
                Ok(item) => match save_image(&item.image, &cropped_path(&item.source, output_dir)) {
                    Ok(()) => return true,
                    Err(err) => failure(&item.source, err),
                },
                Err(_) => return false,
            };
            *slot = Err(err);
            false
        })
        .filter(|&saved| saved)
        .count()
}

fn finish(
    slots: Vec<std::result::Result<BatchItem, BatchFailure>>,
    batch: &BatchOptions,
) -> BatchReport {
    let report = BatchReport {
        slots,
        checks_per_page: batch.checks_per_page,
    };
    info!(
        processed = report.items().count(),
        errors = report.failures().count(),
        "Batch complete"
    );
    report
}

fn failure(source: &Path, err: CropError) -> BatchFailure {
    warn!(source = %source.display(), %err, "Batch item failed");
    BatchFailure {
        source: source.to_path_buf(),
        message: err.to_string(),
    }
}

fn process_image(
    source: &Path,
    image: DynamicImage,
    options: &CropOptions,
    batch: &BatchOptions,
) -> Result<BatchItem> {
    let (image, crop) = match detect_and_crop(&image, options) {
        Ok(result) => {
            let crop = CropSummary {
                rect: result.rect,
                method: result.method,
                area_reduction: result.area_reduction,
                orientation: result.orientation,
            };
            (result.image, Some(crop))
        }
        Err(err @ CropError::NoValidBoundary { .. }) if batch.keep_uncropped => {
            warn!(source = %source.display(), %err, "Crop failed, keeping original");
            (image, None)
        }
        Err(err) => return Err(err),
    };

    let classification = classify(&image);
    info!(
        source = %source.display(),
        kind = %classification.kind,
        confidence = classification.confidence,
        "Classified check"
    );

    Ok(BatchItem {
        source: source.to_path_buf(),
        image,
        crop,
        classification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_dimensions;
    use image::{GrayImage, Luma};

    fn check_scan() -> DynamicImage {
        // 300x138 personal check centered on a larger scan
        DynamicImage::ImageLuma8(GrayImage::from_fn(400, 240, |x, y| {
            if (50..350).contains(&x) && (51..189).contains(&y) {
                Luma([70])
            } else {
                Luma([225])
            }
        }))
    }

    fn item(name: &str, kind_width: u32, kind_height: u32) -> BatchItem {
        BatchItem {
            source: PathBuf::from(name),
            image: DynamicImage::new_luma8(1, 1),
            crop: None,
            classification: classify_dimensions(kind_width, kind_height),
        }
    }

    #[test]
    fn test_failures_are_isolated() {
        let options = CropOptions {
            auto_rotate: false,
            ..CropOptions::default()
        };
        let images = vec![
            (PathBuf::from("good.png"), check_scan()),
            (PathBuf::from("empty.png"), DynamicImage::new_luma8(0, 0)),
        ];
        let report = process_images(images, &options, &BatchOptions::default());

        assert_eq!(report.slots.len(), 2);
        let good = report.slots[0].as_ref().unwrap();
        assert!(good.crop.is_some());
        let bad = report.slots[1].as_ref().unwrap_err();
        assert_eq!(bad.source, PathBuf::from("empty.png"));
    }

    #[test]
    fn test_uncropped_fallback() {
        let uniform = DynamicImage::ImageLuma8(GrayImage::from_pixel(200, 100, Luma([128])));
        let options = CropOptions::default();

        let report = process_images(
            vec![(PathBuf::from("blank.png"), uniform.clone())],
            &options,
            &BatchOptions::default(),
        );
        let kept = report.slots[0].as_ref().unwrap();
        assert!(kept.crop.is_none());
        assert_eq!(kept.image, uniform);

        let strict = BatchOptions {
            keep_uncropped: false,
            ..BatchOptions::default()
        };
        let report = process_images(vec![(PathBuf::from("blank.png"), uniform)], &options, &strict);
        assert!(report.slots[0].is_err());
    }

    #[test]
    fn test_missing_file_fails_slot() {
        let report = process_batch(
            &[PathBuf::from("/nonexistent/check.png")],
            &CropOptions::default(),
            &BatchOptions::default(),
        );
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.items().count(), 0);
    }

    #[test]
    fn test_single_pixel_image_does_not_abort_batch() {
        let options = CropOptions {
            auto_rotate: false,
            ..CropOptions::default()
        };
        let tiny = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([10])));
        let images = vec![
            (PathBuf::from("good.png"), check_scan()),
            (PathBuf::from("dot.png"), tiny.clone()),
        ];
        let report = process_images(images, &options, &BatchOptions::default());
        assert!(report.slots[0].as_ref().unwrap().crop.is_some());
        let kept = report.slots[1].as_ref().unwrap();
        assert!(kept.crop.is_none());
        assert_eq!(kept.image, tiny);

        let strict = BatchOptions {
            keep_uncropped: false,
            ..BatchOptions::default()
        };
        let report = process_images(vec![(PathBuf::from("dot.png"), tiny)], &options, &strict);
        assert!(report.slots[0].is_err());
    }

    #[test]
    fn test_unwritable_output_becomes_failure() {
        let mut report = BatchReport {
            slots: vec![Ok(item("p.png", 1800, 825))],
            checks_per_page: 3,
        };
        let saved = save_outputs(&mut report, Path::new("/nonexistent/output"));

        assert_eq!(saved, 0);
        let summary = report.summary();
        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.errors[0].source, PathBuf::from("p.png"));
    }

    #[test]
    fn test_save_outputs_writes_items() {
        let dir = std::env::temp_dir().join(format!("check-crop-batch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut report = BatchReport {
            slots: vec![
                Ok(item("scans/p.png", 1800, 825)),
                Err(BatchFailure {
                    source: PathBuf::from("bad.png"),
                    message: "unreadable".to_string(),
                }),
            ],
            checks_per_page: 3,
        };

        let saved = save_outputs(&mut report, &dir);
        assert_eq!(saved, 1);
        assert!(dir.join("p_cropped.png").is_file());
        assert_eq!(report.summary().total_processed, 1);
        assert_eq!(report.summary().total_errors, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_print_groups_chunk_by_kind() {
        let mut slots: Vec<_> = (0..7)
            .map(|i| Ok(item(&format!("p{}.png", i), 1800, 825)))
            .collect();
        slots.push(Ok(item("c.png", 2550, 3300)));
        slots.push(Err(BatchFailure {
            source: PathBuf::from("bad.png"),
            message: "unreadable".to_string(),
        }));
        let report = BatchReport {
            slots,
            checks_per_page: 3,
        };

        let groups = report.print_groups();
        let sizes: Vec<(CheckKind, usize, usize)> = groups
            .iter()
            .map(|g| (g.kind, g.page, g.items.len()))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (CheckKind::Personal, 0, 3),
                (CheckKind::Personal, 1, 3),
                (CheckKind::Personal, 2, 1),
                (CheckKind::Commercial, 0, 1),
            ]
        );

        let summary = report.summary();
        assert_eq!(summary.total_inputs, 9);
        assert_eq!(summary.total_processed, 8);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.classification_summary[&CheckKind::Personal], 7);
        assert_eq!(summary.pages[&CheckKind::Personal], 3);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["classification_summary"]["personal"], 7);
        assert_eq!(json["errors"][0]["message"], "unreadable");
    }
}
