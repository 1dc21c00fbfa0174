use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use check_crop::{
    classify, detect_and_crop, load_image, process_batch, save_image, save_outputs,
    BatchOptions, Cli, CropError, CropOptions,
};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = cli
        .crop_options()
        .context("Failed to build crop options")?;

    if cli.batch {
        run_batch(&cli, &options)
    } else {
        run_single(&cli, &options)
    }
}

fn run_single(cli: &Cli, options: &CropOptions) -> Result<()> {
    let img = load_image(&cli.input)
        .with_context(|| format!("Failed to open input file: {:?}", cli.input))?;

    info!(
        input = %cli.input.display(),
        width = img.width(),
        height = img.height(),
        "Loaded image"
    );

    let result = match detect_and_crop(&img, options) {
        Ok(result) => result,
        Err(err @ CropError::NoValidBoundary { .. }) => {
            eprintln!("No crop boundary found. Attempts:");
            for attempt in err.attempts() {
                eprintln!("  {}", attempt);
            }
            return Err(err).context("Failed to detect document boundaries");
        }
        Err(err) => return Err(err).context("Failed to crop image"),
    };

    if cli.verbose {
        for attempt in &result.attempts {
            eprintln!("  {}", attempt);
        }
    }

    let output_path = cli.output_path();
    save_image(&result.image, &output_path)
        .with_context(|| format!("Failed to save output: {:?}", output_path))?;

    let classification = classify(&result.image);
    eprintln!("Saved cropped image: {:?}", output_path);
    eprintln!(
        "Dimensions: {}x{} -> {}x{} ({:.1}% removed, {})",
        img.width(),
        img.height(),
        result.image.width(),
        result.image.height(),
        result.area_reduction * 100.0,
        result.method
    );
    if result.orientation.degrees() != 0 {
        eprintln!("Rotated {} degrees", result.orientation.degrees());
    }
    eprintln!(
        "Check type: {} ({:.0}% confidence, {:.2}\" x {:.2}\" at {} DPI)",
        classification.kind,
        classification.confidence * 100.0,
        classification.dimensions.width_inches,
        classification.dimensions.height_inches,
        classification.dimensions.estimated_dpi
    );

    Ok(())
}

fn run_batch(cli: &Cli, options: &CropOptions) -> Result<()> {
    let inputs = collect_images(&cli.input)?;
    if inputs.is_empty() {
        bail!("No images found in {:?}", cli.input);
    }

    let output_dir = cli.output_dir();
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    info!(count = inputs.len(), output = %output_dir.display(), "Processing batch");
    let mut report = process_batch(&inputs, options, &BatchOptions::default());
    let saved = save_outputs(&mut report, &output_dir);
    info!(saved, "Saved cropped images");

    for group in report.print_groups() {
        let names: Vec<String> = group
            .items
            .iter()
            .map(|item| item.source.display().to_string())
            .collect();
        info!(kind = %group.kind, page = group.page + 1, checks = ?names, "Print page");
    }

    let summary = report.summary();
    let summary_path = cli.summary_path();
    let json = serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
    fs::write(&summary_path, json)
        .with_context(|| format!("Failed to write summary: {:?}", summary_path))?;

    eprintln!(
        "Processed {}/{} images ({} cropped, {} errors)",
        summary.total_processed, summary.total_inputs, summary.total_cropped, summary.total_errors
    );
    for (kind, count) in &summary.classification_summary {
        eprintln!("  {}: {} checks", kind, count);
    }
    for failure in &summary.errors {
        eprintln!("  failed {:?}: {}", failure.source, failure.message);
    }
    eprintln!("Summary written to {:?}", summary_path);

    Ok(())
}

/// Image files directly inside `dir`, sorted by name
fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read input directory: {:?}", dir))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}
