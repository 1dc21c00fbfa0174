pub mod batch;
pub mod classify;
pub mod cli;
pub mod config;
pub mod detection;
pub mod error;
pub mod geometry;
pub mod leveling;
pub mod orientation;
pub mod pipeline;
pub mod selection;
pub mod stats;
pub mod transform;

pub use batch::{
    process_batch, process_images, save_outputs, BatchOptions, BatchReport, BatchSummary,
    PrintGroup,
};
pub use classify::{classify, CheckKind, Classification};
pub use cli::Cli;
pub use config::{CropOptions, LevelIntensity, LevelMethod, OrientationOptions};
pub use detection::{Detection, DetectorMethod};
pub use error::{CropError, Result};
pub use geometry::{Candidate, CropRect};
pub use leveling::{level_background, try_level_background};
pub use orientation::{detect_orientation, rotate, Orientation};
pub use pipeline::{detect_and_crop, load_image, save_image, CropResult};
pub use selection::{Attempt, AttemptOutcome, RejectReason};
pub use stats::ImageStats;
pub use transform::apply_crop;
