use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::CropOptions;
use crate::detection::{Detection, DetectorMethod};
use crate::error::{CropError, Result};
use crate::geometry::{Candidate, CropRect};

/// Why a candidate failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Rectangle extends past the image
    OutOfBounds,
    /// Width or height below the minimum pixel floor
    TooSmall,
    /// Crop keeps nearly the whole image; the detector likely saw the frame
    TooLittleReduction,
    /// Crop discards too much; the detector likely latched onto a fragment
    TooMuchReduction,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::OutOfBounds => "outside image bounds",
            RejectReason::TooSmall => "below minimum size",
            RejectReason::TooLittleReduction => "area reduction below band",
            RejectReason::TooMuchReduction => "area reduction above band",
        };
        f.write_str(text)
    }
}

/// What happened when one detector was tried
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    NotFound,
    Rejected {
        rect: CropRect,
        area_reduction: f64,
        reason: RejectReason,
    },
    Accepted {
        rect: CropRect,
        area_reduction: f64,
    },
}

/// One entry of the diagnostic trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub method: DetectorMethod,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::NotFound => write!(f, "{}: no candidate", self.method),
            AttemptOutcome::Rejected {
                rect,
                area_reduction,
                reason,
            } => write!(
                f,
                "{}: ({}, {})-({}, {}) rejected, {} ({:.1}% reduction)",
                self.method,
                rect.x1,
                rect.y1,
                rect.x2,
                rect.y2,
                reason,
                area_reduction * 100.0
            ),
            AttemptOutcome::Accepted {
                rect,
                area_reduction,
            } => write!(
                f,
                "{}: ({}, {})-({}, {}) accepted ({:.1}% reduction)",
                self.method,
                rect.x1,
                rect.y1,
                rect.x2,
                rect.y2,
                area_reduction * 100.0
            ),
        }
    }
}

/// The accepted candidate plus every attempt made to reach it
#[derive(Debug, Clone)]
pub struct Selection {
    pub candidate: Candidate,
    pub attempts: Vec<Attempt>,
}

/// Check a candidate against the validity band and size floor
pub fn validate(
    candidate: &Candidate,
    width: u32,
    height: u32,
    options: &CropOptions,
) -> std::result::Result<(), RejectReason> {
    let rect = candidate.rect;
    if !rect.fits_within(width, height) {
        return Err(RejectReason::OutOfBounds);
    }
    if rect.width() < options.min_dimension_px || rect.height() < options.min_dimension_px {
        return Err(RejectReason::TooSmall);
    }
    if candidate.area_reduction < options.min_area_ratio {
        return Err(RejectReason::TooLittleReduction);
    }
    if candidate.area_reduction > options.max_area_ratio {
        return Err(RejectReason::TooMuchReduction);
    }
    Ok(())
}

/// Accept the first valid candidate in priority order.
///
/// Detections are pulled lazily, so detectors after the accepted one never
/// run. When nothing validates, the error carries the full trail.
pub fn select_candidate<I>(
    detections: I,
    width: u32,
    height: u32,
    options: &CropOptions,
) -> Result<Selection>
where
    I: IntoIterator<Item = (DetectorMethod, Detection)>,
{
    let mut attempts = Vec::new();

    for (method, detection) in detections {
        let rect = match detection {
            Detection::Found(rect) => rect,
            Detection::NotFound => {
                attempts.push(Attempt {
                    method,
                    outcome: AttemptOutcome::NotFound,
                });
                continue;
            }
        };

        let candidate = Candidate::new(rect, method, width, height);
        match validate(&candidate, width, height, options) {
            Ok(()) => {
                info!(
                    %method,
                    ?rect,
                    area_reduction = candidate.area_reduction,
                    "Candidate accepted"
                );
                attempts.push(Attempt {
                    method,
                    outcome: AttemptOutcome::Accepted {
                        rect,
                        area_reduction: candidate.area_reduction,
                    },
                });
                return Ok(Selection {
                    candidate,
                    attempts,
                });
            }
            Err(reason) => {
                debug!(%method, ?rect, %reason, "Candidate rejected");
                attempts.push(Attempt {
                    method,
                    outcome: AttemptOutcome::Rejected {
                        rect,
                        area_reduction: candidate.area_reduction,
                        reason,
                    },
                });
            }
        }
    }

    Err(CropError::NoValidBoundary { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x1: u32, y1: u32, x2: u32, y2: u32) -> CropRect {
        CropRect::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn test_first_valid_wins() {
        let options = CropOptions::default();
        let detections = vec![
            (DetectorMethod::Canny, Detection::NotFound),
            // 95% of the frame, too little reduction
            (DetectorMethod::AdaptiveThreshold, Detection::Found(rect(5, 5, 795, 595))),
            (DetectorMethod::MorphologicalContour, Detection::Found(rect(200, 150, 600, 450))),
            (DetectorMethod::EdgeDensity, Detection::Found(rect(100, 100, 700, 500))),
        ];

        let selection = select_candidate(detections, 800, 600, &options).unwrap();
        assert_eq!(selection.candidate.method, DetectorMethod::MorphologicalContour);
        assert_eq!(selection.candidate.rect, rect(200, 150, 600, 450));
        assert_eq!(selection.attempts.len(), 3);
        assert!(matches!(
            selection.attempts[1].outcome,
            AttemptOutcome::Rejected {
                reason: RejectReason::TooLittleReduction,
                ..
            }
        ));
    }

    #[test]
    fn test_stops_pulling_after_acceptance() {
        let options = CropOptions::default();
        let mut pulled = 0;
        let detections = DetectorMethod::PRIORITY.into_iter().map(|method| {
            pulled += 1;
            (method, Detection::Found(rect(100, 100, 500, 400)))
        });
        let selection = select_candidate(detections, 800, 600, &options).unwrap();
        assert_eq!(selection.candidate.method, DetectorMethod::Canny);
        assert_eq!(pulled, 1);
    }

    #[test]
    fn test_no_valid_candidate_reports_trail() {
        let options = CropOptions::default();
        let detections = vec![
            (DetectorMethod::Canny, Detection::Found(rect(0, 0, 10, 10))),
            (DetectorMethod::AdaptiveThreshold, Detection::Found(rect(0, 0, 800, 600))),
            (DetectorMethod::Brightness, Detection::NotFound),
        ];
        let err = select_candidate(detections, 800, 600, &options).unwrap_err();
        let attempts = err.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(matches!(
            attempts[0].outcome,
            AttemptOutcome::Rejected { reason: RejectReason::TooSmall, .. }
        ));
        assert!(matches!(
            attempts[1].outcome,
            AttemptOutcome::Rejected { reason: RejectReason::TooLittleReduction, .. }
        ));
        assert_eq!(attempts[2].outcome, AttemptOutcome::NotFound);
    }

    #[test]
    fn test_validity_band_edges() {
        let options = CropOptions::default();
        // 50x50 of 100x100 removes 75%
        let ok = Candidate::new(rect(0, 0, 50, 50), DetectorMethod::Canny, 100, 100);
        assert!(validate(&ok, 100, 100, &options).is_ok());
        // 30x30 removes 91%
        let aggressive = Candidate::new(rect(0, 0, 30, 30), DetectorMethod::Canny, 100, 100);
        assert_eq!(
            validate(&aggressive, 100, 100, &options),
            Err(RejectReason::TooMuchReduction)
        );
        let outside = Candidate::new(rect(50, 50, 120, 90), DetectorMethod::Canny, 100, 100);
        assert_eq!(
            validate(&outside, 100, 100, &options),
            Err(RejectReason::OutOfBounds)
        );
    }

    #[test]
    fn test_attempt_display() {
        let attempt = Attempt {
            method: DetectorMethod::EdgeDensity,
            outcome: AttemptOutcome::NotFound,
        };
        assert_eq!(attempt.to_string(), "edge density: no candidate");
    }
}
