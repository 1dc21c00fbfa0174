use serde::Serialize;

use crate::detection::DetectorMethod;

/// Crop bounds within a source image.
///
/// `x2` and `y2` are exclusive. A `CropRect` always satisfies
/// `x1 < x2` and `y1 < y2`; construction goes through [`CropRect::new`]
/// or [`CropRect::from_inclusive`] which enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropRect {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Option<Self> {
        (x1 < x2 && y1 < y2).then_some(Self { x1, y1, x2, y2 })
    }

    /// Build from inclusive pixel extents, as produced by a bounding-box scan
    pub fn from_inclusive(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Option<Self> {
        Self::new(min_x, min_y, max_x.checked_add(1)?, max_y.checked_add(1)?)
    }

    /// The whole image as a rectangle
    pub fn full(width: u32, height: u32) -> Option<Self> {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x2 <= width && self.y2 <= height
    }

    /// Fraction of the image area excluded by this rectangle
    pub fn area_reduction(&self, width: u32, height: u32) -> f64 {
        let total = width as u64 * height as u64;
        if total == 0 {
            return 0.0;
        }
        1.0 - self.area() as f64 / total as f64
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: &CropRect) -> CropRect {
        CropRect {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Expand by `padding` on every side, clamped to the image bounds.
    ///
    /// The rectangle is first clamped to the image, so the result is a valid
    /// in-bounds crop as long as the image is non-empty.
    pub fn pad(&self, padding: u32, width: u32, height: u32) -> Option<CropRect> {
        let x1 = self.x1.min(width.saturating_sub(1)).saturating_sub(padding);
        let y1 = self.y1.min(height.saturating_sub(1)).saturating_sub(padding);
        let x2 = self.x2.saturating_add(padding).min(width);
        let y2 = self.y2.saturating_add(padding).min(height);
        CropRect::new(x1, y1, x2.max(x1 + 1).min(width), y2.max(y1 + 1).min(height))
    }
}

/// A rectangle proposed by one detector, pending validation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    pub rect: CropRect,
    pub method: DetectorMethod,
    pub area_reduction: f64,
}

impl Candidate {
    pub fn new(rect: CropRect, method: DetectorMethod, width: u32, height: u32) -> Self {
        Self {
            rect,
            method,
            area_reduction: rect.area_reduction(width, height),
        }
    }
}

/// Inclusive bounding box accumulator used by the detectors
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoundsAccumulator {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    count: u64,
}

impl BoundsAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
            count: 0,
        }
    }

    pub(crate) fn add(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.count += 1;
    }

    pub(crate) fn rect(&self) -> Option<CropRect> {
        if self.count == 0 {
            return None;
        }
        CropRect::from_inclusive(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}
