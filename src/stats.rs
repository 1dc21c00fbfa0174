use image::GrayImage;
use serde::Serialize;

/// Brightness statistics of a grayscale image
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: u8,
    pub max: u8,
}

impl ImageStats {
    pub fn compute(gray: &GrayImage) -> Self {
        let n = gray.width() as u64 * gray.height() as u64;
        if n == 0 {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
                min: 0,
                max: 0,
            };
        }

        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        let mut min = u8::MAX;
        let mut max = u8::MIN;
        for pixel in gray.pixels() {
            let v = pixel[0];
            sum += v as u64;
            sum_sq += v as u64 * v as u64;
            min = min.min(v);
            max = max.max(v);
        }

        let mean = sum as f64 / n as f64;
        let variance = (sum_sq as f64 / n as f64 - mean * mean).max(0.0);

        Self {
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
        }
    }

    pub fn dynamic_range(&self) -> u8 {
        self.max - self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_uniform_stats() {
        let img = GrayImage::from_pixel(10, 10, Luma([128]));
        let stats = ImageStats::compute(&img);
        assert_eq!(stats.mean, 128.0);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.dynamic_range(), 0);
    }

    #[test]
    fn test_two_level_stats() {
        let mut img = GrayImage::from_pixel(2, 1, Luma([0]));
        img.put_pixel(1, 0, Luma([200]));
        let stats = ImageStats::compute(&img);
        assert_eq!(stats.mean, 100.0);
        assert!((stats.std_dev - 100.0).abs() < 1e-9);
        assert_eq!((stats.min, stats.max), (0, 200));
    }

    #[test]
    fn test_empty_image() {
        let img = GrayImage::new(0, 0);
        assert_eq!(ImageStats::compute(&img).mean, 0.0);
    }
}
