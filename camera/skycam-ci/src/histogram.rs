use skycam_types::{BrightnessStats, Mono8Image};

use crate::{BrightnessAnalyzer, Error, Result};

/// Pixels at or below this level count as underexposed.
pub const UNDEREXPOSED_LEVEL: u8 = 5;

/// Pixels at or above this level count as overexposed.
pub const OVEREXPOSED_LEVEL: u8 = 250;

/// Brightness statistics from a 256 bin histogram of a mono8 frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramAnalyzer;

impl HistogramAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

fn histogram(data: &[u8]) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for &px in data {
        hist[px as usize] += 1;
    }
    hist
}

/// Smallest pixel value `v` such that at least `fraction` of all pixels are
/// `<= v`.
fn percentile(hist: &[u64; 256], total: u64, fraction: f64) -> f64 {
    let needed = (fraction * total as f64).ceil().max(1.0) as u64;
    let mut accum = 0;
    for (value, count) in hist.iter().enumerate() {
        accum += count;
        if accum >= needed {
            return value as f64;
        }
    }
    255.0
}

impl BrightnessAnalyzer for HistogramAnalyzer {
    fn analyze(&self, image: &Mono8Image) -> Result<BrightnessStats> {
        let expected = image.width as usize * image.height as usize;
        if expected == 0 || image.data.is_empty() {
            return Err(Error::EmptyImage);
        }
        if image.data.len() < expected {
            return Err(Error::AnalysisError(format!(
                "buffer has {} bytes, {}x{} image needs {}",
                image.data.len(),
                image.width,
                image.height,
                expected
            )));
        }
        let data = &image.data[..expected];
        let hist = histogram(data);
        let total = expected as u64;

        let sum: u64 = hist
            .iter()
            .enumerate()
            .map(|(value, count)| value as u64 * count)
            .sum();
        let under: u64 = hist[..=UNDEREXPOSED_LEVEL as usize].iter().sum();
        let over: u64 = hist[OVEREXPOSED_LEVEL as usize..].iter().sum();

        Ok(BrightnessStats {
            mean: sum as f64 / total as f64,
            median: percentile(&hist, total, 0.5),
            p5: percentile(&hist, total, 0.05),
            p25: percentile(&hist, total, 0.25),
            p75: percentile(&hist, total, 0.75),
            p95: percentile(&hist, total, 0.95),
            underexposed_pct: 100.0 * under as f64 / total as f64,
            overexposed_pct: 100.0 * over as f64 / total as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_image() {
        let im = Mono8Image::new_filled(10, 10, 128);
        let stats = HistogramAnalyzer.analyze(&im).unwrap();
        assert_eq!(stats.mean, 128.0);
        assert_eq!(stats.median, 128.0);
        assert_eq!(stats.p5, 128.0);
        assert_eq!(stats.p95, 128.0);
        assert_eq!(stats.underexposed_pct, 0.0);
        assert_eq!(stats.overexposed_pct, 0.0);
    }

    #[test]
    fn test_dark_sky_with_bright_tail() {
        // 90% of pixels dark, 10% bright: an aurora-like frame
        let mut data = vec![10u8; 90];
        data.extend(std::iter::repeat(200u8).take(10));
        let im = Mono8Image {
            width: 10,
            height: 10,
            data,
        };
        let stats = HistogramAnalyzer.analyze(&im).unwrap();
        assert_eq!(stats.mean, 29.0);
        assert_eq!(stats.median, 10.0);
        assert_eq!(stats.p95, 200.0);
    }

    #[test]
    fn test_clipping_percentages() {
        let mut data = vec![0u8; 25];
        data.extend(std::iter::repeat(255u8).take(25));
        data.extend(std::iter::repeat(128u8).take(50));
        let im = Mono8Image {
            width: 100,
            height: 1,
            data,
        };
        let stats = HistogramAnalyzer.analyze(&im).unwrap();
        assert_eq!(stats.underexposed_pct, 25.0);
        assert_eq!(stats.overexposed_pct, 25.0);
    }

    #[test]
    fn test_empty_and_short_buffers() {
        let im = Mono8Image {
            width: 0,
            height: 0,
            data: vec![],
        };
        assert!(matches!(
            HistogramAnalyzer.analyze(&im),
            Err(Error::EmptyImage)
        ));

        let im = Mono8Image {
            width: 4,
            height: 4,
            data: vec![1, 2, 3],
        };
        assert!(matches!(
            HistogramAnalyzer.analyze(&im),
            Err(Error::AnalysisError(_))
        ));
    }
}
