//! Ambient light estimation from a short test exposure.

use serde::Serialize;
use skycam_exposure_config::LuxConfig;
use skycam_types::{BrightnessStats, FrameMetadata, seconds_to_us};

/// Mean brightness which corresponds to a "correctly" exposed test shot.
const MID_GREY: f64 = 128.0;

/// Test shots at least this bright are clipped and only bound the lux from
/// below.
const CLIPPED_MEAN: f64 = 250.0;

/// Where a lux estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LuxSource {
    /// Computed from the test shot's mean brightness.
    Brightness,
    /// Reported by the camera's ISP.
    Metadata,
    /// Nothing usable, the configured default.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LuxEstimate {
    pub lux: f64,
    pub source: LuxSource,
}

#[derive(Debug, Clone)]
pub struct LuxEstimator {
    cfg: LuxConfig,
}

impl LuxEstimator {
    pub fn new(cfg: LuxConfig) -> Self {
        Self { cfg }
    }

    /// Exposure (microseconds) and gain to request for the test shot.
    pub fn test_shot_settings(&self) -> (u64, f64) {
        (seconds_to_us(self.cfg.test_exposure_s), self.cfg.test_gain)
    }

    /// The estimate used when nothing was measured at all.
    pub fn default_estimate(&self) -> LuxEstimate {
        LuxEstimate {
            lux: self.clamp(self.cfg.default_lux),
            source: LuxSource::Default,
        }
    }

    /// `(mean/128) * (1/exposure) * (1/gain) * calibration`, or `None` when
    /// the inputs cannot give a meaningful value.
    pub fn lux_from_brightness(&self, mean: f64, exposure_s: f64, gain: f64) -> Option<f64> {
        if !(mean.is_finite() && exposure_s.is_finite() && gain.is_finite()) {
            return None;
        }
        if mean < 0.0 || exposure_s <= 0.0 || gain <= 0.0 {
            return None;
        }
        Some((mean / MID_GREY) * (1.0 / exposure_s) * (1.0 / gain) * self.cfg.calibration_constant)
    }

    /// Estimate lux for a test shot. Never fails.
    ///
    /// `stats` is `None` when brightness analysis failed. The exposure and
    /// gain the camera actually used are taken from `metadata`, falling back
    /// to the requested test shot settings. A clipped test shot defers to a
    /// higher metadata lux.
    pub fn estimate(
        &self,
        stats: Option<&BrightnessStats>,
        metadata: &FrameMetadata,
    ) -> LuxEstimate {
        let exposure_s = if metadata.exposure_time_us > 0 {
            metadata.exposure_s()
        } else {
            self.cfg.test_exposure_s
        };
        let gain = if metadata.analogue_gain.is_finite() && metadata.analogue_gain > 0.0 {
            metadata.analogue_gain
        } else {
            self.cfg.test_gain
        };

        let metadata_lux = metadata.lux.filter(|l| l.is_finite() && *l > 0.0);

        if let Some(stats) = stats {
            if let Some(lux) = self.lux_from_brightness(stats.mean, exposure_s, gain) {
                if stats.mean >= CLIPPED_MEAN {
                    if let Some(meta_lux) = metadata_lux.filter(|m| *m > lux) {
                        tracing::debug!(
                            "test shot clipped at {lux:.1} lux, using metadata lux {meta_lux:.1}"
                        );
                        return LuxEstimate {
                            lux: self.clamp(meta_lux),
                            source: LuxSource::Metadata,
                        };
                    }
                }
                return LuxEstimate {
                    lux: self.clamp(lux),
                    source: LuxSource::Brightness,
                };
            }
        }

        if let Some(lux) = metadata_lux {
            tracing::debug!("no brightness based lux, using metadata lux {lux:.3}");
            return LuxEstimate {
                lux: self.clamp(lux),
                source: LuxSource::Metadata,
            };
        }

        tracing::debug!("no lux estimate available, using default");
        self.default_estimate()
    }

    fn clamp(&self, lux: f64) -> f64 {
        lux.clamp(self.cfg.min_lux, self.cfg.max_lux)
    }
}
