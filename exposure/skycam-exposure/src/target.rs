//! Closed-form exposure and gain targets, including the sequential ramp used
//! through twilight after an automatic to manual handover.

use serde::Serialize;
use skycam_exposure_config::{ModeConfig, TargetConfig};
use skycam_types::LightMode;

/// Which quantity the sequential ramp is currently moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RampPhase {
    /// Exposure moves from the seed towards its night-end value, gain held
    /// at the seed.
    Exposure,
    /// Exposure at its night-end value, gain moves towards the night-end gain.
    Gain,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Targets {
    pub exposure_s: f64,
    pub gain: f64,
    /// 0 at the day threshold, 1 at the night threshold.
    pub transition_position: f64,
    /// Set when the sequential ramp produced these targets.
    pub ramp: Option<RampPhase>,
}

/// Exposure and gain a manual episode starts from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStart {
    pub exposure_s: f64,
    pub gain: f64,
}

#[derive(Debug, Clone)]
pub struct TargetCalculator {
    cfg: TargetConfig,
    night_lux_threshold: f64,
    ln_night_threshold: f64,
    ln_day_threshold: f64,
}

impl TargetCalculator {
    pub fn new(cfg: TargetConfig, mode: &ModeConfig) -> Self {
        Self {
            cfg,
            night_lux_threshold: mode.night_lux_threshold,
            ln_night_threshold: mode.night_lux_threshold.ln(),
            ln_day_threshold: mode.day_lux_threshold.ln(),
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    pub fn clamp_exposure(&self, exposure_s: f64) -> f64 {
        if exposure_s.is_nan() {
            return self.cfg.max_night_exposure_s;
        }
        exposure_s.clamp(self.cfg.min_day_exposure_s, self.cfg.max_night_exposure_s)
    }

    pub fn clamp_gain(&self, gain: f64) -> f64 {
        if gain.is_nan() {
            return self.cfg.min_gain;
        }
        gain.clamp(self.cfg.min_gain, self.cfg.max_gain)
    }

    /// `max_night_exposure * reference_lux / lux`, clamped. Darkness (zero,
    /// negative or non-finite lux) gives the longest exposure.
    pub fn exposure_for_lux(&self, lux: f64) -> f64 {
        if !(lux.is_finite() && lux > 0.0) {
            return self.cfg.max_night_exposure_s;
        }
        self.clamp_exposure(self.cfg.max_night_exposure_s * self.cfg.reference_lux / lux)
    }

    /// Logarithmic interpolation from the night gain at the low end of the
    /// lux window to the day gain at the high end.
    pub fn gain_for_lux(&self, lux: f64) -> f64 {
        let [lo, hi] = self.cfg.gain_lux_window;
        let t = if lux.is_nan() || lux <= lo {
            0.0
        } else if lux >= hi {
            1.0
        } else {
            (lux.ln() - lo.ln()) / (hi.ln() - lo.ln())
        };
        self.clamp_gain(log_lerp(self.cfg.night_gain, self.cfg.day_gain, t))
    }

    /// Position within the transition band, in `[0, 1]`.
    pub fn transition_position(&self, lux: f64) -> f64 {
        if !(lux > 0.0) {
            return 1.0;
        }
        let p = (self.ln_day_threshold - lux.ln()) / (self.ln_day_threshold - self.ln_night_threshold);
        p.clamp(0.0, 1.0)
    }

    /// Targets from the formula alone.
    pub fn formula(&self, lux: f64) -> Targets {
        Targets {
            exposure_s: self.exposure_for_lux(lux),
            gain: self.gain_for_lux(lux),
            transition_position: self.transition_position(lux),
            ramp: None,
        }
    }

    /// Targets for `mode`. In transition mode with a handover seed, the
    /// sequential ramp replaces the formula.
    pub fn compute(&self, mode: LightMode, lux: f64, seed: Option<RampStart>) -> Targets {
        match (mode, seed) {
            (LightMode::Transition, Some(start)) => self.sequential_ramp(lux, start),
            _ => self.formula(lux),
        }
    }

    /// Where the sequential ramp ends: the formula at the night threshold,
    /// so night mode carries on from it without a step.
    pub fn ramp_end(&self) -> RampStart {
        RampStart {
            exposure_s: self.exposure_for_lux(self.night_lux_threshold),
            gain: self.gain_for_lux(self.night_lux_threshold),
        }
    }

    /// Fraction of the transition axis spent ramping exposure, from the
    /// ratio of the exposure-only EV range to the total EV range.
    pub fn phase_boundary(&self, start: RampStart) -> f64 {
        let end = self.ramp_end();
        let start_exposure = self.clamp_exposure(start.exposure_s);
        let start_gain = self.clamp_gain(start.gain);
        let exposure_range = (end.exposure_s.ln() - start_exposure.ln()).abs();
        let gain_range = (end.gain.ln() - start_gain.ln()).abs();
        let total = exposure_range + gain_range;
        if total <= f64::EPSILON {
            return 0.5;
        }
        (exposure_range / total).clamp(0.1, 0.9)
    }

    fn sequential_ramp(&self, lux: f64, start: RampStart) -> Targets {
        let p = self.transition_position(lux);
        let boundary = self.phase_boundary(start);
        let end = self.ramp_end();
        let start_exposure = self.clamp_exposure(start.exposure_s);
        let start_gain = self.clamp_gain(start.gain);

        let (exposure_s, gain, phase) = if p < boundary {
            let t = p / boundary;
            (
                log_lerp(start_exposure, end.exposure_s, t),
                start_gain,
                RampPhase::Exposure,
            )
        } else {
            let t = (p - boundary) / (1.0 - boundary);
            (
                end.exposure_s,
                log_lerp(start_gain, end.gain, t),
                RampPhase::Gain,
            )
        };
        tracing::trace!("sequential ramp p={p:.3} boundary={boundary:.3} phase={phase:?}");

        Targets {
            exposure_s: self.clamp_exposure(exposure_s),
            gain: self.clamp_gain(gain),
            transition_position: p,
            ramp: Some(phase),
        }
    }
}

/// Interpolate between two positive values in log space.
pub(crate) fn log_lerp(from: f64, to: f64, t: f64) -> f64 {
    (from.ln() + t * (to.ln() - from.ln())).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lux::LuxEstimator;
    use approx::assert_relative_eq;
    use skycam_exposure_config::ExposureConfig;

    fn calc() -> TargetCalculator {
        TargetCalculator::new(TargetConfig::default(), &ModeConfig::default())
    }

    #[test]
    fn test_inverse_exposure_law() {
        let tc = calc();
        let cfg = TargetConfig::default();
        let k = cfg.max_night_exposure_s * cfg.reference_lux;
        assert_relative_eq!(tc.exposure_for_lux(10.0), k / 10.0, max_relative = 1e-12);
        assert_relative_eq!(tc.exposure_for_lux(100.0), k / 100.0, max_relative = 1e-12);
        assert_relative_eq!(tc.exposure_for_lux(cfg.reference_lux), 20.0);
        assert_relative_eq!(tc.exposure_for_lux(0.001), 20.0);
        assert_relative_eq!(tc.exposure_for_lux(1e7), 1e-4);
    }

    #[test]
    fn test_mid_band_frame_hits_brightness_target() {
        let cfg = ExposureConfig::default();
        let tc = TargetCalculator::new(cfg.target.clone(), &cfg.mode);
        let est = LuxEstimator::new(cfg.lux.clone());
        let target = cfg.feedback.target_brightness;

        let mid = (cfg.mode.night_lux_threshold * cfg.mode.day_lux_threshold).sqrt();
        let t = tc.formula(mid);
        // brightness the estimator would turn back into `mid` at these settings
        let per_unit = est.lux_from_brightness(1.0, t.exposure_s, t.gain).unwrap();
        let brightness = mid / per_unit;
        assert!(
            (brightness - target).abs() <= cfg.feedback.tolerance,
            "mid band frame at {brightness:.1}"
        );
    }

    #[test]
    fn test_extremes_stay_in_bounds() {
        let tc = calc();
        let cfg = TargetConfig::default();
        for lux in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e-9, 100_000.0, 1e12] {
            let t = tc.formula(lux);
            assert!(t.exposure_s >= cfg.min_day_exposure_s, "lux {lux}");
            assert!(t.exposure_s <= cfg.max_night_exposure_s, "lux {lux}");
            assert!(t.gain >= cfg.min_gain && t.gain <= cfg.max_gain, "lux {lux}");
            assert!((0.0..=1.0).contains(&t.transition_position));
        }
    }

    #[test]
    fn test_gain_window() {
        let tc = calc();
        assert_relative_eq!(tc.gain_for_lux(0.5), 8.0);
        assert_relative_eq!(tc.gain_for_lux(1.0), 8.0);
        assert_relative_eq!(tc.gain_for_lux(500.0), 1.0);
        assert_relative_eq!(tc.gain_for_lux(5000.0), 1.0);
        // geometric midpoint of the window gives the geometric mean gain
        let mid = (500.0f64).sqrt();
        assert_relative_eq!(tc.gain_for_lux(mid), 8.0f64.sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn test_transition_position() {
        let tc = calc();
        assert_relative_eq!(tc.transition_position(100.0), 0.0);
        assert_relative_eq!(tc.transition_position(10.0), 1.0);
        assert_relative_eq!(tc.transition_position(1000.0), 0.0);
        assert_relative_eq!(tc.transition_position(1.0), 1.0);
        assert_relative_eq!(
            tc.transition_position(10f64.powf(1.5)),
            0.5,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_ramp_ends_on_night_formula() {
        let tc = calc();
        let end = tc.ramp_end();
        let night = tc.formula(10.0);
        assert_relative_eq!(end.exposure_s, night.exposure_s);
        assert_relative_eq!(end.gain, night.gain);
    }

    #[test]
    fn test_sequential_ramp_phases() {
        let tc = calc();
        let end = tc.ramp_end();
        let start = RampStart {
            exposure_s: 0.002,
            gain: 1.0,
        };
        let boundary = tc.phase_boundary(start);
        let exposure_range = (end.exposure_s / 0.002).ln();
        let expected = exposure_range / (exposure_range + end.gain.ln());
        assert_relative_eq!(boundary, expected, max_relative = 1e-12);

        // at the day threshold the ramp starts from the seed
        let t = tc.compute(LightMode::Transition, 100.0, Some(start));
        assert_eq!(t.ramp, Some(RampPhase::Exposure));
        assert_relative_eq!(t.exposure_s, 0.002, max_relative = 1e-12);
        assert_relative_eq!(t.gain, 1.0);

        // halfway through the exposure phase gain is still held
        let lux_at = |p: f64| (100f64.ln() - p * (100f64.ln() - 10f64.ln())).exp();
        let t = tc.compute(LightMode::Transition, lux_at(boundary / 2.0), Some(start));
        assert_eq!(t.ramp, Some(RampPhase::Exposure));
        assert_relative_eq!(t.gain, 1.0);
        assert_relative_eq!(
            t.exposure_s,
            (0.002 * end.exposure_s).sqrt(),
            max_relative = 1e-9
        );

        // at the night threshold both have arrived
        let t = tc.compute(LightMode::Transition, 10.0, Some(start));
        assert_eq!(t.ramp, Some(RampPhase::Gain));
        assert_relative_eq!(t.exposure_s, end.exposure_s, max_relative = 1e-12);
        assert_relative_eq!(t.gain, end.gain, max_relative = 1e-12);
    }

    #[test]
    fn test_phase_boundary_is_clamped() {
        let tc = calc();
        let end = tc.ramp_end();
        // exposure already at its end value: all of the range is gain
        let b = tc.phase_boundary(RampStart {
            exposure_s: end.exposure_s,
            gain: 1.0,
        });
        assert_relative_eq!(b, 0.1);
        // gain already at its end value: all of the range is exposure
        let b = tc.phase_boundary(RampStart {
            exposure_s: 1e-4,
            gain: end.gain,
        });
        assert_relative_eq!(b, 0.9);
    }

    #[test]
    fn test_formula_without_seed() {
        let tc = calc();
        let t = tc.compute(LightMode::Transition, 50.0, None);
        assert!(t.ramp.is_none());
        assert_relative_eq!(t.exposure_s, tc.exposure_for_lux(50.0));
        let seed = RampStart {
            exposure_s: 0.002,
            gain: 1.0,
        };
        let t = tc.compute(LightMode::Night, 50.0, Some(seed));
        assert!(t.ramp.is_none());
    }
}
