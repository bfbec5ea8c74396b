//! Brightness feedback: a multiplicative correction factor, the emergency
//! zone factor and the sticky over/under-exposure alarms.

use serde::Serialize;
use skycam_exposure_config::FeedbackConfig;
use skycam_types::{BrightnessStats, Severity};

pub const MIN_CORRECTION: f64 = 0.3;
pub const MAX_CORRECTION: f64 = 4.0;
pub const MIN_EMERGENCY: f64 = 0.5;
pub const MAX_EMERGENCY: f64 = 1.5;

const WARNING_LOW_FACTOR: f64 = 1.2;
const WARNING_HIGH_FACTOR: f64 = 0.85;
const CRITICAL_HIGH_FACTOR: f64 = 0.7;
const CRITICAL_LOW_MIN_FACTOR: f64 = 1.4;
const CRITICAL_LOW_MAX_FACTOR: f64 = 2.0;

/// Feedback part of the controller state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackState {
    /// Brightness correction factor, centred at 1.0.
    pub correction: f64,
    /// Smoothed emergency zone factor, within `[0.5, 1.5]`.
    pub emergency: f64,
    pub over_exposed: Option<Severity>,
    pub under_exposed: Option<Severity>,
}

impl Default for FeedbackState {
    fn default() -> Self {
        Self {
            correction: 1.0,
            emergency: 1.0,
            over_exposed: None,
            under_exposed: None,
        }
    }
}

impl FeedbackState {
    /// The factor applied to the exposure target.
    pub fn total_factor(&self) -> f64 {
        self.correction * self.emergency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrightnessZone {
    CriticalLow,
    WarningLow,
    Normal,
    WarningHigh,
    CriticalHigh,
}

#[derive(Debug, Clone)]
pub struct FeedbackController {
    cfg: FeedbackConfig,
}

impl FeedbackController {
    pub fn new(cfg: FeedbackConfig) -> Self {
        Self { cfg }
    }

    pub fn zone(&self, brightness: f64) -> BrightnessZone {
        let c = &self.cfg;
        if brightness < c.critical_low {
            BrightnessZone::CriticalLow
        } else if brightness < c.warning_low {
            BrightnessZone::WarningLow
        } else if brightness > c.critical_high {
            BrightnessZone::CriticalHigh
        } else if brightness > c.warning_high {
            BrightnessZone::WarningHigh
        } else {
            BrightnessZone::Normal
        }
    }

    /// The emergency factor the zone of `brightness` asks for. In the
    /// critical-low zone it grows towards black.
    pub fn zone_target(&self, brightness: f64) -> f64 {
        match self.zone(brightness) {
            BrightnessZone::CriticalLow => {
                let depth = (1.0 - brightness.max(0.0) / self.cfg.critical_low).clamp(0.0, 1.0);
                CRITICAL_LOW_MIN_FACTOR + (CRITICAL_LOW_MAX_FACTOR - CRITICAL_LOW_MIN_FACTOR) * depth
            }
            BrightnessZone::WarningLow => WARNING_LOW_FACTOR,
            BrightnessZone::Normal => 1.0,
            BrightnessZone::WarningHigh => WARNING_HIGH_FACTOR,
            BrightnessZone::CriticalHigh => CRITICAL_HIGH_FACTOR,
        }
    }

    /// Urgency multiplier for an absolute brightness error.
    pub fn urgency(abs_error: f64) -> f64 {
        if abs_error <= 30.0 {
            1.0
        } else if abs_error <= 60.0 {
            1.5
        } else if abs_error <= 90.0 {
            2.0
        } else {
            3.0
        }
    }

    pub fn update_correction(&self, st: &mut FeedbackState, brightness: f64) {
        if !brightness.is_finite() {
            return;
        }
        let target = self.cfg.target_brightness;
        let error = brightness - target;
        if error.abs() <= self.cfg.tolerance {
            st.correction += self.cfg.decay_rate * (1.0 - st.correction);
            return;
        }
        let error_pct = error / target;
        let strength = self.cfg.strength * Self::urgency(error.abs());
        let step = (1.0 - error_pct * strength)
            .clamp(1.0 / self.cfg.max_step_ratio, self.cfg.max_step_ratio);
        st.correction = (st.correction * step).clamp(MIN_CORRECTION, MAX_CORRECTION);
        tracing::trace!(
            "brightness {brightness:.1} error {error:+.1}: correction step {step:.3} -> {:.3}",
            st.correction
        );
    }

    pub fn update_emergency(&self, st: &mut FeedbackState, brightness: f64) {
        if !brightness.is_finite() {
            return;
        }
        let target = self.zone_target(brightness);
        self.smooth_emergency(st, target);
    }

    fn smooth_emergency(&self, st: &mut FeedbackState, target: f64) {
        let speed = if (target - 1.0).abs() > (st.emergency - 1.0).abs() {
            self.cfg.emergency_attack
        } else {
            self.cfg.emergency_release
        };
        st.emergency = (st.emergency + speed * (target - st.emergency)).clamp(MIN_EMERGENCY, MAX_EMERGENCY);
    }

    fn detect_over(&self, stats: &BrightnessStats) -> Option<Severity> {
        let c = &self.cfg;
        if stats.mean >= c.over_critical_mean || stats.overexposed_pct >= c.over_critical_clip_pct {
            Some(Severity::Critical)
        } else if stats.mean >= c.over_warning_mean || stats.overexposed_pct >= c.over_warning_clip_pct
        {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    fn detect_under(&self, stats: &BrightnessStats) -> Option<Severity> {
        let c = &self.cfg;
        if stats.mean <= c.under_critical_mean || stats.underexposed_pct >= c.under_critical_clip_pct
        {
            Some(Severity::Critical)
        } else if stats.mean <= c.under_warning_mean
            || stats.underexposed_pct >= c.under_warning_clip_pct
        {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Set or clear the alarms. A detected level takes effect at once; an
    /// alarm clears only once the frame is comfortably back inside the
    /// warning limits.
    pub fn update_alarms(&self, st: &mut FeedbackState, stats: &BrightnessStats) {
        let c = &self.cfg;

        match self.detect_over(stats) {
            Some(level) => {
                if st.over_exposed != Some(level) {
                    tracing::warn!(
                        "over-exposure {level:?}: mean {:.1}, {:.1}% clipped",
                        stats.mean,
                        stats.overexposed_pct
                    );
                }
                st.over_exposed = Some(level);
            }
            None => {
                if st.over_exposed.is_some()
                    && stats.mean < c.over_warning_mean - c.clear_margin
                    && stats.overexposed_pct < c.over_warning_clip_pct / 2.0
                {
                    tracing::info!("over-exposure cleared at mean {:.1}", stats.mean);
                    st.over_exposed = None;
                }
            }
        }

        match self.detect_under(stats) {
            Some(level) => {
                if st.under_exposed != Some(level) {
                    tracing::warn!(
                        "under-exposure {level:?}: mean {:.1}, {:.1}% black",
                        stats.mean,
                        stats.underexposed_pct
                    );
                }
                st.under_exposed = Some(level);
            }
            None => {
                if st.under_exposed.is_some()
                    && stats.mean > c.under_warning_mean + c.clear_margin
                    && stats.underexposed_pct < c.under_warning_clip_pct / 2.0
                {
                    tracing::info!("under-exposure cleared at mean {:.1}", stats.mean);
                    st.under_exposed = None;
                }
            }
        }
    }

    /// Full update from a manually exposed frame.
    pub fn update(&self, st: &mut FeedbackState, stats: &BrightnessStats) {
        self.update_correction(st, stats.mean);
        self.update_emergency(st, stats.mean);
        self.update_alarms(st, stats);
    }

    /// Relax towards neutral while the camera runs its own auto exposure.
    pub fn relax(&self, st: &mut FeedbackState) {
        st.correction += self.cfg.decay_rate * (1.0 - st.correction);
        self.smooth_emergency(st, 1.0);
        st.over_exposed = None;
        st.under_exposed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fc() -> FeedbackController {
        FeedbackController::new(FeedbackConfig::default())
    }

    #[test]
    fn test_converges_at_target() {
        let fc = fc();
        let mut st = FeedbackState {
            correction: 2.5,
            ..Default::default()
        };
        for _ in 0..200 {
            fc.update(&mut st, &BrightnessStats::uniform(120.0));
        }
        assert_relative_eq!(st.correction, 1.0, epsilon = 1e-6);
        assert_relative_eq!(st.emergency, 1.0, epsilon = 1e-6);

        // and stays there
        for _ in 0..50 {
            fc.update(&mut st, &BrightnessStats::uniform(120.0));
            assert_relative_eq!(st.correction, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_direction_and_urgency() {
        let fc = fc();

        let mut st = FeedbackState::default();
        fc.update_correction(&mut st, 150.0);
        // error +30, urgency 1.0: 1 - 0.25 * 0.3
        assert_relative_eq!(st.correction, 0.925, max_relative = 1e-12);

        let mut st = FeedbackState::default();
        fc.update_correction(&mut st, 60.0);
        // error -60, urgency 1.5: 1 + 0.5 * 0.45
        assert_relative_eq!(st.correction, 1.225, max_relative = 1e-12);

        assert_eq!(FeedbackController::urgency(91.0), 3.0);
    }

    #[test]
    fn test_correction_is_bounded() {
        let fc = fc();
        let mut st = FeedbackState::default();
        for _ in 0..100 {
            fc.update_correction(&mut st, 0.0);
        }
        assert_relative_eq!(st.correction, MAX_CORRECTION);
        for _ in 0..100 {
            fc.update_correction(&mut st, 255.0);
        }
        assert_relative_eq!(st.correction, MIN_CORRECTION);
    }

    #[test]
    fn test_zones() {
        let fc = fc();
        assert_eq!(fc.zone(10.0), BrightnessZone::CriticalLow);
        assert_eq!(fc.zone(30.0), BrightnessZone::WarningLow);
        assert_eq!(fc.zone(120.0), BrightnessZone::Normal);
        assert_eq!(fc.zone(200.0), BrightnessZone::WarningHigh);
        assert_eq!(fc.zone(240.0), BrightnessZone::CriticalHigh);
        assert_relative_eq!(fc.zone_target(0.0), 2.0);
        assert_relative_eq!(fc.zone_target(10.0), 1.7, max_relative = 1e-12);
        assert_relative_eq!(fc.zone_target(240.0), 0.7);
    }

    #[test]
    fn test_emergency_factor_is_bounded() {
        let fc = fc();
        let mut st = FeedbackState::default();
        // a deterministic pseudo random brightness sequence
        let mut x: u32 = 12345;
        for _ in 0..5000 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let brightness = (x >> 16) as f64 % 256.0;
            fc.update_emergency(&mut st, brightness);
            assert!((MIN_EMERGENCY..=MAX_EMERGENCY).contains(&st.emergency));
        }
        for b in [f64::NAN, f64::INFINITY, -1000.0, 1000.0] {
            fc.update_emergency(&mut st, b);
            assert!((MIN_EMERGENCY..=MAX_EMERGENCY).contains(&st.emergency));
        }
    }

    #[test]
    fn test_emergency_attack_and_release() {
        let fc = fc();
        let mut st = FeedbackState::default();
        fc.update_emergency(&mut st, 240.0);
        // attack: 1 + 0.5 * (0.7 - 1)
        assert_relative_eq!(st.emergency, 0.85, max_relative = 1e-12);
        fc.update_emergency(&mut st, 120.0);
        // release: 0.85 + 0.2 * (1 - 0.85)
        assert_relative_eq!(st.emergency, 0.88, max_relative = 1e-12);
    }

    #[test]
    fn test_alarms_are_sticky() {
        let fc = fc();
        let mut st = FeedbackState::default();

        let mut stats = BrightnessStats::uniform(235.0);
        fc.update_alarms(&mut st, &stats);
        assert_eq!(st.over_exposed, Some(Severity::Critical));

        // below the warning mean but not by the clear margin
        stats = BrightnessStats::uniform(190.0);
        fc.update_alarms(&mut st, &stats);
        assert_eq!(st.over_exposed, Some(Severity::Critical));

        // inside the margin, but still clipping
        stats = BrightnessStats::uniform(150.0);
        stats.overexposed_pct = 4.0;
        fc.update_alarms(&mut st, &stats);
        assert!(st.over_exposed.is_some());

        stats.overexposed_pct = 1.0;
        fc.update_alarms(&mut st, &stats);
        assert_eq!(st.over_exposed, None);
        assert_eq!(st.under_exposed, None);
    }

    #[test]
    fn test_under_alarm_from_clipping() {
        let fc = fc();
        let mut st = FeedbackState::default();
        let mut stats = BrightnessStats::uniform(70.0);
        stats.underexposed_pct = 35.0;
        fc.update_alarms(&mut st, &stats);
        assert_eq!(st.under_exposed, Some(Severity::Warning));
        stats.underexposed_pct = 65.0;
        fc.update_alarms(&mut st, &stats);
        assert_eq!(st.under_exposed, Some(Severity::Critical));
    }

    #[test]
    fn test_relax() {
        let fc = fc();
        let mut st = FeedbackState {
            correction: 2.0,
            emergency: 1.5,
            over_exposed: Some(Severity::Warning),
            under_exposed: None,
        };
        fc.relax(&mut st);
        assert_relative_eq!(st.correction, 1.9, max_relative = 1e-12);
        assert_relative_eq!(st.emergency, 1.4, max_relative = 1e-12);
        assert!(st.over_exposed.is_none());
    }
}
