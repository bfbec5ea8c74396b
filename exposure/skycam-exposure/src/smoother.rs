//! Per-cycle interpolation of the emitted control values towards their
//! targets: log-space for exposure, linear for gain and white balance.

use serde::Serialize;
use skycam_exposure_config::{SmoothingConfig, TargetConfig, WhiteBalanceConfig};
use skycam_types::{ColourGains, LightMode, Severity};

use crate::feedback::FeedbackState;

/// Smoother part of the controller state. Unset until the first update or
/// a handover seed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SmootherState {
    pub exposure_s: Option<f64>,
    pub gain: Option<f64>,
    pub wb: Option<ColourGains>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SmoothedValues {
    pub exposure_s: f64,
    pub gain: f64,
    pub wb: ColourGains,
    /// The exposure interpolation speed used this cycle.
    pub exposure_speed: f64,
}

/// What the smoother is asked to move towards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmootherTargets {
    pub exposure_s: f64,
    pub gain: f64,
    pub wb: ColourGains,
}

#[derive(Debug, Clone)]
pub struct TransitionSmoother {
    cfg: SmoothingConfig,
    wb: WhiteBalanceConfig,
    min_exposure_s: f64,
    max_exposure_s: f64,
    min_gain: f64,
    max_gain: f64,
}

impl TransitionSmoother {
    pub fn new(cfg: SmoothingConfig, target: &TargetConfig, wb: WhiteBalanceConfig) -> Self {
        Self {
            cfg,
            wb,
            min_exposure_s: target.min_day_exposure_s,
            max_exposure_s: target.max_night_exposure_s,
            min_gain: target.min_gain,
            max_gain: target.max_gain,
        }
    }

    fn clamp_exposure(&self, exposure_s: f64) -> f64 {
        exposure_s.clamp(self.min_exposure_s, self.max_exposure_s)
    }

    fn clamp_gain(&self, gain: f64) -> f64 {
        gain.clamp(self.min_gain, self.max_gain)
    }

    /// The white balance pair to move towards in `mode`.
    ///
    /// Day uses the configured fixed pair, else the learned day reference,
    /// else the default. Transition blends day into night by
    /// `transition_position`.
    pub fn wb_target(
        &self,
        mode: LightMode,
        transition_position: f64,
        day_reference: Option<ColourGains>,
    ) -> ColourGains {
        let night = ColourGains::from(self.wb.night_gains);
        let day = self
            .wb
            .day_gains
            .map(ColourGains::from)
            .or(day_reference)
            .unwrap_or_else(|| ColourGains::from(self.wb.default_day_gains));
        match mode {
            LightMode::Night => night,
            LightMode::Day => day,
            LightMode::Transition => day.lerp(&night, transition_position.clamp(0.0, 1.0)),
        }
    }

    /// Speed for the log-space exposure step.
    ///
    /// An exposure alarm only speeds things up when the target lies in the
    /// direction that fixes it.
    pub fn exposure_speed(
        &self,
        rapid_change: bool,
        feedback: &FeedbackState,
        ramping_up: bool,
    ) -> f64 {
        let mut speed = self.cfg.exposure_speed;
        if rapid_change {
            speed = speed.max(self.cfg.rapid_change_speed);
        }
        let alarm_speed = if ramping_up {
            feedback.under_exposed.map(|sev| match sev {
                Severity::Warning => self.cfg.fast_up_warning_speed,
                Severity::Critical => self.cfg.fast_up_critical_speed,
            })
        } else {
            feedback.over_exposed.map(|sev| match sev {
                Severity::Warning => self.cfg.fast_down_warning_speed,
                Severity::Critical => self.cfg.fast_down_critical_speed,
            })
        };
        if let Some(alarm_speed) = alarm_speed {
            speed = speed.max(alarm_speed);
        }
        speed.min(1.0)
    }

    /// `10^(log(prev) + speed * (log(target) - log(prev)))`, clamped.
    pub fn step_exposure(&self, prev: f64, target: f64, speed: f64) -> f64 {
        let prev = self.clamp_exposure(prev);
        let target = self.clamp_exposure(target);
        let log_prev = prev.log10();
        let next = 10f64.powf(log_prev + speed * (target.log10() - log_prev));
        self.clamp_exposure(next)
    }

    /// Start from `values` directly, bypassing interpolation.
    pub fn seed(&self, st: &mut SmootherState, exposure_s: f64, gain: f64, wb: ColourGains) {
        st.exposure_s = Some(self.clamp_exposure(exposure_s));
        st.gain = Some(self.clamp_gain(gain));
        st.wb = Some(wb);
    }

    /// Overwrite the exposure, for example after the EV clamp.
    pub fn set_exposure(&self, st: &mut SmootherState, exposure_s: f64) {
        st.exposure_s = Some(self.clamp_exposure(exposure_s));
    }

    /// Move one step towards `targets`. The first update snaps to them.
    pub fn update(
        &self,
        st: &mut SmootherState,
        targets: &SmootherTargets,
        rapid_change: bool,
        feedback: &FeedbackState,
    ) -> SmoothedValues {
        let target_exposure = self.clamp_exposure(targets.exposure_s);
        let target_gain = self.clamp_gain(targets.gain);

        let (exposure_s, exposure_speed) = match st.exposure_s {
            None => (target_exposure, 1.0),
            Some(prev) => {
                let speed = self.exposure_speed(rapid_change, feedback, target_exposure > prev);
                (self.step_exposure(prev, target_exposure, speed), speed)
            }
        };
        let gain = match st.gain {
            None => target_gain,
            Some(prev) => self.clamp_gain(prev + self.cfg.gain_speed * (target_gain - prev)),
        };
        let wb = match st.wb {
            None => targets.wb,
            Some(prev) => prev.lerp(&targets.wb, self.cfg.wb_speed),
        };

        st.exposure_s = Some(exposure_s);
        st.gain = Some(gain);
        st.wb = Some(wb);

        SmoothedValues {
            exposure_s,
            gain,
            wb,
            exposure_speed,
        }
    }
}
