//! Configuration for the sky camera exposure engine.
//!
//! The configuration is read from a TOML file where every table and every
//! field is optional. Missing values take the documented defaults. After
//! parsing, [ExposureConfig::validate] rejects values which would make the
//! control loop misbehave, so configuration errors surface at startup rather
//! than as a strangely exposed night.

// Copyright 2020-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

/// The exposure configuration error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(std::path::PathBuf),
    #[error("invalid value for `{field}`: {msg}")]
    InvalidValue { field: &'static str, msg: String },
}

pub type Result<T> = std::result::Result<T, Error>;

fn invalid<T>(field: &'static str, msg: impl Into<String>) -> Result<T> {
    Err(Error::InvalidValue {
        field,
        msg: msg.into(),
    })
}

fn check_positive(field: &'static str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return invalid(field, format!("must be finite and > 0, got {value}"));
    }
    Ok(())
}

fn check_fraction(field: &'static str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0 && value <= 1.0) {
        return invalid(field, format!("must be in (0, 1], got {value}"));
    }
    Ok(())
}

fn check_brightness(field: &'static str, value: f64) -> Result<()> {
    if !(value.is_finite() && (0.0..=255.0).contains(&value)) {
        return invalid(field, format!("must be in [0, 255], got {value}"));
    }
    Ok(())
}

fn check_percent(field: &'static str, value: f64) -> Result<()> {
    if !(value.is_finite() && (0.0..=100.0).contains(&value)) {
        return invalid(field, format!("must be in [0, 100], got {value}"));
    }
    Ok(())
}

fn check_gains(field: &'static str, gains: [f64; 2]) -> Result<()> {
    if !gains.iter().all(|g| g.is_finite() && *g > 0.0) {
        return invalid(field, format!("both gains must be finite and > 0, got {gains:?}"));
    }
    Ok(())
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is expanded
/// to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path
        .as_os_str()
        .to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.clone()))?;
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// [lux]

pub const DEFAULT_CALIBRATION_CONSTANT: f64 = 1.0;
pub const DEFAULT_TEST_EXPOSURE_S: f64 = 0.01;
pub const DEFAULT_TEST_GAIN: f64 = 1.0;
pub const DEFAULT_MIN_LUX: f64 = 1e-4;
pub const DEFAULT_MAX_LUX: f64 = 2e5;
pub const DEFAULT_DEFAULT_LUX: f64 = 10.0;

/// Ambient light estimation from a short test exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LuxConfig {
    /// Scales the brightness-based estimate to lux for this sensor and lens.
    #[serde(default = "default_calibration_constant")]
    pub calibration_constant: f64,
    /// Exposure of the test shot, in seconds.
    #[serde(default = "default_test_exposure_s")]
    pub test_exposure_s: f64,
    /// Analogue gain of the test shot.
    #[serde(default = "default_test_gain")]
    pub test_gain: f64,
    #[serde(default = "default_min_lux")]
    pub min_lux: f64,
    #[serde(default = "default_max_lux")]
    pub max_lux: f64,
    /// Used when neither the image nor the camera metadata give an estimate.
    #[serde(default = "default_default_lux")]
    pub default_lux: f64,
}

fn default_calibration_constant() -> f64 {
    DEFAULT_CALIBRATION_CONSTANT
}
fn default_test_exposure_s() -> f64 {
    DEFAULT_TEST_EXPOSURE_S
}
fn default_test_gain() -> f64 {
    DEFAULT_TEST_GAIN
}
fn default_min_lux() -> f64 {
    DEFAULT_MIN_LUX
}
fn default_max_lux() -> f64 {
    DEFAULT_MAX_LUX
}
fn default_default_lux() -> f64 {
    DEFAULT_DEFAULT_LUX
}

impl Default for LuxConfig {
    fn default() -> Self {
        Self {
            calibration_constant: DEFAULT_CALIBRATION_CONSTANT,
            test_exposure_s: DEFAULT_TEST_EXPOSURE_S,
            test_gain: DEFAULT_TEST_GAIN,
            min_lux: DEFAULT_MIN_LUX,
            max_lux: DEFAULT_MAX_LUX,
            default_lux: DEFAULT_DEFAULT_LUX,
        }
    }
}

impl LuxConfig {
    fn validate(&self) -> Result<()> {
        check_positive("lux.calibration_constant", self.calibration_constant)?;
        check_positive("lux.test_exposure_s", self.test_exposure_s)?;
        check_positive("lux.test_gain", self.test_gain)?;
        check_positive("lux.min_lux", self.min_lux)?;
        check_positive("lux.max_lux", self.max_lux)?;
        if self.min_lux >= self.max_lux {
            return invalid("lux.min_lux", "must be less than lux.max_lux");
        }
        check_positive("lux.default_lux", self.default_lux)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [signal]

pub const DEFAULT_SMOOTHING_ALPHA: f64 = 0.3;
pub const DEFAULT_RAPID_CHANGE_RATIO: f64 = 3.0;
pub const DEFAULT_TREND_HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    /// Weight of the newest reading in the exponential moving average.
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    /// A reading this many times brighter or darker than the previous one
    /// counts as a rapid change.
    #[serde(default = "default_rapid_change_ratio")]
    pub rapid_change_ratio: f64,
    /// Number of raw readings kept for trend estimation.
    #[serde(default = "default_trend_history_len")]
    pub trend_history_len: usize,
}

fn default_smoothing_alpha() -> f64 {
    DEFAULT_SMOOTHING_ALPHA
}
fn default_rapid_change_ratio() -> f64 {
    DEFAULT_RAPID_CHANGE_RATIO
}
fn default_trend_history_len() -> usize {
    DEFAULT_TREND_HISTORY_LEN
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            rapid_change_ratio: DEFAULT_RAPID_CHANGE_RATIO,
            trend_history_len: DEFAULT_TREND_HISTORY_LEN,
        }
    }
}

impl SignalConfig {
    fn validate(&self) -> Result<()> {
        check_fraction("signal.smoothing_alpha", self.smoothing_alpha)?;
        if !(self.rapid_change_ratio.is_finite() && self.rapid_change_ratio > 1.0) {
            return invalid("signal.rapid_change_ratio", "must be > 1");
        }
        if self.trend_history_len < 2 {
            return invalid("signal.trend_history_len", "must be at least 2");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [mode]

pub const DEFAULT_NIGHT_LUX_THRESHOLD: f64 = 10.0;
pub const DEFAULT_DAY_LUX_THRESHOLD: f64 = 100.0;
pub const DEFAULT_HYSTERESIS_FRAMES: u32 = 3;
pub const DEFAULT_POLAR_DAY_ELEVATION_DEG: f64 = -6.0;
pub const DEFAULT_BRIGHTNESS_HIGH_WARNING: f64 = 200.0;
pub const DEFAULT_BRIGHTNESS_LOW_WARNING: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeConfig {
    /// Smoothed lux below this is night.
    #[serde(default = "default_night_lux_threshold")]
    pub night_lux_threshold: f64,
    /// Smoothed lux above this is day.
    #[serde(default = "default_day_lux_threshold")]
    pub day_lux_threshold: f64,
    /// Consecutive cycles a new mode must be requested before it is accepted.
    #[serde(default = "default_hysteresis_frames")]
    pub hysteresis_frames: u32,
    /// Sun elevation (degrees) above which day mode is forced.
    #[serde(default = "default_polar_day_elevation_deg")]
    pub polar_day_elevation_deg: f64,
    /// A night frame brighter than this forces transition mode.
    #[serde(default = "default_brightness_high_warning")]
    pub brightness_high_warning: f64,
    /// A day frame darker than this forces transition mode.
    #[serde(default = "default_brightness_low_warning")]
    pub brightness_low_warning: f64,
}

fn default_night_lux_threshold() -> f64 {
    DEFAULT_NIGHT_LUX_THRESHOLD
}
fn default_day_lux_threshold() -> f64 {
    DEFAULT_DAY_LUX_THRESHOLD
}
fn default_hysteresis_frames() -> u32 {
    DEFAULT_HYSTERESIS_FRAMES
}
fn default_polar_day_elevation_deg() -> f64 {
    DEFAULT_POLAR_DAY_ELEVATION_DEG
}
fn default_brightness_high_warning() -> f64 {
    DEFAULT_BRIGHTNESS_HIGH_WARNING
}
fn default_brightness_low_warning() -> f64 {
    DEFAULT_BRIGHTNESS_LOW_WARNING
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            night_lux_threshold: DEFAULT_NIGHT_LUX_THRESHOLD,
            day_lux_threshold: DEFAULT_DAY_LUX_THRESHOLD,
            hysteresis_frames: DEFAULT_HYSTERESIS_FRAMES,
            polar_day_elevation_deg: DEFAULT_POLAR_DAY_ELEVATION_DEG,
            brightness_high_warning: DEFAULT_BRIGHTNESS_HIGH_WARNING,
            brightness_low_warning: DEFAULT_BRIGHTNESS_LOW_WARNING,
        }
    }
}

impl ModeConfig {
    fn validate(&self) -> Result<()> {
        check_positive("mode.night_lux_threshold", self.night_lux_threshold)?;
        check_positive("mode.day_lux_threshold", self.day_lux_threshold)?;
        if self.night_lux_threshold >= self.day_lux_threshold {
            return invalid(
                "mode.night_lux_threshold",
                "must be less than mode.day_lux_threshold",
            );
        }
        if self.hysteresis_frames == 0 {
            return invalid("mode.hysteresis_frames", "must be at least 1");
        }
        if !(-90.0..=90.0).contains(&self.polar_day_elevation_deg) {
            return invalid("mode.polar_day_elevation_deg", "must be in [-90, 90]");
        }
        check_brightness("mode.brightness_high_warning", self.brightness_high_warning)?;
        check_brightness("mode.brightness_low_warning", self.brightness_low_warning)?;
        if self.brightness_low_warning >= self.brightness_high_warning {
            return invalid(
                "mode.brightness_low_warning",
                "must be less than mode.brightness_high_warning",
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [target]

pub const DEFAULT_MAX_NIGHT_EXPOSURE_S: f64 = 20.0;
pub const DEFAULT_MIN_DAY_EXPOSURE_S: f64 = 1e-4;
/// With unit lux calibration, a frame at the formula target for the middle
/// of the transition band (about 32 lux, gain 2.5) lands on the default
/// brightness target.
pub const DEFAULT_REFERENCE_LUX: f64 = 0.0186;
pub const DEFAULT_NIGHT_GAIN: f64 = 8.0;
pub const DEFAULT_DAY_GAIN: f64 = 1.0;
pub const DEFAULT_MIN_GAIN: f64 = 1.0;
pub const DEFAULT_MAX_GAIN: f64 = 16.0;
pub const DEFAULT_GAIN_LUX_WINDOW: [f64; 2] = [1.0, 500.0];

/// Closed-form exposure and gain targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default = "default_max_night_exposure_s")]
    pub max_night_exposure_s: f64,
    #[serde(default = "default_min_day_exposure_s")]
    pub min_day_exposure_s: f64,
    /// The lux at which the inverse exposure law yields `max_night_exposure_s`.
    #[serde(default = "default_reference_lux")]
    pub reference_lux: f64,
    #[serde(default = "default_night_gain")]
    pub night_gain: f64,
    #[serde(default = "default_day_gain")]
    pub day_gain: f64,
    #[serde(default = "default_min_gain")]
    pub min_gain: f64,
    #[serde(default = "default_max_gain")]
    pub max_gain: f64,
    /// Gain is interpolated logarithmically between these two lux values.
    #[serde(default = "default_gain_lux_window")]
    pub gain_lux_window: [f64; 2],
}

fn default_max_night_exposure_s() -> f64 {
    DEFAULT_MAX_NIGHT_EXPOSURE_S
}
fn default_min_day_exposure_s() -> f64 {
    DEFAULT_MIN_DAY_EXPOSURE_S
}
fn default_reference_lux() -> f64 {
    DEFAULT_REFERENCE_LUX
}
fn default_night_gain() -> f64 {
    DEFAULT_NIGHT_GAIN
}
fn default_day_gain() -> f64 {
    DEFAULT_DAY_GAIN
}
fn default_min_gain() -> f64 {
    DEFAULT_MIN_GAIN
}
fn default_max_gain() -> f64 {
    DEFAULT_MAX_GAIN
}
fn default_gain_lux_window() -> [f64; 2] {
    DEFAULT_GAIN_LUX_WINDOW
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_night_exposure_s: DEFAULT_MAX_NIGHT_EXPOSURE_S,
            min_day_exposure_s: DEFAULT_MIN_DAY_EXPOSURE_S,
            reference_lux: DEFAULT_REFERENCE_LUX,
            night_gain: DEFAULT_NIGHT_GAIN,
            day_gain: DEFAULT_DAY_GAIN,
            min_gain: DEFAULT_MIN_GAIN,
            max_gain: DEFAULT_MAX_GAIN,
            gain_lux_window: DEFAULT_GAIN_LUX_WINDOW,
        }
    }
}

impl TargetConfig {
    fn validate(&self) -> Result<()> {
        check_positive("target.max_night_exposure_s", self.max_night_exposure_s)?;
        check_positive("target.min_day_exposure_s", self.min_day_exposure_s)?;
        if self.min_day_exposure_s >= self.max_night_exposure_s {
            return invalid(
                "target.min_day_exposure_s",
                "must be less than target.max_night_exposure_s",
            );
        }
        check_positive("target.reference_lux", self.reference_lux)?;
        check_positive("target.min_gain", self.min_gain)?;
        check_positive("target.max_gain", self.max_gain)?;
        if self.min_gain < 1.0 {
            return invalid("target.min_gain", "analogue gain cannot be below 1.0");
        }
        if self.min_gain > self.max_gain {
            return invalid("target.min_gain", "must not exceed target.max_gain");
        }
        for (field, gain) in [
            ("target.night_gain", self.night_gain),
            ("target.day_gain", self.day_gain),
        ] {
            if !(self.min_gain..=self.max_gain).contains(&gain) {
                return invalid(field, "must lie within [target.min_gain, target.max_gain]");
            }
        }
        let [lo, hi] = self.gain_lux_window;
        check_positive("target.gain_lux_window", lo)?;
        check_positive("target.gain_lux_window", hi)?;
        if lo >= hi {
            return invalid("target.gain_lux_window", "lower bound must be below upper");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [feedback]

pub const DEFAULT_TARGET_BRIGHTNESS: f64 = 120.0;
pub const DEFAULT_TOLERANCE: f64 = 10.0;
pub const DEFAULT_FEEDBACK_STRENGTH: f64 = 0.3;
pub const DEFAULT_DECAY_RATE: f64 = 0.1;
pub const DEFAULT_MAX_STEP_RATIO: f64 = 2.0;

/// Brightness feedback, emergency zones and exposure alarms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedbackConfig {
    /// Desired mean frame brightness in `[0, 255]`.
    #[serde(default = "default_target_brightness")]
    pub target_brightness: f64,
    /// Errors up to this size only relax the correction factor.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_feedback_strength")]
    pub strength: f64,
    /// Fraction of the distance to 1.0 recovered per in-tolerance cycle.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Largest factor by which the correction may change in one cycle.
    #[serde(default = "default_max_step_ratio")]
    pub max_step_ratio: f64,

    #[serde(default = "default_critical_low")]
    pub critical_low: f64,
    #[serde(default = "default_warning_low")]
    pub warning_low: f64,
    #[serde(default = "default_warning_high")]
    pub warning_high: f64,
    #[serde(default = "default_critical_high")]
    pub critical_high: f64,
    /// Emergency smoothing speed when moving away from 1.0.
    #[serde(default = "default_emergency_attack")]
    pub emergency_attack: f64,
    /// Emergency smoothing speed when relaxing back towards 1.0.
    #[serde(default = "default_emergency_release")]
    pub emergency_release: f64,

    #[serde(default = "default_over_warning_mean")]
    pub over_warning_mean: f64,
    #[serde(default = "default_over_critical_mean")]
    pub over_critical_mean: f64,
    #[serde(default = "default_over_warning_clip_pct")]
    pub over_warning_clip_pct: f64,
    #[serde(default = "default_over_critical_clip_pct")]
    pub over_critical_clip_pct: f64,
    #[serde(default = "default_under_warning_mean")]
    pub under_warning_mean: f64,
    #[serde(default = "default_under_critical_mean")]
    pub under_critical_mean: f64,
    #[serde(default = "default_under_warning_clip_pct")]
    pub under_warning_clip_pct: f64,
    #[serde(default = "default_under_critical_clip_pct")]
    pub under_critical_clip_pct: f64,
    /// How far inside the warning limit the mean must come back before an
    /// alarm clears.
    #[serde(default = "default_clear_margin")]
    pub clear_margin: f64,
}

fn default_target_brightness() -> f64 {
    DEFAULT_TARGET_BRIGHTNESS
}
fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}
fn default_feedback_strength() -> f64 {
    DEFAULT_FEEDBACK_STRENGTH
}
fn default_decay_rate() -> f64 {
    DEFAULT_DECAY_RATE
}
fn default_max_step_ratio() -> f64 {
    DEFAULT_MAX_STEP_RATIO
}
fn default_critical_low() -> f64 {
    20.0
}
fn default_warning_low() -> f64 {
    50.0
}
fn default_warning_high() -> f64 {
    190.0
}
fn default_critical_high() -> f64 {
    220.0
}
fn default_emergency_attack() -> f64 {
    0.5
}
fn default_emergency_release() -> f64 {
    0.2
}
fn default_over_warning_mean() -> f64 {
    200.0
}
fn default_over_critical_mean() -> f64 {
    230.0
}
fn default_over_warning_clip_pct() -> f64 {
    5.0
}
fn default_over_critical_clip_pct() -> f64 {
    20.0
}
fn default_under_warning_mean() -> f64 {
    40.0
}
fn default_under_critical_mean() -> f64 {
    15.0
}
fn default_under_warning_clip_pct() -> f64 {
    30.0
}
fn default_under_critical_clip_pct() -> f64 {
    60.0
}
fn default_clear_margin() -> f64 {
    20.0
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            target_brightness: DEFAULT_TARGET_BRIGHTNESS,
            tolerance: DEFAULT_TOLERANCE,
            strength: DEFAULT_FEEDBACK_STRENGTH,
            decay_rate: DEFAULT_DECAY_RATE,
            max_step_ratio: DEFAULT_MAX_STEP_RATIO,
            critical_low: default_critical_low(),
            warning_low: default_warning_low(),
            warning_high: default_warning_high(),
            critical_high: default_critical_high(),
            emergency_attack: default_emergency_attack(),
            emergency_release: default_emergency_release(),
            over_warning_mean: default_over_warning_mean(),
            over_critical_mean: default_over_critical_mean(),
            over_warning_clip_pct: default_over_warning_clip_pct(),
            over_critical_clip_pct: default_over_critical_clip_pct(),
            under_warning_mean: default_under_warning_mean(),
            under_critical_mean: default_under_critical_mean(),
            under_warning_clip_pct: default_under_warning_clip_pct(),
            under_critical_clip_pct: default_under_critical_clip_pct(),
            clear_margin: default_clear_margin(),
        }
    }
}

impl FeedbackConfig {
    fn validate(&self) -> Result<()> {
        check_brightness("feedback.target_brightness", self.target_brightness)?;
        if self.target_brightness <= 0.0 {
            return invalid("feedback.target_brightness", "must be > 0");
        }
        check_positive("feedback.tolerance", self.tolerance)?;
        check_fraction("feedback.strength", self.strength)?;
        check_fraction("feedback.decay_rate", self.decay_rate)?;
        if !(self.max_step_ratio.is_finite() && self.max_step_ratio > 1.0) {
            return invalid("feedback.max_step_ratio", "must be > 1");
        }
        for (field, v) in [
            ("feedback.critical_low", self.critical_low),
            ("feedback.warning_low", self.warning_low),
            ("feedback.warning_high", self.warning_high),
            ("feedback.critical_high", self.critical_high),
            ("feedback.over_warning_mean", self.over_warning_mean),
            ("feedback.over_critical_mean", self.over_critical_mean),
            ("feedback.under_warning_mean", self.under_warning_mean),
            ("feedback.under_critical_mean", self.under_critical_mean),
        ] {
            check_brightness(field, v)?;
        }
        if !(self.critical_low < self.warning_low
            && self.warning_low < self.target_brightness
            && self.target_brightness < self.warning_high
            && self.warning_high < self.critical_high)
        {
            return invalid(
                "feedback.critical_low",
                "zones must satisfy critical_low < warning_low < target_brightness \
                < warning_high < critical_high",
            );
        }
        check_fraction("feedback.emergency_attack", self.emergency_attack)?;
        check_fraction("feedback.emergency_release", self.emergency_release)?;
        for (field, v) in [
            ("feedback.over_warning_clip_pct", self.over_warning_clip_pct),
            ("feedback.over_critical_clip_pct", self.over_critical_clip_pct),
            ("feedback.under_warning_clip_pct", self.under_warning_clip_pct),
            ("feedback.under_critical_clip_pct", self.under_critical_clip_pct),
        ] {
            check_percent(field, v)?;
        }
        if self.over_warning_mean > self.over_critical_mean
            || self.over_warning_clip_pct > self.over_critical_clip_pct
        {
            return invalid("feedback.over_warning_mean", "warning must not exceed critical");
        }
        if self.under_warning_mean < self.under_critical_mean
            || self.under_warning_clip_pct > self.under_critical_clip_pct
        {
            return invalid("feedback.under_warning_mean", "warning must not exceed critical");
        }
        if !(self.clear_margin.is_finite() && self.clear_margin >= 0.0) {
            return invalid("feedback.clear_margin", "must be >= 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [smoothing]

/// Per-cycle interpolation speeds, each a fraction in `(0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmoothingConfig {
    /// Base log-space exposure speed.
    #[serde(default = "default_exposure_speed")]
    pub exposure_speed: f64,
    /// Exposure speed while the lux signal is changing rapidly.
    #[serde(default = "default_rapid_change_speed")]
    pub rapid_change_speed: f64,
    #[serde(default = "default_fast_up_warning_speed")]
    pub fast_up_warning_speed: f64,
    #[serde(default = "default_fast_up_critical_speed")]
    pub fast_up_critical_speed: f64,
    #[serde(default = "default_fast_down_warning_speed")]
    pub fast_down_warning_speed: f64,
    #[serde(default = "default_fast_down_critical_speed")]
    pub fast_down_critical_speed: f64,
    #[serde(default = "default_gain_speed")]
    pub gain_speed: f64,
    #[serde(default = "default_wb_speed")]
    pub wb_speed: f64,
}

fn default_exposure_speed() -> f64 {
    0.2
}
fn default_rapid_change_speed() -> f64 {
    0.5
}
fn default_fast_up_warning_speed() -> f64 {
    0.4
}
fn default_fast_up_critical_speed() -> f64 {
    0.7
}
fn default_fast_down_warning_speed() -> f64 {
    0.5
}
fn default_fast_down_critical_speed() -> f64 {
    0.8
}
fn default_gain_speed() -> f64 {
    0.25
}
fn default_wb_speed() -> f64 {
    0.15
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            exposure_speed: default_exposure_speed(),
            rapid_change_speed: default_rapid_change_speed(),
            fast_up_warning_speed: default_fast_up_warning_speed(),
            fast_up_critical_speed: default_fast_up_critical_speed(),
            fast_down_warning_speed: default_fast_down_warning_speed(),
            fast_down_critical_speed: default_fast_down_critical_speed(),
            gain_speed: default_gain_speed(),
            wb_speed: default_wb_speed(),
        }
    }
}

impl SmoothingConfig {
    fn validate(&self) -> Result<()> {
        check_fraction("smoothing.exposure_speed", self.exposure_speed)?;
        check_fraction("smoothing.rapid_change_speed", self.rapid_change_speed)?;
        check_fraction("smoothing.fast_up_warning_speed", self.fast_up_warning_speed)?;
        check_fraction("smoothing.fast_up_critical_speed", self.fast_up_critical_speed)?;
        check_fraction("smoothing.fast_down_warning_speed", self.fast_down_warning_speed)?;
        check_fraction(
            "smoothing.fast_down_critical_speed",
            self.fast_down_critical_speed,
        )?;
        check_fraction("smoothing.gain_speed", self.gain_speed)?;
        check_fraction("smoothing.wb_speed", self.wb_speed)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [white_balance]

pub const DEFAULT_NIGHT_WB_GAINS: [f64; 2] = [1.8, 1.6];
pub const DEFAULT_DAY_WB_GAINS: [f64; 2] = [2.0, 1.5];
pub const DEFAULT_WB_LEARN_MIN_LUX: f64 = 200.0;

/// White balance gains as `[red, blue]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhiteBalanceConfig {
    #[serde(default = "default_night_gains")]
    pub night_gains: [f64; 2],
    /// Fixed day gains. When absent, gains learned from AWB are used.
    #[serde(default)]
    pub day_gains: Option<[f64; 2]>,
    /// Day gains used before anything has been learned.
    #[serde(default = "default_default_day_gains")]
    pub default_day_gains: [f64; 2],
    /// AWB results are only learned above this smoothed lux.
    #[serde(default = "default_learn_min_lux")]
    pub learn_min_lux: f64,
}

fn default_night_gains() -> [f64; 2] {
    DEFAULT_NIGHT_WB_GAINS
}
fn default_default_day_gains() -> [f64; 2] {
    DEFAULT_DAY_WB_GAINS
}
fn default_learn_min_lux() -> f64 {
    DEFAULT_WB_LEARN_MIN_LUX
}

impl Default for WhiteBalanceConfig {
    fn default() -> Self {
        Self {
            night_gains: DEFAULT_NIGHT_WB_GAINS,
            day_gains: None,
            default_day_gains: DEFAULT_DAY_WB_GAINS,
            learn_min_lux: DEFAULT_WB_LEARN_MIN_LUX,
        }
    }
}

impl WhiteBalanceConfig {
    fn validate(&self) -> Result<()> {
        check_gains("white_balance.night_gains", self.night_gains)?;
        if let Some(day) = self.day_gains {
            check_gains("white_balance.day_gains", day)?;
        }
        check_gains("white_balance.default_day_gains", self.default_day_gains)?;
        check_positive("white_balance.learn_min_lux", self.learn_min_lux)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [handover]

pub const DEFAULT_EV_CLAMP_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandoverConfig {
    /// Match the first manual frame's EV to the last automatic frame.
    #[serde(default = "default_true")]
    pub ev_clamp_enabled: bool,
    /// Relative EV difference tolerated before the clamp fires.
    #[serde(default = "default_ev_clamp_tolerance")]
    pub ev_clamp_tolerance: f64,
}

fn default_true() -> bool {
    true
}
fn default_ev_clamp_tolerance() -> f64 {
    DEFAULT_EV_CLAMP_TOLERANCE
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            ev_clamp_enabled: true,
            ev_clamp_tolerance: DEFAULT_EV_CLAMP_TOLERANCE,
        }
    }
}

impl HandoverConfig {
    fn validate(&self) -> Result<()> {
        if !(self.ev_clamp_tolerance.is_finite() && self.ev_clamp_tolerance >= 0.0) {
            return invalid("handover.ev_clamp_tolerance", "must be >= 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// [predictor]

pub const DEFAULT_RETRAIN_INTERVAL_HOURS: f64 = 24.0;
/// Longest accepted retraining interval, one year.
pub const MAX_RETRAIN_INTERVAL_HOURS: f64 = 24.0 * 366.0;

/// The historical exposure predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Frames with mean brightness in `[good_brightness_min,
    /// good_brightness_max]` are used for training.
    #[serde(default = "default_good_brightness_min")]
    pub good_brightness_min: f64,
    #[serde(default = "default_good_brightness_max")]
    pub good_brightness_max: f64,
    /// Aurora frames (dark mean, bright tail) below this lux are also used.
    #[serde(default = "default_aurora_max_lux")]
    pub aurora_max_lux: f64,
    #[serde(default = "default_aurora_max_mean")]
    pub aurora_max_mean: f64,
    #[serde(default = "default_aurora_min_p95")]
    pub aurora_min_p95: f64,
    /// Buckets with fewer samples are discarded after training.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// Buckets with at least this many samples have full confidence.
    #[serde(default = "default_confident_samples")]
    pub confident_samples: u32,
    #[serde(default = "default_trust_per_bucket")]
    pub trust_per_bucket: f64,
    #[serde(default = "default_max_trust")]
    pub max_trust: f64,
    #[serde(default = "default_retrain_interval_hours")]
    pub retrain_interval_hours: f64,
    /// Maximum number of records read from the store per training run.
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    /// Where the trained model is saved. Can contain shell variables.
    #[serde(default)]
    pub model_path: Option<std::path::PathBuf>,
}

fn default_good_brightness_min() -> f64 {
    80.0
}
fn default_good_brightness_max() -> f64 {
    160.0
}
fn default_aurora_max_lux() -> f64 {
    0.5
}
fn default_aurora_max_mean() -> f64 {
    60.0
}
fn default_aurora_min_p95() -> f64 {
    100.0
}
fn default_min_samples() -> u32 {
    3
}
fn default_confident_samples() -> u32 {
    20
}
fn default_trust_per_bucket() -> f64 {
    0.05
}
fn default_max_trust() -> f64 {
    0.8
}
fn default_retrain_interval_hours() -> f64 {
    DEFAULT_RETRAIN_INTERVAL_HOURS
}
fn default_query_limit() -> usize {
    50_000
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            good_brightness_min: default_good_brightness_min(),
            good_brightness_max: default_good_brightness_max(),
            aurora_max_lux: default_aurora_max_lux(),
            aurora_max_mean: default_aurora_max_mean(),
            aurora_min_p95: default_aurora_min_p95(),
            min_samples: default_min_samples(),
            confident_samples: default_confident_samples(),
            trust_per_bucket: default_trust_per_bucket(),
            max_trust: default_max_trust(),
            retrain_interval_hours: default_retrain_interval_hours(),
            query_limit: default_query_limit(),
            model_path: None,
        }
    }
}

impl PredictorConfig {
    fn validate(&self) -> Result<()> {
        check_brightness("predictor.good_brightness_min", self.good_brightness_min)?;
        check_brightness("predictor.good_brightness_max", self.good_brightness_max)?;
        if self.good_brightness_min >= self.good_brightness_max {
            return invalid(
                "predictor.good_brightness_min",
                "must be less than predictor.good_brightness_max",
            );
        }
        check_positive("predictor.aurora_max_lux", self.aurora_max_lux)?;
        check_brightness("predictor.aurora_max_mean", self.aurora_max_mean)?;
        check_brightness("predictor.aurora_min_p95", self.aurora_min_p95)?;
        if self.min_samples == 0 {
            return invalid("predictor.min_samples", "must be at least 1");
        }
        if self.confident_samples < self.min_samples {
            return invalid(
                "predictor.confident_samples",
                "must be at least predictor.min_samples",
            );
        }
        check_positive("predictor.trust_per_bucket", self.trust_per_bucket)?;
        if !(0.0..=1.0).contains(&self.max_trust) {
            return invalid("predictor.max_trust", "must be in [0, 1]");
        }
        check_positive("predictor.retrain_interval_hours", self.retrain_interval_hours)?;
        if self.retrain_interval_hours > MAX_RETRAIN_INTERVAL_HOURS {
            return invalid(
                "predictor.retrain_interval_hours",
                format!("must be at most {MAX_RETRAIN_INTERVAL_HOURS}"),
            );
        }
        if self.query_limit == 0 {
            return invalid("predictor.query_limit", "must be at least 1");
        }
        Ok(())
    }

    pub fn retrain_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.retrain_interval_hours * 3_600_000.0) as i64)
    }
}

// ---------------------------------------------------------------------------
// [store] and [site]

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// JSON lines file holding capture records. Can contain shell variables.
    /// When absent, records are kept in memory only.
    #[serde(default)]
    pub path: Option<std::path::PathBuf>,
}

/// Camera location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    #[serde(default)]
    pub latitude_deg: Option<f64>,
    #[serde(default)]
    pub longitude_deg: Option<f64>,
    /// Offset of local clock time from UTC, used when the solar period must
    /// be guessed from the clock.
    #[serde(default)]
    pub utc_offset_hours: f64,
}

impl SiteConfig {
    fn validate(&self) -> Result<()> {
        if let Some(lat) = self.latitude_deg {
            if !(-90.0..=90.0).contains(&lat) {
                return invalid("site.latitude_deg", "must be in [-90, 90]");
            }
        }
        if let Some(lon) = self.longitude_deg {
            if !(-180.0..=180.0).contains(&lon) {
                return invalid("site.longitude_deg", "must be in [-180, 180]");
            }
        }
        if self.latitude_deg.is_some() != self.longitude_deg.is_some() {
            return invalid(
                "site.latitude_deg",
                "latitude and longitude must be given together",
            );
        }
        if !(-14.0..=14.0).contains(&self.utc_offset_hours) {
            return invalid("site.utc_offset_hours", "must be in [-14, 14]");
        }
        Ok(())
    }

    /// Latitude and longitude, if both are configured.
    pub fn location(&self) -> Option<(f64, f64)> {
        Some((self.latitude_deg?, self.longitude_deg?))
    }
}

// ---------------------------------------------------------------------------
// top level

/// The exposure engine configuration, as stored in a `.toml` file.
///
/// See the types of each field for sub-configuration values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureConfig {
    #[serde(default)]
    pub lux: LuxConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub white_balance: WhiteBalanceConfig,
    #[serde(default)]
    pub handover: HandoverConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub site: SiteConfig,
}

impl ExposureConfig {
    /// Check every value. An error here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.lux.validate()?;
        self.signal.validate()?;
        self.mode.validate()?;
        self.target.validate()?;
        self.feedback.validate()?;
        self.smoothing.validate()?;
        self.white_balance.validate()?;
        self.handover.validate()?;
        self.predictor.validate()?;
        self.site.validate()?;
        Ok(())
    }

    /// For all paths which are relative, make them relative to `dirname`.
    fn fixup_relative_paths(&mut self, dirname: &std::path::Path) -> Result<()> {
        if let Some(model_path) = self.predictor.model_path.as_mut() {
            fixup_relative_path(model_path, dirname)?;
        }
        if let Some(store_path) = self.store.path.as_mut() {
            fixup_relative_path(store_path, dirname)?;
        }
        Ok(())
    }
}

/// Parse a TOML string and validate the result.
///
/// Relative paths are left untouched.
pub fn parse_config_str(contents: &str) -> Result<ExposureConfig> {
    let cfg: ExposureConfig = toml::from_str(contents)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parse a `.toml` file and return a validated [ExposureConfig].
///
/// Relative paths in the file are taken relative to the file's directory.
pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<ExposureConfig> {
    let fname = fname.as_ref();
    let contents = std::fs::read_to_string(fname)?;
    let mut cfg: ExposureConfig = toml::from_str(&contents)?;
    let dirname = fname
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_default();
    cfg.fixup_relative_paths(&dirname)?;
    cfg.validate()?;
    tracing::debug!("loaded exposure configuration from \"{}\"", fname.display());
    Ok(cfg)
}

/// The default configuration rendered as TOML, as a starting point for
/// operators.
pub fn default_config_toml() -> Result<String> {
    Ok(toml::to_string_pretty(&ExposureConfig::default())?)
}
