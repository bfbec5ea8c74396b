//! Core data types shared by the sky camera exposure control crates.
//!
//! These are plain values: control settings sent to the camera, metadata and
//! brightness statistics coming back from it, and the immutable
//! [CaptureRecord] persisted for every real capture.

// Copyright 2020-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

/// Coarse ambient light regime which selects the control strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightMode {
    /// Dark sky. Camera is under manual control with long exposures.
    Night,
    /// Bright sky. Camera runs its own auto exposure and auto white balance.
    Day,
    /// Dusk or dawn. Manual control, ramping between the day and night settings.
    Transition,
}

impl LightMode {
    /// Whether the engine (rather than the camera) chooses exposure and gain.
    pub fn is_manual(&self) -> bool {
        !matches!(self, LightMode::Day)
    }
}

// use Debug to impl Display
impl std::fmt::Display for LightMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        std::fmt::Debug::fmt(self, fmt)
    }
}

/// How bad an exposure alarm is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// A coarse time-of-day class derived from the sun's elevation.
///
/// The discriminant is used as an index into fixed-size tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolarPeriod {
    Night = 0,
    Twilight = 1,
    Day = 2,
}

/// Elevation (degrees) below which the sky counts as astronomical night.
pub const NIGHT_MAX_ELEVATION_DEG: f64 = -12.0;

/// Elevation (degrees) at and above which the sun is up.
pub const DAY_MIN_ELEVATION_DEG: f64 = 0.0;

impl SolarPeriod {
    pub const ALL: [SolarPeriod; 3] = [SolarPeriod::Night, SolarPeriod::Twilight, SolarPeriod::Day];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Classify by sun elevation in degrees.
    pub fn from_elevation(elevation_deg: f64) -> Self {
        if elevation_deg < NIGHT_MAX_ELEVATION_DEG {
            SolarPeriod::Night
        } else if elevation_deg < DAY_MIN_ELEVATION_DEG {
            SolarPeriod::Twilight
        } else {
            SolarPeriod::Day
        }
    }

    /// Classify by local clock hour (0-23).
    ///
    /// Only used when no sun elevation is available. This is wrong at high
    /// latitudes in summer and winter.
    pub fn from_local_hour(hour: u32) -> Self {
        match hour {
            7..=18 => SolarPeriod::Day,
            5..=6 | 19..=20 => SolarPeriod::Twilight,
            _ => SolarPeriod::Night,
        }
    }
}

impl std::fmt::Display for SolarPeriod {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        let s = match self {
            SolarPeriod::Night => "night",
            SolarPeriod::Twilight => "twilight",
            SolarPeriod::Day => "day",
        };
        write!(fmt, "{s}")
    }
}

/// Red and blue white balance gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColourGains {
    pub red: f64,
    pub blue: f64,
}

impl ColourGains {
    pub const fn new(red: f64, blue: f64) -> Self {
        Self { red, blue }
    }

    /// Linear interpolation, `t == 0` gives `self`, `t == 1` gives `other`.
    pub fn lerp(&self, other: &ColourGains, t: f64) -> ColourGains {
        ColourGains {
            red: self.red + t * (other.red - self.red),
            blue: self.blue + t * (other.blue - self.blue),
        }
    }

    /// Both gains are finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.red.is_finite() && self.blue.is_finite() && self.red > 0.0 && self.blue > 0.0
    }
}

impl From<[f64; 2]> for ColourGains {
    fn from(orig: [f64; 2]) -> Self {
        Self::new(orig[0], orig[1])
    }
}

/// The control values emitted to the camera once per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlValues {
    /// Exposure time in microseconds.
    pub exposure_time_us: u64,
    pub analogue_gain: f64,
    pub colour_gains: ColourGains,
    /// Auto white balance. When set, `colour_gains` is advisory.
    pub awb_enabled: bool,
    /// Auto exposure. When set, `exposure_time_us` and `analogue_gain` are advisory.
    pub ae_enabled: bool,
}

impl ControlValues {
    pub fn exposure_s(&self) -> f64 {
        us_to_seconds(self.exposure_time_us)
    }

    /// Exposure value, modelled as `exposure_seconds * gain`.
    pub fn ev(&self) -> f64 {
        self.exposure_s() * self.analogue_gain
    }
}

/// Per-frame metadata reported by the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Actual exposure time in microseconds.
    pub exposure_time_us: u64,
    /// Actual analogue gain.
    pub analogue_gain: f64,
    /// Actual white balance gains, as chosen by AWB when it is enabled.
    pub colour_gains: ColourGains,
    /// Sensor temperature in degrees Celsius, if reported.
    pub sensor_temperature: Option<f64>,
    /// The ISP's own lux estimate, if reported.
    pub lux: Option<f64>,
}

impl FrameMetadata {
    pub fn exposure_s(&self) -> f64 {
        us_to_seconds(self.exposure_time_us)
    }
}

/// Brightness statistics of one image.
///
/// Brightness values are in `[0, 255]`, percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightnessStats {
    pub mean: f64,
    pub median: f64,
    pub p5: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub underexposed_pct: f64,
    pub overexposed_pct: f64,
}

impl BrightnessStats {
    /// Statistics of an image where every pixel has the same value.
    pub fn uniform(value: f64) -> Self {
        Self {
            mean: value,
            median: value,
            p5: value,
            p25: value,
            p75: value,
            p95: value,
            underexposed_pct: 0.0,
            overexposed_pct: 0.0,
        }
    }
}

/// An 8-bit single channel image with a tightly packed buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mono8Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Mono8Image {
    pub fn new_filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }
}

/// A record of one real capture. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Smoothed ambient light estimate at capture time.
    pub lux: f64,
    /// Actual exposure time in microseconds.
    pub exposure_us: u64,
    /// Actual analogue gain.
    pub gain: f64,
    pub brightness: BrightnessStats,
    pub sun_elevation_deg: Option<f64>,
    #[serde(default)]
    pub mode: Option<LightMode>,
}

impl CaptureRecord {
    pub fn exposure_s(&self) -> f64 {
        us_to_seconds(self.exposure_us)
    }
}

pub fn us_to_seconds(us: u64) -> f64 {
    us as f64 * 1e-6
}

/// Convert seconds to whole microseconds, rounding to nearest and never
/// returning zero.
pub fn seconds_to_us(seconds: f64) -> u64 {
    let us = (seconds * 1e6).round();
    if us.is_finite() && us >= 1.0 {
        us as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solar_period_thresholds() {
        assert_eq!(SolarPeriod::from_elevation(-30.0), SolarPeriod::Night);
        assert_eq!(SolarPeriod::from_elevation(-12.0), SolarPeriod::Twilight);
        assert_eq!(SolarPeriod::from_elevation(-0.5), SolarPeriod::Twilight);
        assert_eq!(SolarPeriod::from_elevation(0.0), SolarPeriod::Day);
        assert_eq!(SolarPeriod::from_elevation(60.0), SolarPeriod::Day);
    }

    #[test]
    fn solar_period_from_clock() {
        assert_eq!(SolarPeriod::from_local_hour(0), SolarPeriod::Night);
        assert_eq!(SolarPeriod::from_local_hour(5), SolarPeriod::Twilight);
        assert_eq!(SolarPeriod::from_local_hour(12), SolarPeriod::Day);
        assert_eq!(SolarPeriod::from_local_hour(20), SolarPeriod::Twilight);
        assert_eq!(SolarPeriod::from_local_hour(23), SolarPeriod::Night);
    }

    #[test]
    fn microsecond_conversion_never_zero() {
        assert_eq!(seconds_to_us(0.0), 1);
        assert_eq!(seconds_to_us(f64::NAN), 1);
        assert_eq!(seconds_to_us(0.5), 500_000);
        assert_eq!(seconds_to_us(20.0), 20_000_000);
    }

    #[test]
    fn capture_record_json() {
        let rec = CaptureRecord {
            timestamp: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            lux: 0.2,
            exposure_us: 15_000_000,
            gain: 8.0,
            brightness: BrightnessStats::uniform(110.0),
            sun_elevation_deg: Some(-20.0),
            mode: Some(LightMode::Night),
        };
        let buf = serde_json::to_string(&rec).unwrap();
        let rec2: CaptureRecord = serde_json::from_str(&buf).unwrap();
        assert_eq!(rec, rec2);
    }
}
