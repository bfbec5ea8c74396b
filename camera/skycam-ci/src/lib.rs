//! Camera interface (ci) trait definitions for the sky camera.
//!
//! The exposure engine never touches hardware. It talks to the outside world
//! through the traits in this crate: [CameraControl] applies settings and
//! returns frames, [BrightnessAnalyzer] summarises an image and [SunElevation]
//! reports the solar angle.

// Copyright 2020-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use skycam_types::{BrightnessStats, ControlValues, FrameMetadata, Mono8Image};

mod histogram;

pub use histogram::{HistogramAnalyzer, OVEREXPOSED_LEVEL, UNDEREXPOSED_LEVEL};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timeout")]
    Timeout,
    #[error("CameraError({msg})")]
    CameraError { msg: String },
    #[error("AnalysisError({0})")]
    AnalysisError(String),
    #[error("image has no pixels")]
    EmptyImage,
    #[error("BackendError({0})")]
    BackendError(#[from] anyhow::Error),
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CameraError {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::CameraError { msg }
    }
}

// ---------------------------
// CameraControl

/// Access to a physical (or simulated) camera.
///
/// Implementations are responsible for bounding the duration of every call,
/// returning [Error::Timeout] rather than blocking forever.
pub trait CameraControl {
    /// Apply control values. Returns the metadata the camera reports for the
    /// settings it actually applied.
    fn apply_settings(&mut self, values: &ControlValues) -> Result<FrameMetadata>;

    /// Capture a short manual test exposure with the given settings, used for
    /// ambient light estimation. Does not change the applied settings.
    fn capture_test_shot(
        &mut self,
        exposure_time_us: u64,
        gain: f64,
    ) -> Result<(Mono8Image, FrameMetadata)>;

    /// Capture one real frame with the currently applied settings.
    fn capture_frame(&mut self) -> Result<(Mono8Image, FrameMetadata)>;
}

// ---------------------------
// BrightnessAnalyzer

pub trait BrightnessAnalyzer {
    fn analyze(&self, image: &Mono8Image) -> Result<BrightnessStats>;
}

// ---------------------------
// SunElevation

/// Solar elevation provider.
pub trait SunElevation {
    /// Sun elevation above the horizon in degrees, or `None` when unknown.
    fn elevation_degrees(&self, timestamp: chrono::DateTime<chrono::Utc>) -> Option<f64>;
}

/// A [SunElevation] that never knows the answer.
///
/// With this provider, solar periods fall back to clock hours and the
/// polar-day override never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSunElevation;

impl SunElevation for NoSunElevation {
    fn elevation_degrees(&self, _timestamp: chrono::DateTime<chrono::Utc>) -> Option<f64> {
        None
    }
}

impl<T: SunElevation + ?Sized> SunElevation for Box<T> {
    fn elevation_degrees(&self, timestamp: chrono::DateTime<chrono::Utc>) -> Option<f64> {
        (**self).elevation_degrees(timestamp)
    }
}

impl<T: BrightnessAnalyzer + ?Sized> BrightnessAnalyzer for Box<T> {
    fn analyze(&self, image: &Mono8Image) -> Result<BrightnessStats> {
        (**self).analyze(image)
    }
}

impl<T: CameraControl + ?Sized> CameraControl for Box<T> {
    fn apply_settings(&mut self, values: &ControlValues) -> Result<FrameMetadata> {
        (**self).apply_settings(values)
    }
    fn capture_test_shot(
        &mut self,
        exposure_time_us: u64,
        gain: f64,
    ) -> Result<(Mono8Image, FrameMetadata)> {
        (**self).capture_test_shot(exposure_time_us, gain)
    }
    fn capture_frame(&mut self) -> Result<(Mono8Image, FrameMetadata)> {
        (**self).capture_frame()
    }
}
