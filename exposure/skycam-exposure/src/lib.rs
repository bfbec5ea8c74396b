//! Adaptive exposure control for an unattended sky camera.
//!
//! Once per capture interval the [ExposureEngine] turns a short test exposure
//! and the brightness of the previous frame into exposure time, analogue
//! gain and white balance gains. The pipeline is:
//!
//! 1. [lux] estimates ambient light from the test shot,
//! 2. [signal] smooths the estimate and flags rapid changes,
//! 3. [mode] classifies night, day or transition with hysteresis,
//! 4. [target] computes closed-form targets, including the sequential ramp,
//! 5. [predictor] optionally blends in exposures learned from past frames,
//! 6. [feedback] corrects for the brightness actually achieved,
//! 7. [smoother] moves the emitted values towards their targets,
//! 8. [handover] seeds manual control from the last automatic frame.
//!
//! All mutable state lives in one [ControllerState] owned by the engine.
//! [CaptureLoop] drives an engine against a camera, an analyzer and a capture
//! store.

// Copyright 2020-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod feedback;
pub mod handover;
pub mod lux;
pub mod mode;
pub mod predictor;
pub mod signal;
pub mod smoother;
pub mod target;

mod capture_loop;
mod engine;
mod state;

pub use capture_loop::{CaptureFailure, CaptureLoop, CaptureOutcome};
pub use engine::{CycleReport, ExposureEngine, Measurement, MeasurementStatus, TestShot};
pub use predictor::{HistoricalPredictor, PredictorModel, RetrainOutcome};
pub use state::ControllerState;

pub use skycam_exposure_config::ExposureConfig;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigError(#[from] skycam_exposure_config::Error),
    #[error("capture store error: {0}")]
    StoreError(#[from] skycam_capture_store::Error),
    #[error("camera error: {0}")]
    CameraError(#[from] skycam_ci::Error),
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn _test_error_is_send() {
    fn implements<T: Send>() {}
    implements::<Error>();
}
