//! The capture loop: one engine driving one camera.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use skycam_capture_store::CaptureStore;
use skycam_ci::{BrightnessAnalyzer, CameraControl, SunElevation};
use skycam_types::CaptureRecord;

use crate::{CycleReport, ExposureEngine, RetrainOutcome};

/// Longest single sleep between stop flag checks.
const MAX_SLEEP_SLICE: std::time::Duration = std::time::Duration::from_millis(200);

/// Which step of a capture failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureFailure {
    ApplySettings,
    CaptureFrame,
    Analyze,
    Store,
}

/// Everything that happened in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureOutcome {
    pub report: CycleReport,
    /// The record appended to the store, if the frame was captured and
    /// analyzed.
    pub record: Option<CaptureRecord>,
    pub failure: Option<CaptureFailure>,
    pub retrain: RetrainOutcome,
}

pub struct CaptureLoop<C, A, S, St> {
    engine: ExposureEngine,
    camera: C,
    analyzer: A,
    sun: S,
    store: St,
}

impl<C, A, S, St> CaptureLoop<C, A, S, St>
where
    C: CameraControl,
    A: BrightnessAnalyzer,
    S: SunElevation,
    St: CaptureStore,
{
    pub fn new(engine: ExposureEngine, camera: C, analyzer: A, sun: S, store: St) -> Self {
        Self {
            engine,
            camera,
            analyzer,
            sun,
            store,
        }
    }

    pub fn engine(&self) -> &ExposureEngine {
        &self.engine
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn into_inner(self) -> (ExposureEngine, C, A, S, St) {
        (self.engine, self.camera, self.analyzer, self.sun, self.store)
    }

    /// One iteration: cycle the engine, apply its values, capture a frame,
    /// analyze and record it, then retrain the predictor if due.
    ///
    /// Camera and analyzer failures are logged and end the capture part of
    /// the iteration early, before the frame is observed. A store failure is
    /// logged after the frame was observed. None of them abort the loop.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> CaptureOutcome {
        let report = self
            .engine
            .cycle(now, &mut self.camera, &self.analyzer, &self.sun);
        let (record, failure) = self.capture(now, &report);
        let retrain = self.engine.maybe_retrain(now, &self.store);
        CaptureOutcome {
            report,
            record,
            failure,
            retrain,
        }
    }

    fn capture(
        &mut self,
        now: DateTime<Utc>,
        report: &CycleReport,
    ) -> (Option<CaptureRecord>, Option<CaptureFailure>) {
        if let Err(e) = self.camera.apply_settings(&report.values) {
            tracing::warn!("could not apply settings: {e}");
            return (None, Some(CaptureFailure::ApplySettings));
        }
        let (image, metadata) = match self.camera.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("frame capture failed: {e}");
                return (None, Some(CaptureFailure::CaptureFrame));
            }
        };
        let stats = match self.analyzer.analyze(&image) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("frame analysis failed: {e}");
                return (None, Some(CaptureFailure::Analyze));
            }
        };

        let Some(record) =
            self.engine
                .observe_frame(now, &metadata, Some(&stats), report.sun_elevation_deg)
        else {
            return (None, None);
        };
        if let Err(e) = self.store.append(&record) {
            tracing::warn!("could not store capture record: {e}");
            return (Some(record), Some(CaptureFailure::Store));
        }
        (Some(record), None)
    }

    /// Run until `stop` is set, one iteration every `interval`, taking the
    /// time of each iteration from `clock`. The flag is only checked between
    /// iterations. Returns the number of iterations run.
    pub fn run<F>(&mut self, stop: &AtomicBool, interval: std::time::Duration, mut clock: F) -> u64
    where
        F: FnMut() -> DateTime<Utc>,
    {
        let mut iterations = 0;
        tracing::info!("capture loop started, interval {interval:?}");
        while !stop.load(Ordering::SeqCst) {
            let started = std::time::Instant::now();
            let outcome = self.run_once(clock());
            iterations += 1;
            tracing::debug!(
                "iteration {iterations}: {} {:.6} s gain {:.2}",
                outcome.report.light_mode,
                outcome.report.exposure_s,
                outcome.report.values.analogue_gain
            );

            // sleep out the rest of the interval in short slices
            while !stop.load(Ordering::SeqCst) {
                let elapsed = started.elapsed();
                if elapsed >= interval {
                    break;
                }
                std::thread::sleep((interval - elapsed).min(MAX_SLEEP_SLICE));
            }
        }
        tracing::info!("capture loop stopped after {iterations} iterations");
        iterations
    }
}
