//! The exposure engine: one full measure, classify, target, feedback, smooth
//! and emit cycle per call.

use chrono::{DateTime, Utc};
use serde::Serialize;

use skycam_capture_store::CaptureStore;
use skycam_ci::{BrightnessAnalyzer, CameraControl, SunElevation};
use skycam_exposure_config::ExposureConfig;
use skycam_types::{
    BrightnessStats, CaptureRecord, ColourGains, ControlValues, FrameMetadata, LightMode,
    SolarPeriod, seconds_to_us,
};

use crate::{
    ControllerState, Result,
    feedback::FeedbackController,
    handover::{EvClamp, HandoverSeeder, Seed, SeedInputs},
    lux::{LuxEstimate, LuxEstimator, LuxSource},
    mode::{ModeClassifier, ModeDecision, ModeInputs},
    predictor::{HistoricalPredictor, Prediction, RetrainOutcome, blend},
    signal::{SignalConditioner, SignalReading},
    smoother::{SmoothedValues, SmootherTargets, TransitionSmoother},
    target::{RampStart, TargetCalculator, Targets},
};

/// A test shot as taken by the camera, with its analysis if that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestShot {
    pub metadata: FrameMetadata,
    pub stats: Option<BrightnessStats>,
}

/// Everything measured at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurement {
    /// `None` when the test shot itself failed.
    pub test_shot: Option<TestShot>,
    pub sun_elevation_deg: Option<f64>,
}

impl Measurement {
    pub fn new(
        metadata: FrameMetadata,
        stats: Option<BrightnessStats>,
        sun_elevation_deg: Option<f64>,
    ) -> Self {
        Self {
            test_shot: Some(TestShot { metadata, stats }),
            sun_elevation_deg,
        }
    }

    pub fn failed(sun_elevation_deg: Option<f64>) -> Self {
        Self {
            test_shot: None,
            sun_elevation_deg,
        }
    }

    pub fn status(&self) -> MeasurementStatus {
        match &self.test_shot {
            None => MeasurementStatus::TestShotFailed,
            Some(TestShot { stats: None, .. }) => MeasurementStatus::AnalysisFailed,
            Some(_) => MeasurementStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeasurementStatus {
    Ok,
    AnalysisFailed,
    TestShotFailed,
}

/// What one cycle did and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub status: MeasurementStatus,
    /// The measurement was unusable and the previous values were re-emitted.
    pub held: bool,
    pub light_mode: LightMode,
    pub period: SolarPeriod,
    pub sun_elevation_deg: Option<f64>,
    pub lux: Option<LuxEstimate>,
    pub signal: Option<SignalReading>,
    pub decision: Option<ModeDecision>,
    pub targets: Option<Targets>,
    pub prediction: Option<Prediction>,
    pub trust: f64,
    /// Combined brightness correction and emergency factor applied.
    pub feedback_factor: f64,
    /// Exposure target after prediction blending and feedback.
    pub target_exposure_s: Option<f64>,
    /// Smoother exposure before this cycle's step.
    pub previous_exposure_s: Option<f64>,
    pub smoothed: Option<SmoothedValues>,
    pub seed: Option<Seed>,
    pub ev_clamp: Option<EvClamp>,
    /// Emitted exposure before rounding to microseconds.
    pub exposure_s: f64,
    pub values: ControlValues,
}

pub struct ExposureEngine {
    cfg: ExposureConfig,
    lux: LuxEstimator,
    signal: SignalConditioner,
    mode: ModeClassifier,
    target: TargetCalculator,
    feedback: FeedbackController,
    smoother: TransitionSmoother,
    handover: HandoverSeeder,
    predictor: HistoricalPredictor,
    state: ControllerState,
}

impl ExposureEngine {
    /// Validate `cfg` and build an engine with fresh state. A saved predictor
    /// model is loaded if configured.
    pub fn new(cfg: ExposureConfig) -> Result<Self> {
        cfg.validate()?;
        let predictor =
            HistoricalPredictor::new(cfg.predictor.clone(), cfg.site.utc_offset_hours);
        Ok(Self {
            lux: LuxEstimator::new(cfg.lux.clone()),
            signal: SignalConditioner::new(cfg.signal.clone()),
            mode: ModeClassifier::new(cfg.mode.clone()),
            target: TargetCalculator::new(cfg.target.clone(), &cfg.mode),
            feedback: FeedbackController::new(cfg.feedback.clone()),
            smoother: TransitionSmoother::new(
                cfg.smoothing.clone(),
                &cfg.target,
                cfg.white_balance.clone(),
            ),
            handover: HandoverSeeder::new(cfg.handover.clone(), &cfg.target),
            predictor,
            state: ControllerState::default(),
            cfg,
        })
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.cfg
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn predictor(&self) -> &HistoricalPredictor {
        &self.predictor
    }

    pub fn last_values(&self) -> Option<&ControlValues> {
        self.state.last_emitted.as_ref()
    }

    fn default_day_wb(&self) -> ColourGains {
        ColourGains::from(self.cfg.white_balance.default_day_gains)
    }

    /// Take and analyze the test shot. Failures are logged and reported in
    /// the returned [Measurement], never raised.
    pub fn measure<C, A, S>(
        &self,
        now: DateTime<Utc>,
        camera: &mut C,
        analyzer: &A,
        sun: &S,
    ) -> Measurement
    where
        C: CameraControl + ?Sized,
        A: BrightnessAnalyzer + ?Sized,
        S: SunElevation + ?Sized,
    {
        let sun_elevation_deg = sun.elevation_degrees(now);
        let (exposure_time_us, gain) = self.lux.test_shot_settings();
        match camera.capture_test_shot(exposure_time_us, gain) {
            Ok((image, metadata)) => {
                let stats = match analyzer.analyze(&image) {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        tracing::warn!("test shot analysis failed: {e}");
                        None
                    }
                };
                Measurement::new(metadata, stats, sun_elevation_deg)
            }
            Err(e) => {
                tracing::warn!("test shot failed: {e}");
                Measurement::failed(sun_elevation_deg)
            }
        }
    }

    /// Measure, then step.
    pub fn cycle<C, A, S>(
        &mut self,
        now: DateTime<Utc>,
        camera: &mut C,
        analyzer: &A,
        sun: &S,
    ) -> CycleReport
    where
        C: CameraControl + ?Sized,
        A: BrightnessAnalyzer + ?Sized,
        S: SunElevation + ?Sized,
    {
        let measurement = self.measure(now, camera, analyzer, sun);
        self.step(now, &measurement)
    }

    /// Run one control cycle on an existing measurement.
    ///
    /// When the measurement gives no usable lux, the previous control values
    /// are emitted again unchanged. Before anything was ever emitted, the
    /// default lux is used instead.
    pub fn step(&mut self, now: DateTime<Utc>, measurement: &Measurement) -> CycleReport {
        self.state.cycle += 1;
        let cycle = self.state.cycle;
        let span = tracing::debug_span!("cycle", cycle);
        let _enter = span.enter();

        let status = measurement.status();
        let period = self
            .predictor
            .period_for(now, measurement.sun_elevation_deg);

        // A default estimate carries no information once the signal is running.
        let estimate = measurement
            .test_shot
            .as_ref()
            .map(|shot| self.lux.estimate(shot.stats.as_ref(), &shot.metadata))
            .filter(|e| e.source != LuxSource::Default || self.state.signal.smoothed_lux.is_none());

        let estimate = match estimate {
            Some(estimate) => estimate,
            None => {
                if let (Some(values), Some(light_mode)) =
                    (self.state.last_emitted.clone(), self.state.mode.mode)
                {
                    tracing::warn!("measurement unusable ({status:?}), holding previous values");
                    let mut report =
                        self.held_report(cycle, now, status, light_mode, period, values);
                    report.sun_elevation_deg = measurement.sun_elevation_deg;
                    return report;
                }
                tracing::warn!("measurement unusable ({status:?}) on first cycle, using default lux");
                self.lux.default_estimate()
            }
        };

        let reading = self
            .signal
            .update(&mut self.state.signal, estimate.lux, now);
        let lux = reading.smoothed_lux;
        let previous_mode = self.state.mode.mode;
        let decision = self.mode.update(
            &mut self.state.mode,
            &ModeInputs {
                lux,
                sun_elevation_deg: measurement.sun_elevation_deg,
                last_brightness: self.state.last_brightness,
            },
        );
        let mode = decision.mode;
        let manual = mode.is_manual();

        let mut seed = None;
        if !manual {
            self.handover.reset(&mut self.state.handover);
        } else if self.handover.needs_seed(&self.state.handover, mode) {
            let formula = self.target.formula(lux);
            let inputs = SeedInputs {
                previous_capture: self.state.last_capture.as_ref(),
                after_day: previous_mode == Some(LightMode::Day),
                test_shot_wb: measurement
                    .test_shot
                    .as_ref()
                    .map(|shot| shot.metadata.colour_gains),
                day_reference: self.state.day_reference_wb,
                default_wb: self.default_day_wb(),
                formula_exposure_s: formula.exposure_s,
                formula_gain: formula.gain,
            };
            let s = self.handover.take_seed(&mut self.state.handover, &inputs);
            if s.is_day_handover() {
                self.state.day_reference_wb = Some(s.wb);
            }
            self.smoother
                .seed(&mut self.state.smoother, s.exposure_s, s.gain, s.wb);
            seed = Some(s);
        }

        // Without a real day capture to start from, the formula is used.
        let ramp_start = self
            .state
            .handover
            .seed
            .filter(Seed::is_day_handover)
            .map(|s| RampStart {
                exposure_s: s.exposure_s,
                gain: s.gain,
            });
        let targets = self.target.compute(mode, lux, ramp_start);

        // The sequential ramp owns the exposure axis while it runs.
        let trust = self.predictor.trust();
        let prediction = if manual && targets.ramp.is_none() {
            self.predictor.predict(lux, period)
        } else {
            None
        };
        let blended = match &prediction {
            Some(p) => blend(targets.exposure_s, p.exposure_s, trust),
            None => targets.exposure_s,
        };
        let feedback_factor = if manual {
            self.state.feedback.total_factor()
        } else {
            1.0
        };
        let target_exposure_s = self.target.clamp_exposure(blended * feedback_factor);

        let wb = self.smoother.wb_target(
            mode,
            targets.transition_position,
            self.state.day_reference_wb,
        );
        let previous_exposure_s = self.state.smoother.exposure_s;
        let smoothed = self.smoother.update(
            &mut self.state.smoother,
            &SmootherTargets {
                exposure_s: target_exposure_s,
                gain: targets.gain,
                wb,
            },
            reading.rapid_change,
            &self.state.feedback,
        );

        let ev_clamp = if manual {
            self.handover
                .check_ev_clamp(&mut self.state.handover, smoothed.exposure_s, smoothed.gain)
        } else {
            None
        };
        let exposure_s = match &ev_clamp {
            Some(clamp) => {
                self.smoother
                    .set_exposure(&mut self.state.smoother, clamp.exposure_s);
                clamp.exposure_s
            }
            None => smoothed.exposure_s,
        };

        let values = ControlValues {
            exposure_time_us: seconds_to_us(exposure_s),
            analogue_gain: smoothed.gain,
            colour_gains: smoothed.wb,
            awb_enabled: !manual,
            ae_enabled: !manual,
        };
        self.state.last_emitted = Some(values.clone());

        tracing::debug!(
            "{mode} lux {:.4} (raw {:.4}, {:?}): exposure {exposure_s:.6} s, gain {:.2}, \
            target {target_exposure_s:.6} s, factor {feedback_factor:.3}",
            lux,
            reading.raw_lux,
            estimate.source,
            smoothed.gain
        );
        if let Some(p) = &prediction {
            tracing::trace!(
                "prediction {:.6} s from {:?}, confidence {:.2}, trust {trust:.2}",
                p.exposure_s,
                p.source,
                p.confidence
            );
        }

        CycleReport {
            cycle,
            timestamp: now,
            status,
            held: false,
            light_mode: mode,
            period,
            sun_elevation_deg: measurement.sun_elevation_deg,
            lux: Some(estimate),
            signal: Some(reading),
            decision: Some(decision),
            targets: Some(targets),
            prediction,
            trust,
            feedback_factor,
            target_exposure_s: Some(target_exposure_s),
            previous_exposure_s,
            smoothed: Some(smoothed),
            seed,
            ev_clamp,
            exposure_s,
            values,
        }
    }

    fn held_report(
        &self,
        cycle: u64,
        now: DateTime<Utc>,
        status: MeasurementStatus,
        light_mode: LightMode,
        period: SolarPeriod,
        values: ControlValues,
    ) -> CycleReport {
        let exposure_s = self
            .state
            .smoother
            .exposure_s
            .unwrap_or_else(|| values.exposure_s());
        CycleReport {
            cycle,
            timestamp: now,
            status,
            held: true,
            light_mode,
            period,
            sun_elevation_deg: None,
            lux: None,
            signal: None,
            decision: None,
            targets: None,
            prediction: None,
            trust: self.predictor.trust(),
            feedback_factor: self.state.feedback.total_factor(),
            target_exposure_s: None,
            previous_exposure_s: Some(exposure_s),
            smoothed: None,
            seed: None,
            ev_clamp: None,
            exposure_s,
            values,
        }
    }

    /// Record the outcome of a real capture taken with the last emitted
    /// values.
    ///
    /// Updates brightness feedback (manual modes only, it relaxes otherwise),
    /// learns the day white balance reference from genuine auto white
    /// balance frames, and returns the [CaptureRecord] to store. Without
    /// brightness statistics no record is produced.
    pub fn observe_frame(
        &mut self,
        now: DateTime<Utc>,
        metadata: &FrameMetadata,
        stats: Option<&BrightnessStats>,
        sun_elevation_deg: Option<f64>,
    ) -> Option<CaptureRecord> {
        let mode = self.state.mode.mode;
        let manual = mode.is_some_and(|m| m.is_manual());
        self.state.last_capture = Some(metadata.clone());

        if let Some(stats) = stats {
            self.state.last_brightness = Some(stats.mean);
            if manual {
                self.feedback.update(&mut self.state.feedback, stats);
            } else {
                self.feedback.relax(&mut self.state.feedback);
            }
        }

        let awb = self
            .state
            .last_emitted
            .as_ref()
            .is_some_and(|v| v.awb_enabled);
        let bright_enough = self
            .state
            .signal
            .smoothed_lux
            .is_some_and(|lux| lux > self.cfg.white_balance.learn_min_lux);
        if mode == Some(LightMode::Day) && awb && bright_enough && metadata.colour_gains.is_valid() {
            tracing::trace!("day white balance reference {:?}", metadata.colour_gains);
            self.state.day_reference_wb = Some(metadata.colour_gains);
        }

        let stats = stats?;
        Some(CaptureRecord {
            timestamp: now,
            lux: self
                .state
                .signal
                .smoothed_lux
                .unwrap_or(self.cfg.lux.default_lux),
            exposure_us: metadata.exposure_time_us,
            gain: metadata.analogue_gain,
            brightness: *stats,
            sun_elevation_deg,
            mode,
        })
    }

    /// Retrain the predictor from `store` if its model is absent or stale.
    pub fn maybe_retrain<St: CaptureStore + ?Sized>(
        &mut self,
        now: DateTime<Utc>,
        store: &St,
    ) -> RetrainOutcome {
        self.predictor.maybe_retrain(now, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn metadata(exposure_time_us: u64, gain: f64) -> FrameMetadata {
        FrameMetadata {
            exposure_time_us,
            analogue_gain: gain,
            colour_gains: ColourGains::new(2.2, 1.4),
            sensor_temperature: None,
            lux: None,
        }
    }

    /// A 1 ms test shot whose brightness gives `lux`.
    fn shot(lux: f64) -> Measurement {
        let mean = lux * 128.0 * 0.001;
        Measurement::new(
            metadata(1_000, 1.0),
            Some(BrightnessStats::uniform(mean)),
            None,
        )
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut cfg = ExposureConfig::default();
        cfg.mode.hysteresis_frames = 0;
        assert!(matches!(
            ExposureEngine::new(cfg),
            Err(crate::Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_night_start_is_manual() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        let report = engine.step(t(0), &shot(0.5));
        assert_eq!(report.light_mode, LightMode::Night);
        assert!(!report.values.ae_enabled);
        assert!(!report.values.awb_enabled);
        // restart at night: nothing to seed from but the formula
        let seed = report.seed.unwrap();
        assert_eq!(seed.source, crate::handover::SeedSource::Formula);
        let target = ExposureConfig::default().target;
        assert_relative_eq!(
            report.exposure_s,
            target.max_night_exposure_s * target.reference_lux / 0.5,
            max_relative = 1e-9
        );
    }

    #[test]
    fn test_day_is_automatic() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        let report = engine.step(t(0), &shot(150.0));
        assert_eq!(report.light_mode, LightMode::Day);
        assert!(report.values.ae_enabled);
        assert!(report.values.awb_enabled);
        assert!(report.seed.is_none());
        assert_eq!(report.lux.unwrap().source, LuxSource::Brightness);
    }

    #[test]
    fn test_failed_first_measurement_uses_default_lux() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        let report = engine.step(t(0), &Measurement::failed(None));
        assert!(!report.held);
        assert_eq!(report.status, MeasurementStatus::TestShotFailed);
        assert_eq!(report.lux.unwrap().source, LuxSource::Default);
    }

    #[test]
    fn test_failed_measurement_holds_values() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        let first = engine.step(t(0), &shot(0.5));
        let lux_before = engine.state().smoothed_lux();

        let held = engine.step(t(30), &Measurement::failed(None));
        assert!(held.held);
        assert_eq!(held.values, first.values);
        assert_eq!(engine.state().smoothed_lux(), lux_before);

        // analysis failure without a metadata lux is no better
        let no_stats = Measurement::new(metadata(10_000, 1.0), None, None);
        let held = engine.step(t(60), &no_stats);
        assert!(held.held);
        assert_eq!(held.status, MeasurementStatus::AnalysisFailed);

        // but a metadata lux is used
        let mut md = metadata(10_000, 1.0);
        md.lux = Some(0.4);
        let report = engine.step(t(90), &Measurement::new(md, None, None));
        assert!(!report.held);
        assert_eq!(report.lux.unwrap().source, LuxSource::Metadata);
        assert_eq!(engine.state().cycle, 4);
    }

    #[test]
    fn test_observe_frame_builds_record() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        engine.step(t(0), &shot(0.5));
        let md = metadata(20_000_000, 8.0);
        let stats = BrightnessStats::uniform(60.0);
        let record = engine
            .observe_frame(t(5), &md, Some(&stats), Some(-30.0))
            .unwrap();
        assert_eq!(record.exposure_us, 20_000_000);
        assert_eq!(record.gain, 8.0);
        assert_eq!(record.mode, Some(LightMode::Night));
        assert_relative_eq!(record.lux, 0.5, max_relative = 1e-12);
        assert_eq!(engine.state().last_brightness, Some(60.0));
        // too dark: feedback pushes exposure up
        assert!(engine.state().feedback.correction > 1.0);

        assert!(engine.observe_frame(t(35), &md, None, None).is_none());
        assert_eq!(engine.state().last_capture, Some(md));
    }

    #[test]
    fn test_day_reference_learned_from_awb() {
        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        engine.step(t(0), &shot(150.0));
        let stats = BrightnessStats::uniform(120.0);
        // below learn_min_lux: not learned
        engine.observe_frame(t(1), &metadata(1000, 1.0), Some(&stats), None);
        assert!(engine.state().day_reference_wb.is_none());

        let mut engine = ExposureEngine::new(ExposureConfig::default()).unwrap();
        engine.step(t(0), &shot(400.0));
        engine.observe_frame(t(1), &metadata(1000, 1.0), Some(&stats), None);
        assert_eq!(
            engine.state().day_reference_wb,
            Some(ColourGains::new(2.2, 1.4))
        );
    }
}
