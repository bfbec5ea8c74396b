//! Historical exposure predictor.
//!
//! Exposures of past well exposed frames are averaged into a fixed table
//! indexed by solar period and logarithmic lux bucket. The table is rebuilt
//! wholesale from the capture store, never updated incrementally. Predictions
//! come with a confidence and a record of how they were derived; the caller
//! blends them with the formula target using a trust weight that grows with
//! the number of populated buckets.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use skycam_capture_store::{AuroraHeuristic, CaptureStore, TrainingFilter};
use skycam_exposure_config::PredictorConfig;
use skycam_types::{CaptureRecord, SolarPeriod};

use crate::Result;

/// Lower edges of the lux buckets. Bucket `i` covers `[bp[i], bp[i+1])`.
pub const LUX_BREAKPOINTS: [f64; NUM_BUCKETS] = [
    0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0,
    1000.0, 5000.0, 20000.0,
];

pub const NUM_BUCKETS: usize = 18;

const NUM_PERIODS: usize = SolarPeriod::ALL.len();

const INTERPOLATED_CONFIDENCE: f64 = 0.7;
const ONE_SIDED_CONFIDENCE: f64 = 0.5;
const OTHER_PERIOD_CONFIDENCE: f64 = 0.5;
const CROSS_PERIOD_CONFIDENCE: f64 = 0.35;

/// The bucket holding `lux`. Values below the first breakpoint land in the
/// first bucket, values above the last in the last.
pub fn lux_bucket(lux: f64) -> usize {
    if lux.is_nan() {
        return 0;
    }
    LUX_BREAKPOINTS
        .iter()
        .rposition(|bp| lux >= *bp)
        .unwrap_or(0)
}

/// Solar period from the sun elevation, or from the local clock hour when the
/// elevation is unknown.
pub fn solar_period_for(
    timestamp: DateTime<Utc>,
    sun_elevation_deg: Option<f64>,
    utc_offset_hours: f64,
) -> SolarPeriod {
    match sun_elevation_deg {
        Some(elevation) if elevation.is_finite() => SolarPeriod::from_elevation(elevation),
        _ => {
            let offset = chrono::Duration::minutes((utc_offset_hours * 60.0).round() as i64);
            SolarPeriod::from_local_hour((timestamp + offset).hour())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub mean_exposure_s: f64,
    /// Mean of `ln(lux)` over the bucket's samples, the bucket's position on
    /// the interpolation axis.
    pub mean_log_lux: f64,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum_exposure_s: f64,
    sum_log_lux: f64,
    samples: u32,
}

impl Accumulator {
    fn add(&mut self, exposure_s: f64, log_lux: f64, samples: u32) {
        self.sum_exposure_s += exposure_s * samples as f64;
        self.sum_log_lux += log_lux * samples as f64;
        self.samples += samples;
    }

    fn finish(&self) -> Option<BucketStats> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(BucketStats {
            mean_exposure_s: self.sum_exposure_s / n,
            mean_log_lux: self.sum_log_lux / n,
            samples: self.samples,
        })
    }
}

/// How a [Prediction] was obtained, in decreasing order of confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PredictionSource {
    Exact,
    Interpolated,
    OneSided,
    OtherPeriod,
    CrossPeriodInterpolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub exposure_s: f64,
    /// In `(0, 1]`.
    pub confidence: f64,
    pub source: PredictionSource,
    pub period: SolarPeriod,
    pub bucket: usize,
}

/// A trained predictor table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorModel {
    pub trained_at: DateTime<Utc>,
    /// Number of records the table was built from.
    pub training_records: usize,
    /// Indexed by [SolarPeriod::index] then lux bucket.
    pub buckets: [[Option<BucketStats>; NUM_BUCKETS]; NUM_PERIODS],
}

impl PredictorModel {
    pub fn empty(trained_at: DateTime<Utc>) -> Self {
        Self {
            trained_at,
            training_records: 0,
            buckets: [[None; NUM_BUCKETS]; NUM_PERIODS],
        }
    }

    /// Build a table from `records`, dropping buckets with fewer than
    /// `min_samples` entries. Records are assumed to be pre-filtered.
    pub fn train(
        records: &[CaptureRecord],
        min_samples: u32,
        utc_offset_hours: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut acc = [[Accumulator::default(); NUM_BUCKETS]; NUM_PERIODS];
        let mut used = 0;
        for record in records {
            let exposure_s = record.exposure_s();
            if !(record.lux.is_finite() && record.lux > 0.0 && exposure_s > 0.0) {
                continue;
            }
            let period =
                solar_period_for(record.timestamp, record.sun_elevation_deg, utc_offset_hours);
            acc[period.index()][lux_bucket(record.lux)].add(exposure_s, record.lux.ln(), 1);
            used += 1;
        }

        let mut model = Self::empty(now);
        model.training_records = used;
        for (period_row, acc_row) in model.buckets.iter_mut().zip(acc.iter()) {
            for (slot, a) in period_row.iter_mut().zip(acc_row.iter()) {
                *slot = a.finish().filter(|s| s.samples >= min_samples);
            }
        }
        model
    }

    pub fn bucket(&self, period: SolarPeriod, bucket: usize) -> Option<&BucketStats> {
        self.buckets[period.index()].get(bucket)?.as_ref()
    }

    pub fn populated_buckets(&self) -> usize {
        self.buckets.iter().flatten().filter(|b| b.is_some()).count()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        now - self.trained_at > interval
    }

    /// Predict the exposure for `lux` in `period`.
    ///
    /// Tries, in order: the exact bucket; interpolation between the nearest
    /// populated buckets of the same period (or the one populated side); the
    /// same bucket in another period; interpolation across all periods.
    pub fn predict(&self, lux: f64, period: SolarPeriod, confident_samples: u32) -> Option<Prediction> {
        if !(lux.is_finite() && lux > 0.0) {
            return None;
        }
        let b = lux_bucket(lux);
        let conf = |s: &BucketStats| sample_confidence(s.samples, confident_samples);
        let make = |exposure_s: f64, confidence: f64, source| Prediction {
            exposure_s,
            confidence,
            source,
            period,
            bucket: b,
        };

        let row = &self.buckets[period.index()];
        if let Some(stats) = &row[b] {
            return Some(make(stats.mean_exposure_s, conf(stats), PredictionSource::Exact));
        }

        match neighbours(row, b) {
            (Some(lo), Some(hi)) => {
                return Some(make(
                    interpolate(lo, hi, lux.ln()),
                    INTERPOLATED_CONFIDENCE * conf(lo).min(conf(hi)),
                    PredictionSource::Interpolated,
                ));
            }
            (Some(side), None) | (None, Some(side)) => {
                return Some(make(
                    side.mean_exposure_s,
                    ONE_SIDED_CONFIDENCE * conf(side),
                    PredictionSource::OneSided,
                ));
            }
            (None, None) => {}
        }

        let other = SolarPeriod::ALL
            .iter()
            .filter(|p| **p != period)
            .filter_map(|p| self.buckets[p.index()][b].as_ref())
            .max_by_key(|s| s.samples);
        if let Some(stats) = other {
            return Some(make(
                stats.mean_exposure_s,
                OTHER_PERIOD_CONFIDENCE * conf(stats),
                PredictionSource::OtherPeriod,
            ));
        }

        let merged = self.merged_row();
        if let (Some(lo), Some(hi)) = neighbours(&merged, b) {
            return Some(make(
                interpolate(lo, hi, lux.ln()),
                CROSS_PERIOD_CONFIDENCE * conf(lo).min(conf(hi)),
                PredictionSource::CrossPeriodInterpolated,
            ));
        }

        None
    }

    /// All periods pooled, sample weighted.
    fn merged_row(&self) -> [Option<BucketStats>; NUM_BUCKETS] {
        let mut acc = [Accumulator::default(); NUM_BUCKETS];
        for row in self.buckets.iter() {
            for (a, stats) in acc.iter_mut().zip(row.iter()) {
                if let Some(s) = stats {
                    a.add(s.mean_exposure_s, s.mean_log_lux, s.samples);
                }
            }
        }
        acc.map(|a| a.finish())
    }

    /// Save as pretty JSON. The file is written beside its destination and
    /// renamed into place.
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let buf = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, buf)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let rdr = std::fs::File::open(path.as_ref())?;
        let model = serde_json::from_reader(std::io::BufReader::new(rdr))?;
        Ok(model)
    }
}

fn sample_confidence(samples: u32, confident_samples: u32) -> f64 {
    (samples as f64 / confident_samples.max(1) as f64).min(1.0)
}

/// The nearest populated buckets strictly below and strictly above `b`.
fn neighbours(
    row: &[Option<BucketStats>; NUM_BUCKETS],
    b: usize,
) -> (Option<&BucketStats>, Option<&BucketStats>) {
    let lo = row[..b].iter().rev().find_map(|s| s.as_ref());
    let hi = row[b + 1..].iter().find_map(|s| s.as_ref());
    (lo, hi)
}

/// Log-log interpolation of exposure against lux.
fn interpolate(lo: &BucketStats, hi: &BucketStats, log_lux: f64) -> f64 {
    let span = hi.mean_log_lux - lo.mean_log_lux;
    let t = if span.abs() <= f64::EPSILON {
        0.5
    } else {
        ((log_lux - lo.mean_log_lux) / span).clamp(0.0, 1.0)
    };
    crate::target::log_lerp(lo.mean_exposure_s, hi.mean_exposure_s, t)
}

/// Linear blend of a prediction into the formula value.
pub fn blend(formula: f64, prediction: f64, trust: f64) -> f64 {
    trust * prediction + (1.0 - trust) * formula
}

/// Outcome of [HistoricalPredictor::maybe_retrain].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetrainOutcome {
    Disabled,
    NotDue,
    Trained {
        records: usize,
        populated_buckets: usize,
    },
    /// The store query failed. The previous model, if any, is kept.
    Failed,
}

/// The predictor as owned by the engine: configuration, the current model
/// and retraining bookkeeping.
#[derive(Debug, Clone)]
pub struct HistoricalPredictor {
    cfg: PredictorConfig,
    utc_offset_hours: f64,
    model: Option<PredictorModel>,
    next_attempt: Option<DateTime<Utc>>,
}

impl HistoricalPredictor {
    /// Create the predictor, loading a saved model from `model_path` if one
    /// exists. An unreadable model is logged and ignored.
    pub fn new(cfg: PredictorConfig, utc_offset_hours: f64) -> Self {
        let model = match &cfg.model_path {
            Some(path) if cfg.enabled && path.exists() => match PredictorModel::load(path) {
                Ok(model) => {
                    tracing::info!(
                        "loaded predictor model from \"{}\" ({} populated buckets, trained {})",
                        path.display(),
                        model.populated_buckets(),
                        model.trained_at
                    );
                    Some(model)
                }
                Err(e) => {
                    tracing::warn!(
                        "ignoring unreadable predictor model \"{}\": {e}",
                        path.display()
                    );
                    None
                }
            },
            _ => None,
        };
        Self {
            cfg,
            utc_offset_hours,
            model,
            next_attempt: None,
        }
    }

    pub fn with_model(mut self, model: PredictorModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn set_model(&mut self, model: PredictorModel) {
        self.model = Some(model);
        self.next_attempt = None;
    }

    pub fn model(&self) -> Option<&PredictorModel> {
        self.model.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn training_filter(&self) -> TrainingFilter {
        TrainingFilter {
            brightness_min: self.cfg.good_brightness_min,
            brightness_max: self.cfg.good_brightness_max,
            aurora: Some(AuroraHeuristic {
                max_lux: self.cfg.aurora_max_lux,
                max_mean: self.cfg.aurora_max_mean,
                min_p95: self.cfg.aurora_min_p95,
            }),
        }
    }

    pub fn period_for(&self, now: DateTime<Utc>, sun_elevation_deg: Option<f64>) -> SolarPeriod {
        solar_period_for(now, sun_elevation_deg, self.utc_offset_hours)
    }

    /// Blending weight for predictions, zero without a model.
    pub fn trust(&self) -> f64 {
        match &self.model {
            Some(model) if self.cfg.enabled => (model.populated_buckets() as f64
                * self.cfg.trust_per_bucket)
                .min(self.cfg.max_trust),
            _ => 0.0,
        }
    }

    pub fn predict(&self, lux: f64, period: SolarPeriod) -> Option<Prediction> {
        if !self.cfg.enabled {
            return None;
        }
        self.model
            .as_ref()?
            .predict(lux, period, self.cfg.confident_samples)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.next_attempt.is_some_and(|t| now < t) {
            return false;
        }
        match &self.model {
            None => true,
            Some(model) => model.is_stale(now, self.cfg.retrain_interval()),
        }
    }

    /// Retrain from `store` if the model is absent or stale.
    ///
    /// A failed query leaves the current model in place and defers the next
    /// attempt by one retrain interval. A failure to save the new model is
    /// logged; the model is still used.
    pub fn maybe_retrain<S: CaptureStore + ?Sized>(
        &mut self,
        now: DateTime<Utc>,
        store: &S,
    ) -> RetrainOutcome {
        if !self.cfg.enabled {
            return RetrainOutcome::Disabled;
        }
        if !self.is_due(now) {
            return RetrainOutcome::NotDue;
        }

        let records = match store.query(&self.training_filter(), self.cfg.query_limit) {
            Ok(records) => records,
            Err(e) => {
                let retry = now
                    .checked_add_signed(self.cfg.retrain_interval())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tracing::warn!("predictor training failed, keeping previous model until {retry}: {e}");
                self.next_attempt = Some(retry);
                return RetrainOutcome::Failed;
            }
        };

        let model = PredictorModel::train(
            &records,
            self.cfg.min_samples,
            self.utc_offset_hours,
            now,
        );
        let populated_buckets = model.populated_buckets();
        tracing::info!(
            "trained predictor from {} records: {populated_buckets} populated buckets",
            model.training_records
        );

        if let Some(path) = &self.cfg.model_path {
            if let Err(e) = model.save(path) {
                tracing::warn!("could not save predictor model to \"{}\": {e}", path.display());
            }
        }

        let outcome = RetrainOutcome::Trained {
            records: model.training_records,
            populated_buckets,
        };
        self.model = Some(model);
        self.next_attempt = None;
        outcome
    }
}
