//! Exponential smoothing of the lux signal, rapid change detection and a
//! short history for trend extrapolation.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use nalgebra as na;
use serde::Serialize;
use skycam_exposure_config::SignalConfig;

/// Fewest samples needed for a trend estimate.
const MIN_TREND_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendSample {
    pub timestamp: DateTime<Utc>,
    pub raw_lux: f64,
}

/// Signal conditioner part of the controller state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalState {
    /// Unset until the first reading.
    pub smoothed_lux: Option<f64>,
    pub rapid_change: bool,
    pub history: VecDeque<TrendSample>,
}

/// Output of one conditioner update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalReading {
    pub raw_lux: f64,
    pub smoothed_lux: f64,
    pub rapid_change: bool,
}

#[derive(Debug, Clone)]
pub struct SignalConditioner {
    cfg: SignalConfig,
}

impl SignalConditioner {
    pub fn new(cfg: SignalConfig) -> Self {
        Self { cfg }
    }

    /// Whether `raw` differs from `prev` by more than the configured ratio in
    /// either direction.
    pub fn is_rapid_change(&self, prev: f64, raw: f64) -> bool {
        if prev <= 0.0 || raw <= 0.0 {
            return false;
        }
        (raw / prev).max(prev / raw) > self.cfg.rapid_change_ratio
    }

    /// Feed one raw lux reading.
    ///
    /// Rapid change is judged against the previous smoothed value, so it
    /// stays flagged while the average is still catching up with a jump.
    pub fn update(&self, st: &mut SignalState, raw_lux: f64, now: DateTime<Utc>) -> SignalReading {
        let (smoothed, rapid_change) = match st.smoothed_lux {
            None => (raw_lux, false),
            Some(prev) => {
                let alpha = self.cfg.smoothing_alpha;
                let smoothed = alpha * raw_lux + (1.0 - alpha) * prev;
                (smoothed, self.is_rapid_change(prev, raw_lux))
            }
        };
        st.smoothed_lux = Some(smoothed);
        st.rapid_change = rapid_change;

        while st.history.len() >= self.cfg.trend_history_len {
            st.history.pop_front();
        }
        st.history.push_back(TrendSample {
            timestamp: now,
            raw_lux,
        });

        if rapid_change {
            tracing::debug!("rapid lux change: raw {raw_lux:.4}, smoothed {smoothed:.4}");
        }

        SignalReading {
            raw_lux,
            smoothed_lux: smoothed,
            rapid_change,
        }
    }

    /// Extrapolate lux to `now + horizon` from a least squares line through
    /// `ln(lux)` over time.
    ///
    /// Returns `None` with too little history or when all samples share one
    /// timestamp.
    pub fn trend_lux(
        &self,
        st: &SignalState,
        now: DateTime<Utc>,
        horizon: chrono::Duration,
    ) -> Option<f64> {
        if st.history.len() < MIN_TREND_SAMPLES {
            return None;
        }
        let t0 = st.history.front()?.timestamp;
        let points: Vec<(f64, f64)> = st
            .history
            .iter()
            .filter(|s| s.raw_lux > 0.0)
            .map(|s| (seconds_between(t0, s.timestamp), s.raw_lux.ln()))
            .collect();
        if points.len() < MIN_TREND_SAMPLES || points.iter().all(|p| p.0 == points[0].0) {
            return None;
        }

        let (slope, offset) = fit_line(&points)?;
        let t = seconds_between(t0, now + horizon);
        let lux = (offset + slope * t).exp();
        lux.is_finite().then_some(lux)
    }
}

/// Least squares `y = slope * x + offset` through `points`.
fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    use na::{OMatrix, OVector, U2};

    let mut a: Vec<f64> = Vec::with_capacity(points.len() * 2);
    let mut b: Vec<f64> = Vec::with_capacity(points.len());
    for (x, y) in points.iter() {
        a.push(*x);
        a.push(1.0);
        b.push(*y);
    }
    let a = OMatrix::<f64, na::Dyn, U2>::from_row_slice(&a);
    let b = OVector::<f64, na::Dyn>::from_row_slice(&b);

    let epsilon = 1e-10;
    match lstsq::lstsq(&a, &b, epsilon) {
        Ok(results) => Some((results.solution[0], results.solution[1])),
        Err(msg) => {
            tracing::debug!("lux trend fit failed: {msg}");
            None
        }
    }
}

fn seconds_between(t0: DateTime<Utc>, t1: DateTime<Utc>) -> f64 {
    (t1 - t0).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_reading_initializes() {
        let sc = SignalConditioner::new(SignalConfig::default());
        let mut st = SignalState::default();
        assert!(st.smoothed_lux.is_none());
        let r = sc.update(&mut st, 42.0, t(0));
        assert_eq!(r.smoothed_lux, 42.0);
        assert!(!r.rapid_change);
    }

    #[test]
    fn test_ema() {
        let sc = SignalConditioner::new(SignalConfig::default());
        let mut st = SignalState::default();
        sc.update(&mut st, 100.0, t(0));
        let r = sc.update(&mut st, 200.0, t(30));
        assert_relative_eq!(r.smoothed_lux, 0.3 * 200.0 + 0.7 * 100.0);
        assert!(!r.rapid_change);
    }

    #[test]
    fn test_rapid_change_both_directions() {
        let sc = SignalConditioner::new(SignalConfig::default());
        assert!(sc.is_rapid_change(10.0, 31.0));
        assert!(sc.is_rapid_change(31.0, 10.0));
        assert!(!sc.is_rapid_change(10.0, 29.0));
        assert!(!sc.is_rapid_change(0.0, 29.0));

        let mut st = SignalState::default();
        sc.update(&mut st, 1000.0, t(0));
        let r = sc.update(&mut st, 5.0, t(30));
        assert!(r.rapid_change);
        assert!(st.rapid_change);
    }

    #[test]
    fn test_history_is_bounded() {
        let cfg = SignalConfig {
            trend_history_len: 4,
            ..Default::default()
        };
        let sc = SignalConditioner::new(cfg);
        let mut st = SignalState::default();
        for i in 0..10 {
            sc.update(&mut st, 1.0 + i as f64, t(i * 30));
        }
        assert_eq!(st.history.len(), 4);
        assert_eq!(st.history.front().unwrap().raw_lux, 7.0);
    }

    #[test]
    fn test_trend_follows_exponential_decay() {
        let sc = SignalConditioner::new(SignalConfig::default());
        let mut st = SignalState::default();
        assert!(sc.trend_lux(&st, t(0), chrono::Duration::seconds(60)).is_none());

        // lux halves every 60 seconds, as at dusk
        for i in 0..6 {
            let lux = 1000.0 * 0.5f64.powi(i);
            sc.update(&mut st, lux, t(i as i64 * 60));
        }
        let predicted = sc
            .trend_lux(&st, t(300), chrono::Duration::seconds(60))
            .unwrap();
        assert_relative_eq!(predicted, 1000.0 * 0.5f64.powi(6), max_relative = 1e-9);
    }
}
