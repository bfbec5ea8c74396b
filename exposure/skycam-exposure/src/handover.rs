//! Automatic to manual handover: seeding the manual settings from the last
//! automatic frame and the one-shot EV safety clamp.

use serde::Serialize;
use skycam_exposure_config::{HandoverConfig, TargetConfig};
use skycam_types::{ColourGains, FrameMetadata, LightMode};

/// Where the seed exposure and gain came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeedSource {
    /// The actual settings of the previous real capture.
    PreviousCapture,
    /// No previous capture was available, e.g. after a restart at night.
    Formula,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Seed {
    pub exposure_s: f64,
    pub gain: f64,
    pub wb: ColourGains,
    pub source: SeedSource,
    /// The episode began by leaving day mode, not after a restart.
    pub after_day: bool,
}

impl Seed {
    pub fn ev(&self) -> f64 {
        self.exposure_s * self.gain
    }

    /// Seeded from the last automatic frame of a day episode. Only such a
    /// seed is a valid start for the sequential ramp, and only its white
    /// balance is a genuine day reference.
    pub fn is_day_handover(&self) -> bool {
        self.after_day && self.source == SeedSource::PreviousCapture
    }
}

/// Handover part of the controller state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandoverState {
    /// Set for the rest of the manual episode once seeded.
    pub seed: Option<Seed>,
    /// The next manual frame is checked against the seed EV.
    pub ev_clamp_pending: bool,
    pub ev_clamp_applied: bool,
}

impl HandoverState {
    pub fn is_seeded(&self) -> bool {
        self.seed.is_some()
    }
}

/// Everything the seed may be taken from.
#[derive(Debug, Clone, Copy)]
pub struct SeedInputs<'a> {
    pub previous_capture: Option<&'a FrameMetadata>,
    /// The mode before this cycle was day.
    pub after_day: bool,
    /// Colour gains reported with this cycle's test shot.
    pub test_shot_wb: Option<ColourGains>,
    pub day_reference: Option<ColourGains>,
    pub default_wb: ColourGains,
    /// Formula exposure and gain for the current lux.
    pub formula_exposure_s: f64,
    pub formula_gain: f64,
}

/// Result of the EV clamp check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvClamp {
    pub proposed_exposure_s: f64,
    pub exposure_s: f64,
    pub seed_ev: f64,
}

#[derive(Debug, Clone)]
pub struct HandoverSeeder {
    cfg: HandoverConfig,
    min_exposure_s: f64,
    max_exposure_s: f64,
    min_gain: f64,
    max_gain: f64,
}

impl HandoverSeeder {
    pub fn new(cfg: HandoverConfig, target: &TargetConfig) -> Self {
        Self {
            cfg,
            min_exposure_s: target.min_day_exposure_s,
            max_exposure_s: target.max_night_exposure_s,
            min_gain: target.min_gain,
            max_gain: target.max_gain,
        }
    }

    /// A seed is needed on any manual cycle without one. Seeds are dropped
    /// in day mode, so this is the first manual cycle after day mode or
    /// after a restart.
    pub fn needs_seed(&self, st: &HandoverState, mode: LightMode) -> bool {
        mode.is_manual() && st.seed.is_none()
    }

    /// Take and store the seed, arming the EV clamp.
    pub fn take_seed(&self, st: &mut HandoverState, inputs: &SeedInputs) -> Seed {
        let from_capture = inputs
            .previous_capture
            .filter(|m| m.exposure_time_us > 0 && m.analogue_gain.is_finite() && m.analogue_gain > 0.0);
        let (exposure_s, gain, source) = match from_capture {
            Some(m) => (m.exposure_s(), m.analogue_gain, SeedSource::PreviousCapture),
            None => (
                inputs.formula_exposure_s,
                inputs.formula_gain,
                SeedSource::Formula,
            ),
        };
        let wb = inputs
            .test_shot_wb
            .filter(ColourGains::is_valid)
            .or_else(|| {
                inputs
                    .previous_capture
                    .map(|m| m.colour_gains)
                    .filter(ColourGains::is_valid)
            })
            .or(inputs.day_reference)
            .unwrap_or(inputs.default_wb);

        let seed = Seed {
            exposure_s: exposure_s.clamp(self.min_exposure_s, self.max_exposure_s),
            gain: gain.clamp(self.min_gain, self.max_gain),
            wb,
            source,
            after_day: inputs.after_day,
        };
        tracing::info!(
            "handover seeded from {:?}: exposure {:.6} s, gain {:.2}, wb ({:.3}, {:.3})",
            source,
            seed.exposure_s,
            seed.gain,
            wb.red,
            wb.blue
        );
        st.seed = Some(seed);
        st.ev_clamp_pending = true;
        st.ev_clamp_applied = false;
        seed
    }

    /// Forget the seed so the next episode takes a fresh one.
    pub fn reset(&self, st: &mut HandoverState) {
        if st.seed.is_some() {
            tracing::debug!("handover seed reset");
        }
        *st = HandoverState::default();
    }

    /// On the first manual frame after seeding, keep the proposed gain but
    /// pull the exposure back to the seed EV if the proposal is off by more
    /// than the tolerance. Checked once per episode, whatever the outcome.
    pub fn check_ev_clamp(
        &self,
        st: &mut HandoverState,
        proposed_exposure_s: f64,
        proposed_gain: f64,
    ) -> Option<EvClamp> {
        if !st.ev_clamp_pending {
            return None;
        }
        st.ev_clamp_pending = false;
        if !self.cfg.ev_clamp_enabled || st.ev_clamp_applied {
            return None;
        }
        let seed = st.seed?;
        let seed_ev = seed.ev();
        let proposed_ev = proposed_exposure_s * proposed_gain;
        if !(seed_ev > 0.0 && proposed_ev > 0.0) {
            return None;
        }
        let deviation = (proposed_ev / seed_ev - 1.0).abs();
        if deviation <= self.cfg.ev_clamp_tolerance {
            return None;
        }
        let exposure_s = (seed_ev / proposed_gain).clamp(self.min_exposure_s, self.max_exposure_s);
        st.ev_clamp_applied = true;
        tracing::info!(
            "EV clamp: proposed EV {proposed_ev:.4} is {:.1}% off seed EV {seed_ev:.4}, \
            exposure {proposed_exposure_s:.6} s -> {exposure_s:.6} s",
            deviation * 100.0
        );
        Some(EvClamp {
            proposed_exposure_s,
            exposure_s,
            seed_ev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn seeder() -> HandoverSeeder {
        HandoverSeeder::new(HandoverConfig::default(), &TargetConfig::default())
    }

    fn metadata(exposure_time_us: u64, gain: f64) -> FrameMetadata {
        FrameMetadata {
            exposure_time_us,
            analogue_gain: gain,
            colour_gains: ColourGains::new(2.1, 1.4),
            sensor_temperature: Some(41.0),
            lux: None,
        }
    }

    fn inputs(previous: Option<&FrameMetadata>) -> SeedInputs<'_> {
        SeedInputs {
            previous_capture: previous,
            after_day: true,
            test_shot_wb: None,
            day_reference: None,
            default_wb: ColourGains::new(2.0, 1.5),
            formula_exposure_s: 4.0,
            formula_gain: 2.0,
        }
    }

    #[test]
    fn test_seed_from_previous_capture() {
        let s = seeder();
        let mut st = HandoverState::default();
        assert!(s.needs_seed(&st, LightMode::Transition));
        assert!(!s.needs_seed(&st, LightMode::Day));

        let prev = metadata(20_000, 6.0);
        let mut inp = inputs(Some(&prev));
        inp.test_shot_wb = Some(ColourGains::new(2.3, 1.2));
        let seed = s.take_seed(&mut st, &inp);
        assert_eq!(seed.source, SeedSource::PreviousCapture);
        assert_relative_eq!(seed.exposure_s, 0.02, max_relative = 1e-12);
        assert_eq!(seed.gain, 6.0);
        assert_eq!(seed.wb, ColourGains::new(2.3, 1.2));
        assert!(st.ev_clamp_pending);
        assert!(seed.is_day_handover());
        assert!(!s.needs_seed(&st, LightMode::Night));
    }

    #[test]
    fn test_seed_falls_back_to_formula() {
        let s = seeder();
        let mut st = HandoverState::default();
        let seed = s.take_seed(&mut st, &inputs(None));
        assert_eq!(seed.source, SeedSource::Formula);
        assert_eq!(seed.exposure_s, 4.0);
        assert_eq!(seed.gain, 2.0);
        assert_eq!(seed.wb, ColourGains::new(2.0, 1.5));
        assert!(!seed.is_day_handover());

        // a capture without usable settings is no better than none
        let mut st = HandoverState::default();
        let bogus = metadata(0, 6.0);
        let seed = s.take_seed(&mut st, &inputs(Some(&bogus)));
        assert_eq!(seed.source, SeedSource::Formula);
        assert_eq!(seed.wb, ColourGains::new(2.1, 1.4));
    }

    #[test]
    fn test_restart_at_night_is_not_a_day_handover() {
        let s = seeder();
        let mut st = HandoverState::default();
        let prev = metadata(20_000_000, 8.0);
        let mut inp = inputs(Some(&prev));
        inp.after_day = false;
        let seed = s.take_seed(&mut st, &inp);
        assert_eq!(seed.source, SeedSource::PreviousCapture);
        assert!(!seed.is_day_handover());
    }

    #[test]
    fn test_ev_clamp_fires_once() {
        let s = seeder();
        let mut st = HandoverState::default();
        let prev = metadata(20_000, 6.0);
        s.take_seed(&mut st, &inputs(Some(&prev)));

        let clamp = s.check_ev_clamp(&mut st, 1.0, 6.0).unwrap();
        assert_relative_eq!(clamp.exposure_s * 6.0, 0.12, max_relative = 1e-12);
        assert!(st.ev_clamp_applied);

        // the next frame is not clamped, whatever its EV
        assert!(s.check_ev_clamp(&mut st, 2.0, 6.0).is_none());
        assert!(s.check_ev_clamp(&mut st, 0.001, 1.0).is_none());
    }

    #[test]
    fn test_ev_within_tolerance_is_not_clamped() {
        let s = seeder();
        let mut st = HandoverState::default();
        let prev = metadata(20_000, 6.0);
        s.take_seed(&mut st, &inputs(Some(&prev)));
        assert!(s.check_ev_clamp(&mut st, 0.0205, 6.0).is_none());
        assert!(!st.ev_clamp_pending);
        // only the first manual frame is ever checked
        assert!(s.check_ev_clamp(&mut st, 1.0, 6.0).is_none());
    }

    #[test]
    fn test_disabled_clamp() {
        let cfg = HandoverConfig {
            ev_clamp_enabled: false,
            ..Default::default()
        };
        let s = HandoverSeeder::new(cfg, &TargetConfig::default());
        let mut st = HandoverState::default();
        let prev = metadata(20_000, 6.0);
        s.take_seed(&mut st, &inputs(Some(&prev)));
        assert!(s.check_ev_clamp(&mut st, 1.0, 6.0).is_none());
    }

    #[test]
    fn test_reset_starts_new_episode() {
        let s = seeder();
        let mut st = HandoverState::default();
        let prev = metadata(20_000, 6.0);
        s.take_seed(&mut st, &inputs(Some(&prev)));
        s.check_ev_clamp(&mut st, 1.0, 6.0);
        s.reset(&mut st);
        assert_eq!(st, HandoverState::default());
        s.take_seed(&mut st, &inputs(Some(&prev)));
        assert!(s.check_ev_clamp(&mut st, 1.0, 6.0).is_some());
    }
}
