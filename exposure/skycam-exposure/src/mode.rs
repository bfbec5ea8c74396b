//! Night/Day/Transition classification with hysteresis.

use serde::Serialize;
use skycam_exposure_config::ModeConfig;
use skycam_types::LightMode;

/// Why the lux based classification was overruled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModeOverride {
    /// Sun above the civil twilight elevation: forced day.
    PolarDay,
    /// Classified night, but the last frame was too bright.
    BrightNight,
    /// Classified day, but the last frame was too dark.
    DarkDay,
}

/// Mode classifier part of the controller state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeState {
    /// The held mode. `None` until the first classification.
    pub mode: Option<LightMode>,
    /// The mode requested by the most recent differing classifications.
    pub pending: Option<LightMode>,
    /// How many consecutive cycles `pending` has been requested.
    pub counter: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModeInputs {
    pub lux: f64,
    pub sun_elevation_deg: Option<f64>,
    /// Mean brightness of the last real frame.
    pub last_brightness: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModeDecision {
    /// The mode in effect for this cycle.
    pub mode: LightMode,
    /// The mode held before this cycle.
    pub previous: Option<LightMode>,
    /// This cycle's instantaneous classification, after overrides.
    pub candidate: LightMode,
    pub override_reason: Option<ModeOverride>,
    pub changed: bool,
    pub pending_count: u32,
}

#[derive(Debug, Clone)]
pub struct ModeClassifier {
    cfg: ModeConfig,
}

impl ModeClassifier {
    pub fn new(cfg: ModeConfig) -> Self {
        Self { cfg }
    }

    /// Classify by lux alone.
    pub fn classify_lux(&self, lux: f64) -> LightMode {
        if lux < self.cfg.night_lux_threshold {
            LightMode::Night
        } else if lux > self.cfg.day_lux_threshold {
            LightMode::Day
        } else {
            LightMode::Transition
        }
    }

    /// The instantaneous mode, with the polar day override applied first and
    /// the brightness override second.
    pub fn candidate(&self, inputs: &ModeInputs) -> (LightMode, Option<ModeOverride>) {
        let mut mode = self.classify_lux(inputs.lux);
        let mut reason = None;

        if let Some(elevation) = inputs.sun_elevation_deg {
            if elevation > self.cfg.polar_day_elevation_deg && mode != LightMode::Day {
                mode = LightMode::Day;
                reason = Some(ModeOverride::PolarDay);
            }
        }

        if let Some(brightness) = inputs.last_brightness {
            match mode {
                LightMode::Night if brightness > self.cfg.brightness_high_warning => {
                    mode = LightMode::Transition;
                    reason = Some(ModeOverride::BrightNight);
                }
                LightMode::Day if brightness < self.cfg.brightness_low_warning => {
                    mode = LightMode::Transition;
                    reason = Some(ModeOverride::DarkDay);
                }
                _ => {}
            }
        }

        (mode, reason)
    }

    /// Classify and apply hysteresis.
    ///
    /// The first classification is accepted immediately. After that, a new
    /// mode takes effect only once it has been requested on
    /// `hysteresis_frames` consecutive cycles.
    pub fn update(&self, st: &mut ModeState, inputs: &ModeInputs) -> ModeDecision {
        let (candidate, override_reason) = self.candidate(inputs);
        let previous = st.mode;

        let changed = match st.mode {
            None => {
                st.mode = Some(candidate);
                st.pending = None;
                st.counter = 0;
                true
            }
            Some(held) if held == candidate => {
                st.pending = None;
                st.counter = 0;
                false
            }
            Some(_) => {
                if st.pending == Some(candidate) {
                    st.counter += 1;
                } else {
                    st.pending = Some(candidate);
                    st.counter = 1;
                }
                if st.counter >= self.cfg.hysteresis_frames {
                    st.mode = Some(candidate);
                    st.pending = None;
                    st.counter = 0;
                    true
                } else {
                    false
                }
            }
        };

        let mode = st.mode.unwrap_or(candidate);
        if changed {
            match previous {
                Some(prev) => tracing::info!("light mode {prev} -> {mode}"),
                None => tracing::info!("initial light mode {mode}"),
            }
            if let Some(reason) = override_reason {
                tracing::info!("mode override in effect: {reason:?}");
            }
        } else if st.counter > 0 {
            tracing::debug!(
                "holding {mode}, {candidate} requested {}/{} cycles",
                st.counter,
                self.cfg.hysteresis_frames
            );
        }

        ModeDecision {
            mode,
            previous,
            candidate,
            override_reason,
            changed,
            pending_count: st.counter,
        }
    }
}
