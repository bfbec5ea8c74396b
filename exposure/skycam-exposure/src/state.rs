use serde::Serialize;
use skycam_types::{ColourGains, ControlValues, FrameMetadata, LightMode};

use crate::{
    feedback::FeedbackState, handover::HandoverState, mode::ModeState, signal::SignalState,
    smoother::SmootherState,
};

/// All mutable state of one camera's exposure controller.
///
/// Owned by exactly one [crate::ExposureEngine] and mutated once per cycle
/// (plus once per observed frame).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerState {
    /// Number of completed cycles.
    pub cycle: u64,
    pub signal: SignalState,
    pub mode: ModeState,
    pub feedback: FeedbackState,
    pub smoother: SmootherState,
    pub handover: HandoverState,
    pub last_emitted: Option<ControlValues>,
    /// Mean brightness of the last real frame.
    pub last_brightness: Option<f64>,
    /// Metadata of the last real frame.
    pub last_capture: Option<FrameMetadata>,
    /// White balance learned from genuine auto white balance results.
    pub day_reference_wb: Option<ColourGains>,
}

impl ControllerState {
    pub fn smoothed_lux(&self) -> Option<f64> {
        self.signal.smoothed_lux
    }

    pub fn light_mode(&self) -> Option<LightMode> {
        self.mode.mode
    }
}
