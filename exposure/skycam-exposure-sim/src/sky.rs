//! A toy sky and a toy camera looking at it.

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};

use skycam_ci::{CameraControl, Result};
use skycam_types::{ColourGains, ControlValues, FrameMetadata, Mono8Image, seconds_to_us};

use crate::sun::SolarPosition;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

/// `(elevation_deg, log10(lux))` for the clear sky below the horizon.
const TWILIGHT_CURVE: [(f64, f64); 4] = [(-18.0, -3.3), (-12.0, -2.0), (-6.0, 0.5), (0.0, 2.6)];

/// Clear sky illuminance for a solar elevation.
pub fn clear_sky_lux(elevation_deg: f64) -> f64 {
    if elevation_deg >= 0.0 {
        let s = elevation_deg.to_radians().sin();
        return 10f64.powf(TWILIGHT_CURVE[3].1) + 110_000.0 * s.powf(1.2);
    }
    let (first_elev, first_log) = TWILIGHT_CURVE[0];
    if elevation_deg <= first_elev {
        return 10f64.powf(first_log);
    }
    for pair in TWILIGHT_CURVE.windows(2) {
        let (e0, l0) = pair[0];
        let (e1, l1) = pair[1];
        if elevation_deg <= e1 {
            let t = (elevation_deg - e0) / (e1 - e0);
            return 10f64.powf(l0 + t * (l1 - l0));
        }
    }
    10f64.powf(TWILIGHT_CURVE[3].1)
}

/// Slowly varying cloud and aurora terms, as a multiplicative factor.
#[derive(Debug)]
struct Weather {
    /// Random walk in `ln` space, pulled back towards clear.
    ln_cloud: f64,
    aurora_left: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SkyOptions {
    /// Enable the cloud and aurora terms.
    pub weather: bool,
    /// Bound on the relative error of the exposure the camera actually uses.
    pub actuation_error: f64,
}

/// A mono8 sky camera with a simple auto exposure, for driving the engine
/// without hardware.
pub struct SimulatedCamera {
    sun: SolarPosition,
    opts: SkyOptions,
    rng: StdRng,
    lux: f64,
    weather: Weather,
    applied: Option<ControlValues>,
}

impl SimulatedCamera {
    pub fn new(sun: SolarPosition, opts: SkyOptions, seed: u64, now: DateTime<Utc>) -> Self {
        let mut cam = Self {
            sun,
            opts,
            rng: StdRng::seed_from_u64(seed),
            lux: 0.0,
            weather: Weather {
                ln_cloud: 0.0,
                aurora_left: 0,
            },
            applied: None,
        };
        cam.set_time(now);
        cam
    }

    /// Advance the sky to `now`.
    pub fn set_time(&mut self, now: DateTime<Utc>) {
        let elevation = self.sun.elevation(now);
        let mut lux = clear_sky_lux(elevation);
        if self.opts.weather {
            let w = &mut self.weather;
            w.ln_cloud = 0.9 * w.ln_cloud + self.rng.random_range(-0.25..0.25);
            // clouds only darken
            lux *= w.ln_cloud.min(0.0).exp();

            if w.aurora_left > 0 {
                w.aurora_left -= 1;
            } else if elevation < -12.0 && self.rng.random_bool(0.01) {
                w.aurora_left = self.rng.random_range(5..40);
                tracing::debug!("simulated aurora for {} frames", w.aurora_left);
            }
            if w.aurora_left > 0 {
                lux += 0.02;
            }
        }
        self.lux = lux;
    }

    pub fn lux(&self) -> f64 {
        self.lux
    }

    fn actuate(&mut self, requested: f64) -> f64 {
        let err = self.opts.actuation_error;
        if err > 0.0 {
            requested * (1.0 + self.rng.random_range(-err..err))
        } else {
            requested
        }
    }

    /// Render a frame: a vertical gradient around the mean level, saturating
    /// at both ends.
    fn render(&mut self, exposure_s: f64, gain: f64, colour_gains: ColourGains) -> (Mono8Image, FrameMetadata) {
        let exposure_s = self.actuate(exposure_s);
        let level = self.lux * 128.0 * exposure_s * gain;
        let mut data = Vec::with_capacity((WIDTH * HEIGHT) as usize);
        for row in 0..HEIGHT {
            // brighter towards the horizon
            let shade = 0.8 + 0.4 * row as f64 / (HEIGHT - 1) as f64;
            let v = (level * shade).round().clamp(0.0, 255.0) as u8;
            data.extend(std::iter::repeat_n(v, WIDTH as usize));
        }
        let reported_lux = self.lux * (1.0 + self.rng.random_range(-0.1..0.1));
        let metadata = FrameMetadata {
            exposure_time_us: seconds_to_us(exposure_s),
            analogue_gain: gain,
            colour_gains,
            sensor_temperature: Some(25.0 + self.rng.random_range(-0.5..0.5)),
            lux: Some(reported_lux),
        };
        let image = Mono8Image {
            width: WIDTH,
            height: HEIGHT,
            data,
        };
        (image, metadata)
    }

    /// What the camera's own auto exposure and white balance pick.
    fn auto_settings(&self) -> (f64, f64, ColourGains) {
        let mut exposure_s = 110.0 / (128.0 * self.lux.max(1e-6));
        let mut gain = 1.0;
        if exposure_s > 0.25 {
            gain = (exposure_s / 0.25).min(8.0);
            exposure_s = 0.25;
        }
        (exposure_s.max(1e-5), gain, ColourGains::new(2.05, 1.55))
    }
}

impl CameraControl for SimulatedCamera {
    fn apply_settings(&mut self, values: &ControlValues) -> Result<FrameMetadata> {
        self.applied = Some(values.clone());
        Ok(FrameMetadata {
            exposure_time_us: values.exposure_time_us,
            analogue_gain: values.analogue_gain,
            colour_gains: values.colour_gains,
            sensor_temperature: None,
            lux: None,
        })
    }

    fn capture_test_shot(
        &mut self,
        exposure_time_us: u64,
        gain: f64,
    ) -> Result<(Mono8Image, FrameMetadata)> {
        let wb = self
            .applied
            .as_ref()
            .map(|v| v.colour_gains)
            .unwrap_or(ColourGains::new(2.0, 1.5));
        Ok(self.render(exposure_time_us as f64 * 1e-6, gain, wb))
    }

    fn capture_frame(&mut self) -> Result<(Mono8Image, FrameMetadata)> {
        let values = self.applied.clone().ok_or("capture before settings were applied")?;
        let (exposure_s, gain, wb) = if values.ae_enabled {
            self.auto_settings()
        } else {
            (values.exposure_s(), values.analogue_gain, values.colour_gains)
        };
        Ok(self.render(exposure_s, gain, wb))
    }
}
