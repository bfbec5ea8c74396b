//! Run the exposure engine against a simulated sky camera.

use std::{
    collections::BTreeMap,
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;

use skycam_capture_store::{CaptureStore, JsonLinesStore, MemoryStore};
use skycam_ci::HistogramAnalyzer;
use skycam_exposure::{CaptureLoop, CaptureOutcome, ExposureEngine, RetrainOutcome};
use skycam_exposure_config::{ExposureConfig, default_config_toml, parse_config_file};

mod sky;
mod sun;

use sky::{SimulatedCamera, SkyOptions};
use sun::SolarPosition;

/// Tromsø, where the sky does all the interesting things.
const DEFAULT_SITE: (f64, f64) = (69.65, 18.96);

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// run the sky camera exposure engine against a simulated sky
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Exposure configuration TOML file. Defaults are used if not given.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Print the default configuration in TOML format and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Simulated start time (RFC 3339).
    #[arg(long, value_parser = parse_time, default_value = "2025-09-22T12:00:00Z")]
    start: DateTime<Utc>,

    /// Simulated duration in hours.
    #[arg(long, default_value_t = 48.0)]
    hours: f64,

    /// Seconds between captures.
    #[arg(long, default_value_t = 60)]
    interval: u32,

    /// Site latitude in degrees. Overrides the configuration.
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    latitude: Option<f64>,

    /// Site longitude in degrees. Overrides the configuration.
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    longitude: Option<f64>,

    /// Add clouds and the occasional aurora.
    #[arg(long)]
    weather: bool,

    /// Relative error of the exposure the simulated camera actually uses.
    #[arg(long, default_value_t = 0.01)]
    actuation_error: f64,

    /// Seed for the simulated sky.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Write every cycle's outcome to this file as JSON lines.
    #[arg(long)]
    reports: Option<std::path::PathBuf>,

    /// Also log to this file.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Debug, Default)]
struct Summary {
    cycles: u64,
    held: u64,
    modes: BTreeMap<String, u64>,
    seeds: u64,
    ev_clamps: u64,
    retrains: u64,
    failures: u64,
    min_exposure_s: Option<f64>,
    max_exposure_s: Option<f64>,
    manual_brightness_sum: f64,
    manual_frames: u64,
}

impl Summary {
    fn add(&mut self, outcome: &CaptureOutcome) {
        let report = &outcome.report;
        self.cycles += 1;
        if report.held {
            self.held += 1;
        }
        *self.modes.entry(report.light_mode.to_string()).or_default() += 1;
        if report.seed.is_some() {
            self.seeds += 1;
        }
        if report.ev_clamp.is_some() {
            self.ev_clamps += 1;
        }
        if matches!(outcome.retrain, RetrainOutcome::Trained { .. }) {
            self.retrains += 1;
        }
        if outcome.failure.is_some() {
            self.failures += 1;
        }
        let e = report.exposure_s;
        self.min_exposure_s = Some(self.min_exposure_s.map_or(e, |m| m.min(e)));
        self.max_exposure_s = Some(self.max_exposure_s.map_or(e, |m| m.max(e)));
        if let Some(record) = &outcome.record {
            if report.light_mode.is_manual() {
                self.manual_brightness_sum += record.brightness.mean;
                self.manual_frames += 1;
            }
        }
    }

    fn print(&self) {
        println!("cycles: {} ({} held)", self.cycles, self.held);
        for (mode, n) in self.modes.iter() {
            println!("  {mode}: {n}");
        }
        println!(
            "handover seeds: {}, EV clamps: {}, retrains: {}, capture failures: {}",
            self.seeds, self.ev_clamps, self.retrains, self.failures
        );
        if let (Some(lo), Some(hi)) = (self.min_exposure_s, self.max_exposure_s) {
            println!("exposure range: {lo:.6} s .. {hi:.3} s");
        }
        if self.manual_frames > 0 {
            println!(
                "mean brightness of manual frames: {:.1}",
                self.manual_brightness_sum / self.manual_frames as f64
            );
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = env_tracing_logger::initiate_logging(cli.log_file.as_ref(), false)
        .map_err(|e| anyhow::anyhow!("could not start logging: {e}"))?;
    tracing::debug!("{:?}", cli);

    if cli.print_default_config {
        print!("{}", default_config_toml()?);
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => parse_config_file(path)
            .with_context(|| format!("While parsing configuration file {}", path.display()))?,
        None => ExposureConfig::default(),
    };
    let (latitude, longitude) = match (cli.latitude, cli.longitude) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => cfg.site.location().unwrap_or(DEFAULT_SITE),
    };
    tracing::info!("simulating site at {latitude:.2}, {longitude:.2}");
    let sun = SolarPosition::new(latitude, longitude);

    let store: Box<dyn CaptureStore> = match &cfg.store.path {
        Some(path) => {
            tracing::info!("storing capture records in \"{}\"", path.display());
            Box::new(JsonLinesStore::new(path))
        }
        None => Box::new(MemoryStore::new()),
    };

    let engine = ExposureEngine::new(cfg).context("invalid exposure configuration")?;
    let camera = SimulatedCamera::new(
        sun,
        SkyOptions {
            weather: cli.weather,
            actuation_error: cli.actuation_error,
        },
        cli.seed,
        cli.start,
    );
    let mut capture_loop = CaptureLoop::new(engine, camera, HistogramAnalyzer::new(), sun, store);

    let mut reports = match &cli.reports {
        Some(path) => {
            let fd = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            Some(std::io::BufWriter::new(fd))
        }
        None => None,
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("got Ctrl-C, stopping after this cycle");
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    let interval = chrono::Duration::seconds(cli.interval.into());
    let end = cli.start + chrono::Duration::milliseconds((cli.hours * 3_600_000.0) as i64);
    let mut now = cli.start;
    let mut summary = Summary::default();
    let mut last_hour = None;

    while now < end && !stop.load(Ordering::SeqCst) {
        capture_loop.camera_mut().set_time(now);
        let outcome = capture_loop.run_once(now);

        let hours = (now - cli.start).num_hours();
        if last_hour != Some(hours) {
            last_hour = Some(hours);
            tracing::info!(
                "{now}: {} lux {:.4} (true {:.4}), exposure {:.6} s, gain {:.2}",
                outcome.report.light_mode,
                capture_loop.engine().state().smoothed_lux().unwrap_or(f64::NAN),
                capture_loop.camera().lux(),
                outcome.report.exposure_s,
                outcome.report.values.analogue_gain
            );
        }

        if let Some(wtr) = reports.as_mut() {
            serde_json::to_writer(&mut *wtr, &outcome)?;
            wtr.write_all(b"\n")?;
        }
        summary.add(&outcome);
        now += interval;
    }

    if let Some(mut wtr) = reports {
        wtr.flush()?;
    }
    summary.print();
    Ok(())
}
