//! Console and file logging for the sky camera binaries.
//!
//! The filter comes from `RUST_LOG`. Without it, the skycam crates log at
//! `info` and everything else at `warn`.

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "skycam_exposure=info,skycam_exposure_sim=info,\
    skycam_exposure_config=info,skycam_capture_store=info,skycam_ci=info,warn";

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Start logging to file and console, both optional.
///
/// Keep the returned guard alive for as long as logging is wanted.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
    disable_console: bool,
) -> Result<impl Drop, Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Timestamps use the local offset at startup. A camera running through a
    // daylight saving change keeps the old offset until restarted.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(path)?;
        Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(
            fmt::layer()
                .with_timer(timer)
                .with_ansi(!cfg!(windows))
                .with_target(false),
        )
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter());
    tracing::subscriber::set_global_default(collector)?;

    let filter_src = match std::env::var("RUST_LOG") {
        Ok(var) => format!("RUST_LOG=\"{var}\""),
        Err(_) => format!("default filter \"{DEFAULT_FILTER}\""),
    };
    if let Some(path) = &path {
        tracing::debug!(
            "Logging initiated to file \"{}\" with {filter_src}.",
            path.as_ref().display(),
        );
    }
    if !disable_console {
        tracing::debug!("Logging initiated to console with {filter_src}.");
    }

    Ok(Guard {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn logs_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skycam.log");
        let guard = initiate_logging(Some(&path), true).unwrap();
        tracing::warn!("a warning for the file");
        drop(guard);
        let buf = std::fs::read_to_string(&path).unwrap();
        assert!(buf.contains("a warning for the file"));
    }
}
