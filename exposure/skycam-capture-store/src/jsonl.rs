use std::io::{BufRead, Write};

use skycam_types::CaptureRecord;
use tracing::{debug, warn};

use crate::{CaptureStore, NewestN, Result, TrainingFilter};

/// A store backed by a JSON lines file, one [CaptureRecord] per line.
///
/// The file is opened for each operation, so external tools may read it
/// concurrently. Lines which fail to parse (for example a line truncated by
/// a power cut, or one that is not UTF-8) are logged and skipped.
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    path: std::path::PathBuf,
}

impl JsonLinesStore {
    /// Use the file at `path`. It is created on first append.
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl CaptureStore for JsonLinesStore {
    fn append(&mut self, record: &CaptureRecord) -> Result<()> {
        let mut buf = serde_json::to_vec(record)?;
        buf.push(b'\n');
        let mut fd = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        fd.write_all(&buf)?;
        Ok(())
    }

    fn query(&self, filter: &TrainingFilter, limit: usize) -> Result<Vec<CaptureRecord>> {
        let fd = match std::fs::File::open(&self.path) {
            Ok(fd) => fd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("capture store \"{}\" does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let rdr = std::io::BufReader::new(fd);
        let mut newest = NewestN::new(limit);
        let mut n_bad = 0usize;
        // Raw bytes: a non-UTF-8 line is just another unparseable line.
        for (lineno, line) in rdr.split(b'\n').enumerate() {
            let line = line?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<CaptureRecord>(&line) {
                Ok(record) => {
                    if filter.matches(&record) {
                        newest.push(record);
                    }
                }
                Err(e) => {
                    n_bad += 1;
                    debug!("{}:{}: {e}", self.path.display(), lineno + 1);
                }
            }
        }
        if n_bad > 0 {
            warn!(
                "skipped {n_bad} unparseable line(s) in capture store \"{}\"",
                self.path.display()
            );
        }
        Ok(newest.into_vec())
    }
}
