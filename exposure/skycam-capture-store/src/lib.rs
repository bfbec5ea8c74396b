//! Append-only storage of [CaptureRecord]s.
//!
//! Every real capture is appended once. The historical exposure predictor
//! reads records back in bulk, selecting only frames that were well exposed
//! (or aurora frames, which are deliberately dark with a bright tail).

use std::collections::VecDeque;

use skycam_types::CaptureRecord;

mod jsonl;

pub use jsonl::JsonLinesStore;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Dark frames with a bright tail at very low lux: aurora or a bright moon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuroraHeuristic {
    pub max_lux: f64,
    pub max_mean: f64,
    pub min_p95: f64,
}

impl AuroraHeuristic {
    pub fn matches(&self, record: &CaptureRecord) -> bool {
        record.lux < self.max_lux
            && record.brightness.mean < self.max_mean
            && record.brightness.p95 > self.min_p95
    }
}

/// Selects records eligible for predictor training.
///
/// A record passes when its mean brightness lies in the inclusive band, or
/// when it matches the aurora heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingFilter {
    pub brightness_min: f64,
    pub brightness_max: f64,
    pub aurora: Option<AuroraHeuristic>,
}

impl TrainingFilter {
    pub fn matches(&self, record: &CaptureRecord) -> bool {
        let mean = record.brightness.mean;
        if mean >= self.brightness_min && mean <= self.brightness_max {
            return true;
        }
        self.aurora.is_some_and(|a| a.matches(record))
    }
}

/// Keeps the last `limit` items pushed.
pub(crate) struct NewestN<T> {
    limit: usize,
    items: VecDeque<T>,
}

impl<T> NewestN<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            items: VecDeque::new(),
        }
    }
    pub(crate) fn push(&mut self, item: T) {
        if self.limit == 0 {
            return;
        }
        if self.items.len() == self.limit {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
    pub(crate) fn into_vec(self) -> Vec<T> {
        self.items.into()
    }
}

pub trait CaptureStore {
    /// Append one record.
    fn append(&mut self, record: &CaptureRecord) -> Result<()>;

    /// Return at most `limit` matching records, the most recently appended
    /// ones, oldest first.
    fn query(&self, filter: &TrainingFilter, limit: usize) -> Result<Vec<CaptureRecord>>;
}

impl<T: CaptureStore + ?Sized> CaptureStore for Box<T> {
    fn append(&mut self, record: &CaptureRecord) -> Result<()> {
        (**self).append(record)
    }
    fn query(&self, filter: &TrainingFilter, limit: usize) -> Result<Vec<CaptureRecord>> {
        (**self).query(filter, limit)
    }
}

/// A store which keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<CaptureRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }
}

impl FromIterator<CaptureRecord> for MemoryStore {
    fn from_iter<I: IntoIterator<Item = CaptureRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl CaptureStore for MemoryStore {
    fn append(&mut self, record: &CaptureRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn query(&self, filter: &TrainingFilter, limit: usize) -> Result<Vec<CaptureRecord>> {
        let mut newest = NewestN::new(limit);
        for record in self.records.iter().filter(|r| filter.matches(r)) {
            newest.push(record.clone());
        }
        Ok(newest.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skycam_types::BrightnessStats;

    fn record(lux: f64, mean: f64, p95: f64) -> CaptureRecord {
        let mut brightness = BrightnessStats::uniform(mean);
        brightness.p95 = p95;
        CaptureRecord {
            timestamp: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            lux,
            exposure_us: 1_000_000,
            gain: 4.0,
            brightness,
            sun_elevation_deg: None,
            mode: None,
        }
    }

    fn filter() -> TrainingFilter {
        TrainingFilter {
            brightness_min: 80.0,
            brightness_max: 160.0,
            aurora: Some(AuroraHeuristic {
                max_lux: 0.5,
                max_mean: 60.0,
                min_p95: 100.0,
            }),
        }
    }

    #[test]
    fn test_filter_band_is_inclusive() {
        let f = filter();
        assert!(f.matches(&record(10.0, 80.0, 80.0)));
        assert!(f.matches(&record(10.0, 160.0, 160.0)));
        assert!(!f.matches(&record(10.0, 79.9, 79.9)));
        assert!(!f.matches(&record(10.0, 200.0, 255.0)));
    }

    #[test]
    fn test_filter_aurora() {
        let f = filter();
        // dark, bright tail, very low lux
        assert!(f.matches(&record(0.05, 30.0, 180.0)));
        // same frame at higher lux is just underexposed
        assert!(!f.matches(&record(5.0, 30.0, 180.0)));
        // no bright tail
        assert!(!f.matches(&record(0.05, 30.0, 40.0)));

        let no_aurora = TrainingFilter {
            aurora: None,
            ..filter()
        };
        assert!(!no_aurora.matches(&record(0.05, 30.0, 180.0)));
    }

    #[test]
    fn test_memory_store_limit_keeps_newest() {
        let mut store = MemoryStore::new();
        for i in 0..10 {
            store.append(&record(i as f64 + 1.0, 120.0, 150.0)).unwrap();
        }
        store.append(&record(99.0, 250.0, 255.0)).unwrap();
        assert_eq!(store.len(), 11);

        let got = store.query(&filter(), 3).unwrap();
        let luxes: Vec<f64> = got.iter().map(|r| r.lux).collect();
        assert_eq!(luxes, vec![8.0, 9.0, 10.0]);

        assert!(store.query(&filter(), 0).unwrap().is_empty());
    }
}
