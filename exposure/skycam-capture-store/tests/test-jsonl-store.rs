use skycam_capture_store::{CaptureStore, JsonLinesStore, TrainingFilter};
use skycam_types::{BrightnessStats, CaptureRecord, LightMode};

fn record(secs: i64, lux: f64, mean: f64) -> CaptureRecord {
    CaptureRecord {
        timestamp: chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        lux,
        exposure_us: 250_000,
        gain: 2.0,
        brightness: BrightnessStats::uniform(mean),
        sun_elevation_deg: Some(-3.0),
        mode: Some(LightMode::Transition),
    }
}

const ALL_GOOD: TrainingFilter = TrainingFilter {
    brightness_min: 80.0,
    brightness_max: 160.0,
    aurora: None,
};

#[test]
fn missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesStore::new(dir.path().join("nope.jsonl"));
    assert!(store.query(&ALL_GOOD, 100).unwrap().is_empty());
}

#[test]
fn append_then_query() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonLinesStore::new(dir.path().join("captures.jsonl"));
    store.append(&record(0, 5.0, 120.0)).unwrap();
    store.append(&record(30, 6.0, 240.0)).unwrap();
    store.append(&record(60, 7.0, 100.0)).unwrap();

    let got = store.query(&ALL_GOOD, 100).unwrap();
    assert_eq!(got, vec![record(0, 5.0, 120.0), record(60, 7.0, 100.0)]);

    // a second handle on the same file sees the same data
    let other = JsonLinesStore::new(store.path());
    assert_eq!(other.query(&ALL_GOOD, 1).unwrap(), vec![record(60, 7.0, 100.0)]);
}

#[test]
fn corrupt_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("captures.jsonl");
    let mut store = JsonLinesStore::new(&path);
    store.append(&record(0, 5.0, 120.0)).unwrap();
    {
        use std::io::Write;
        let mut fd = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        fd.write_all(b"{\"timestamp\": \"2023-11\n\n").unwrap();
    }
    store.append(&record(60, 7.0, 110.0)).unwrap();
    {
        use std::io::Write;
        let mut fd = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        fd.write_all(b"{\"timestamp\": \xff\xfe\n").unwrap();
    }
    store.append(&record(90, 8.0, 115.0)).unwrap();

    let got = store.query(&ALL_GOOD, 100).unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[2], record(90, 8.0, 115.0));
}
