use hvacd::datalog::*;
use hvacd::payload::{Reading, TelemetryPayload};
use std::fs;
use std::path::PathBuf;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hvacd-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn record(point_id: &str, value: f64, version: u64) -> Record {
    Record {
        timestamp_ms: 1_000,
        point_id: point_id.to_string(),
        value,
        version,
    }
}

fn lines(path: &PathBuf) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_file_starts_with_header_row() {
    let dir = scratch_dir("header");
    let mut sink = FileSink::new(&dir, "hvac", 1 << 20).unwrap();
    let path = sink.current_path();
    assert_eq!(path, dir.join("hvac.00000.csv"));

    sink.append(&record("space_temp", 21.5, 3)).unwrap();
    sink.flush().unwrap();

    assert_eq!(lines(&path), [CSV_HEADER, "1000,space_temp,21.5,3"]);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_rotation_starts_new_file_with_header() {
    let dir = scratch_dir("rotate");
    // Header (36 bytes) plus one 23-byte line stays under 60, a second line crosses it
    let mut sink = FileSink::new(&dir, "hvac", 60).unwrap();

    sink.append(&record("space_temp", 21.5, 1)).unwrap();
    sink.append(&record("space_temp", 21.6, 2)).unwrap();
    sink.append(&record("space_temp", 21.7, 3)).unwrap();
    sink.flush().unwrap();

    let first = lines(&dir.join("hvac.00000.csv"));
    let second = lines(&dir.join("hvac.00001.csv"));
    assert_eq!(first.len(), 3);
    assert_eq!(second, [CSV_HEADER, "1000,space_temp,21.7,3"]);
    assert_eq!(sink.current_path(), dir.join("hvac.00001.csv"));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_new_sink_continues_after_existing_files() {
    let dir = scratch_dir("resume");
    {
        let mut sink = FileSink::new(&dir, "hvac", 1 << 20).unwrap();
        sink.append(&record("heater", 1.0, 1)).unwrap();
    }
    fs::write(dir.join("other.00007.csv"), "unrelated").unwrap();

    let sink = FileSink::new(&dir, "hvac", 1 << 20).unwrap();
    assert_eq!(sink.current_path(), dir.join("hvac.00001.csv"));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_unwritable_point_id_rejected() {
    let dir = scratch_dir("reject");
    let mut sink = FileSink::new(&dir, "hvac", 1 << 20).unwrap();
    assert!(matches!(
        sink.append(&record("a,b", 1.0, 1)),
        Err(SinkError::Rejected(_))
    ));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_records_from_telemetry() {
    let payload = TelemetryPayload {
        timestamp_ms: 42,
        readings: vec![
            Reading {
                point_id: "space_temp".into(),
                value: 20.0,
                version: Some(7),
            },
            Reading::new("space_rh", 40.0),
        ],
    };
    let records = Record::from_telemetry(&payload);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].timestamp_ms, 42);
    assert_eq!(records[0].version, 7);
    assert_eq!(records[1].version, 0);
}
