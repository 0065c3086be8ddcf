//! File-backed sinks write one parseable JSON object per line.

use chrono::{TimeZone, Utc};
use medialib_events::{AuditEvent, AuditRecord, AuditSink, ErrorRecord, ErrorSink, JsonlAuditSink};
use serde_json::{json, Value};

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn audit_sink_appends_across_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("audit.jsonl");
    let ts = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();

    {
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(
            &AuditRecord::new(AuditEvent::Enqueue, 1, "caption", ts)
                .with_entity(Some("media:7".into()))
                .with_payload(&json!({"media_id": 7, "image": "data:image/png;base64,AAAA"})),
        )
        .unwrap();
    }
    let sink = JsonlAuditSink::open(&path).unwrap();
    sink.record(
        &AuditRecord::new(AuditEvent::Error, 1, "caption", ts)
            .with_attempt(3)
            .with_error("dependency_error", "vision model timed out"),
    )
    .unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["entity"], "media:7");
    assert_eq!(lines[0]["payload_preview"]["image"], "[binary 26 bytes]");
    assert_eq!(lines[1]["event"], "error");
    assert_eq!(lines[1]["attempt"], 3);

    let parsed: AuditRecord = serde_json::from_value(lines[1].clone()).unwrap();
    assert_eq!(parsed.error_code.as_deref(), Some("dependency_error"));
}

#[test]
fn error_sink_records_engine_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("errors.jsonl");
    let ts = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();

    let sink = ErrorSink::open(&path).unwrap();
    sink.record(
        &ErrorRecord::new("store", "database is locked", "host-a", ts).with_worker_type("caption"),
    )
    .unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["component"], "store");
    assert_eq!(lines[0]["worker_type"], "caption");
    assert_eq!(lines[0]["pid"], std::process::id());
}
