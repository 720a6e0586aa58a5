use screening_harness::screening::{AttemptTrace, JsonlTraceSink, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    document_id: i64,
    attempt: u32,
    decision: f64,
    accepted: bool,
}

fn make_trace(document_id: i64, attempt: u32, decision: f64) -> AttemptTrace {
    AttemptTrace {
        timestamp_ms: 0,
        run_id: None,
        repetition: 0,
        document_id,
        attempt,
        model: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
        temperature: 0.0,
        template_slug: "zero_shot".to_string(),
        template_hash: "template_hash".to_string(),
        decision,
        valid: decision >= 0.0,
        accepted: decision >= 0.0,
        input_tokens: 0,
        output_tokens: 0,
        latency_ms: 0,
        error: None,
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(7, 0, -1.0)).unwrap();
    sink.record(make_trace(7, 1, 2.0)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].document_id, 7);
    assert!(!rows[0].accepted);
    assert_eq!((rows[1].attempt, rows[1].decision), (1, 2.0));
    assert!(rows[1].accepted);
}

#[test]
fn cloned_sinks_share_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let other = sink.clone();
    let handle = std::thread::spawn(move || other.record(make_trace(1, 0, 1.0)).unwrap());
    sink.record(make_trace(2, 0, 1.0)).unwrap();
    handle.join().unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 2);
}
