//! Wire-type smoke tests for the generated protobuf code.

use ctg_proto::analysis::v1::{DataPoint, ProcessBatchRequest};
use ctg_proto::telemetry::v1::{Metric, Sample};

#[test]
fn sample_constructors_set_metric() {
    let fhr = Sample::fhr("s1", 1000, 132.0);
    assert_eq!(fhr.metric_kind(), Metric::Fhr);
    assert_eq!(fhr.ts_ms, 1000);

    let uc = Sample::uc("s1", 1250, 41.5);
    assert_eq!(uc.metric_kind(), Metric::Uc);
}

#[test]
fn unknown_metric_decodes_to_unspecified() {
    let sample = Sample {
        session_id: "s1".to_string(),
        ts_ms: 1,
        metric: 42,
        value: 0.0,
    };
    assert_eq!(sample.metric_kind(), Metric::Unspecified);
}

#[test]
fn metric_labels_are_lowercase() {
    assert_eq!(Metric::Fhr.label(), "fhr");
    assert_eq!(Metric::Uc.label(), "uc");
}

#[test]
fn analysis_request_serializes_to_json() {
    let request = ProcessBatchRequest {
        session_id: "s1".to_string(),
        batch_ts_ms: 1000,
        bpm_data: vec![DataPoint::new(1.0, 120.0)],
        uterus_data: vec![],
    };

    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"session_id\":\"s1\""));
    assert!(json.contains("\"time_sec\":1.0"));
}
