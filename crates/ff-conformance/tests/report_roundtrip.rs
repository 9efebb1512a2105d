use ff_conformance::{ConformanceReport, REPORT_SCHEMA_VERSION, run_conformance};

#[test]
fn report_survives_a_trip_through_disk() {
    let report = run_conformance(1e-9);
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("reports").join("conformance.json");
    report.write_json(&path).expect("report should be written");

    let back = ConformanceReport::read_json(&path).expect("report should be read");
    assert_eq!(back, report);
}

#[test]
fn report_json_carries_the_schema_fields() {
    let report = run_conformance(1e-9);
    let json = report.to_json().expect("report should serialize");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
    assert_eq!(parsed["schema_version"], REPORT_SCHEMA_VERSION);
    assert_eq!(parsed["total_cases"], report.total_cases);
    assert!(parsed["cases"].is_array());
    let first = &parsed["cases"][0];
    for field in ["case_id", "engine", "sum_op", "prod_op", "passed", "max_abs_error"] {
        assert!(first.get(field).is_some(), "case field {field}");
    }
}

#[test]
fn reading_a_missing_report_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let err = ConformanceReport::read_json(&dir.path().join("absent.json"))
        .expect_err("missing file");
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}
