#![forbid(unsafe_code)]

//! Shared test tooling: a JSON test-log record written per test, fixture
//! digests, property-test configuration and float comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "frankenfunsor.test-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Unit,
    Property,
    Scenario,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub rust_version: String,
    pub os: String,
    pub cargo_target_dir: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestPhaseTimings {
    pub setup_ms: u64,
    pub execute_ms: u64,
    pub verify_ms: u64,
    pub teardown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub suite_id: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub mode: TestMode,
    pub env: TestLogEnv,
    pub artifact_refs: Vec<String>,
    pub result: TestResult,
    pub duration_ms: u64,
    pub details: Option<String>,
    pub phase_timings: TestPhaseTimings,
}

impl TestLogV1 {
    #[must_use]
    pub fn unit(
        suite_id: impl Into<String>,
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        mode: TestMode,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            suite_id: suite_id.into(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            mode,
            env: capture_env(),
            artifact_refs: Vec::new(),
            result: TestResult::Fail,
            duration_ms: 0,
            details: None,
            phase_timings: TestPhaseTimings::default(),
        }
    }
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        rust_version: rust_version(),
        os: std::env::consts::OS.to_owned(),
        cargo_target_dir: std::env::var("CARGO_TARGET_DIR")
            .unwrap_or_else(|_| "<default>".to_owned()),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Case count for property tests: `FF_PROPTEST_CASES`, else 1024 on CI and
/// 256 locally.
#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("FF_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["FF_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .iter()
        .find_map(|key| std::env::var(key).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Relative comparison used by numeric assertions across the workspace.
#[must_use]
pub fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_nan() || b.is_nan() {
        return false;
    }
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

#[must_use]
pub fn all_close(a: &[f64], b: &[f64], tol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| approx_eq(*x, *y, tol))
}

// ── Logged test runner ──────────────────────────────────────────────

/// Identifies the crate a logged test belongs to. Logs land under
/// `artifacts/testing/logs/<suite_id>/` at the workspace root.
#[derive(Debug, Clone, Copy)]
pub struct Suite {
    pub suite_id: &'static str,
    pub package: &'static str,
    pub manifest_dir: &'static str,
}

impl Suite {
    fn log_path(&self, test_id: &str) -> PathBuf {
        let file_name = test_id.replace("::", "__");
        PathBuf::from(self.manifest_dir)
            .join("../..")
            .join("artifacts")
            .join("testing")
            .join("logs")
            .join(self.suite_id)
            .join(format!("{file_name}.json"))
    }

    fn replay_command(&self, test_id: &str) -> String {
        let name = test_id.rsplit("::").next().unwrap_or(test_id);
        format!(
            "cargo test -p {} {name} -- --exact --nocapture",
            self.package
        )
    }
}

fn duration_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn write_log(path: &Path, log: &TestLogV1) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("log dir create failed: {err}"))?;
    }
    let payload =
        serde_json::to_string_pretty(log).map_err(|err| format!("log serialize failed: {err}"))?;
    fs::write(path, payload).map_err(|err| format!("log write failed: {err}"))
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    "non-string panic payload".to_owned()
}

/// Runs `body`, writes a [`TestLogV1`] record for it and then re-raises any
/// failure. `body` returns artifact references on success.
pub fn run_logged_test<Fixture, F>(
    suite: Suite,
    module_path: &str,
    test_name: &str,
    fixture: &Fixture,
    mode: TestMode,
    body: F,
) where
    Fixture: Serialize,
    F: FnOnce() -> Result<Vec<String>, String>,
{
    let overall_start = Instant::now();
    let setup_start = Instant::now();
    let fixture_id = fixture_id_from_json(fixture).unwrap_or_else(|_| "unserializable".to_owned());
    let test_id = test_id(module_path, test_name);
    let mut log = TestLogV1::unit(suite.suite_id, test_id.clone(), fixture_id, mode);
    log.phase_timings.setup_ms = duration_ms(setup_start);

    let execute_start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(body));
    log.phase_timings.execute_ms = duration_ms(execute_start);

    let verify_start = Instant::now();
    let mut panic_payload: Option<Box<dyn Any + Send>> = None;
    let mut failure_detail: Option<String> = None;
    let replay = format!("replay: {}", suite.replay_command(&test_id));
    match outcome {
        Ok(Ok(mut artifact_refs)) => {
            log.result = TestResult::Pass;
            artifact_refs.push(replay);
            log.artifact_refs = artifact_refs;
            log.details = Some(format!("suite_id={};result=pass", suite.suite_id));
        }
        Ok(Err(detail)) => {
            failure_detail = Some(detail.clone());
            log.artifact_refs = vec![replay];
            log.details = Some(detail);
        }
        Err(payload) => {
            let detail = panic_payload_to_string(payload.as_ref());
            failure_detail = Some(detail.clone());
            log.artifact_refs = vec![replay];
            log.details = Some(detail);
            panic_payload = Some(payload);
        }
    }
    log.phase_timings.verify_ms = duration_ms(verify_start);

    let log_path = suite.log_path(&test_id);
    log.artifact_refs.push(log_path.display().to_string());

    let teardown_start = Instant::now();
    if let Err(err) = write_log(&log_path, &log) {
        eprintln!("warning: {err}");
    }
    log.phase_timings.teardown_ms = duration_ms(teardown_start);
    log.duration_ms = duration_ms(overall_start);
    if let Err(err) = write_log(&log_path, &log) {
        eprintln!("warning: {err}");
    }

    if let Some(payload) = panic_payload {
        std::panic::resume_unwind(payload);
    }
    if let Some(detail) = failure_detail {
        panic!("{detail}");
    }
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn rust_version() -> String {
    let output = Command::new("rustc").arg("--version").output();
    match output {
        Ok(result) if result.status.success() => {
            String::from_utf8_lossy(&result.stdout).trim().to_owned()
        }
        _ => "rustc <unknown>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_digest_is_stable_for_equal_json() {
        let fixture = serde_json::json!({ "factors": 3, "eliminate": ["x", "y"] });
        let digest_a = fixture_id_from_json(&fixture).expect("digest should build");
        let digest_b = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 64);
    }

    #[test]
    fn property_case_count_has_default_floor() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn log_record_round_trips_through_json() {
        let log = TestLogV1::unit(
            "ff-test-utils",
            test_id(module_path!(), "log_record_round_trips_through_json"),
            "fixture-id",
            TestMode::Unit,
        );
        assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
        let encoded = serde_json::to_string(&log).expect("serialize should work");
        let decoded: TestLogV1 = serde_json::from_str(&encoded).expect("deserialize should work");
        assert_eq!(decoded, log);
    }

    #[test]
    fn approx_eq_is_relative() {
        assert!(approx_eq(1e6, 1e6 + 1e-4, 1e-9));
        assert!(!approx_eq(1.0, 1.1, 1e-6));
        assert!(approx_eq(f64::NEG_INFINITY, f64::NEG_INFINITY, 1e-6));
        assert!(!approx_eq(f64::NAN, f64::NAN, 1e-6));
    }

    #[test]
    fn logged_runner_reraises_failures() {
        let suite = Suite {
            suite_id: "ff-test-utils",
            package: "ff-test-utils",
            manifest_dir: env!("CARGO_MANIFEST_DIR"),
        };
        let result = std::panic::catch_unwind(|| {
            run_logged_test(
                suite,
                module_path!(),
                "logged_runner_reraises_failures_inner",
                &("failing", 1_u32),
                TestMode::Unit,
                || Err("expected failure".to_owned()),
            );
        });
        assert!(result.is_err());
    }
}
