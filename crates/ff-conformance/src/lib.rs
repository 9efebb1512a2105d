#![forbid(unsafe_code)]

//! Conformance harness: every elimination engine is checked against a
//! brute-force enumeration of the same model, and the outcomes are written
//! as a versioned JSON report.

pub mod oracle;
pub mod scenarios;

use std::fs;
use std::path::Path;

use ff_api::ApiError;
use ff_core::{ArrayError, TermError};
use ff_sum_product::SumProductError;
use serde::{Deserialize, Serialize};

pub use oracle::{Odometer, Table, enumerate, enumerate_chain};
pub use scenarios::{Scenario, default_scenarios, fixture_tensor};

pub const REPORT_SCHEMA_VERSION: &str = "frankenfunsor.conformance-report.v1";

/// Absolute tolerance used when none is given.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum ConformanceError {
    /// A factor is not a closed tensor or number.
    NotGround { detail: String },
    /// Plates overlap without nesting, so no enumeration order exists.
    CrossedPlates { detail: String },
    Mismatch { detail: String },
    Unsupported { detail: String },
    Term(TermError),
    SumProduct(SumProductError),
    Api(ApiError),
}

impl std::fmt::Display for ConformanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotGround { detail } => write!(f, "factor is not ground: {detail}"),
            Self::CrossedPlates { detail } => write!(f, "crossed plates: {detail}"),
            Self::Mismatch { detail } => write!(f, "result mismatch: {detail}"),
            Self::Unsupported { detail } => write!(f, "unsupported model: {detail}"),
            Self::Term(err) => write!(f, "term error: {err}"),
            Self::SumProduct(err) => write!(f, "sum-product error: {err}"),
            Self::Api(err) => write!(f, "api error: {err}"),
        }
    }
}

impl std::error::Error for ConformanceError {}

impl From<TermError> for ConformanceError {
    fn from(value: TermError) -> Self {
        Self::Term(value)
    }
}

impl From<ArrayError> for ConformanceError {
    fn from(value: ArrayError) -> Self {
        Self::Term(TermError::Array(value))
    }
}

impl From<SumProductError> for ConformanceError {
    fn from(value: SumProductError) -> Self {
        Self::SumProduct(value)
    }
}

impl From<ApiError> for ConformanceError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub engine: String,
    pub sum_op: String,
    pub prod_op: String,
    pub passed: bool,
    pub max_abs_error: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformanceReport {
    pub schema_version: String,
    pub tolerance: f64,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub cases: Vec<CaseReport>,
}

impl ConformanceReport {
    #[must_use]
    pub fn from_cases(tolerance: f64, cases: Vec<CaseReport>) -> Self {
        let passed_cases = cases.iter().filter(|case| case.passed).count();
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_owned(),
            tolerance,
            total_cases: cases.len(),
            passed_cases,
            failed_cases: cases.len() - passed_cases,
            cases,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed_cases == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = self.to_json().map_err(std::io::Error::other)?;
        fs::write(path, payload)
    }

    pub fn read_json(path: &Path) -> Result<Self, std::io::Error> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Conformance Report\n\n");
        out.push_str("| Metric | Value |\n");
        out.push_str("|---|---|\n");
        out.push_str(&format!("| Schema | `{}` |\n", self.schema_version));
        out.push_str(&format!("| Tolerance | {:e} |\n", self.tolerance));
        out.push_str(&format!("| Total Cases | {} |\n", self.total_cases));
        out.push_str(&format!("| Passed Cases | {} |\n", self.passed_cases));
        out.push_str(&format!("| Failed Cases | {} |\n\n", self.failed_cases));

        out.push_str("| Case | Engine | Semiring | Max Error | Passed |\n");
        out.push_str("|---|---|---|---|---|\n");
        for case in &self.cases {
            let error = match (&case.max_abs_error, &case.error) {
                (Some(err), _) => format!("{err:e}"),
                (None, Some(message)) => message.clone(),
                (None, None) => "-".to_owned(),
            };
            out.push_str(&format!(
                "| {} | {} | ({}, {}) | {} | {} |\n",
                case.case_id, case.engine, case.sum_op, case.prod_op, error, case.passed
            ));
        }
        out
    }
}

/// Runs every built-in scenario against the oracle.
#[must_use]
pub fn run_conformance(tolerance: f64) -> ConformanceReport {
    let cases = default_scenarios()
        .iter()
        .map(|scenario| scenario.evaluate(tolerance))
        .collect();
    ConformanceReport::from_cases(tolerance, cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: &str, passed: bool) -> CaseReport {
        CaseReport {
            case_id: id.to_owned(),
            engine: "sum_product".to_owned(),
            sum_op: "logaddexp".to_owned(),
            prod_op: "add".to_owned(),
            passed,
            max_abs_error: passed.then_some(0.0),
            error: (!passed).then(|| "crossed plates: i, j".to_owned()),
        }
    }

    #[test]
    fn counts_follow_the_cases() {
        let report = ConformanceReport::from_cases(1e-9, vec![case("a", true), case("b", false)]);
        assert_eq!(report.schema_version, REPORT_SCHEMA_VERSION);
        assert_eq!(report.total_cases, 2);
        assert_eq!(report.passed_cases, 1);
        assert_eq!(report.failed_cases, 1);
        assert!(!report.all_passed());
    }

    #[test]
    fn markdown_lists_every_case() {
        let report = ConformanceReport::from_cases(1e-9, vec![case("a", true), case("b", false)]);
        let md = report.to_markdown();
        assert!(md.contains("| Total Cases | 2 |"));
        assert!(md.contains("| a | sum_product |"));
        assert!(md.contains("crossed plates"));
    }

    #[test]
    fn errors_render() {
        let err = ConformanceError::CrossedPlates {
            detail: "i, j".to_owned(),
        };
        assert_eq!(err.to_string(), "crossed plates: i, j");
        let wrapped = ConformanceError::from(SumProductError::Intractable {
            detail: "plate i".to_owned(),
        });
        assert!(wrapped.to_string().starts_with("sum-product error"));
    }
}
