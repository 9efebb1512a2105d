use std::collections::BTreeSet;

use ff_api::{ApiError, Backend, naive_plated_einsum};
use ff_conformance::{
    ConformanceError, DEFAULT_TOLERANCE, default_scenarios, enumerate, fixture_tensor,
    run_conformance,
};
use ff_core::{Op, with_interpretation};
use ff_interpreters::eager;
use ff_sum_product::sum_product;
use ff_test_utils::{Suite, TestMode, run_logged_test};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};

const SUITE: Suite = Suite {
    suite_id: "ff-conformance",
    package: "ff-conformance",
    manifest_dir: env!("CARGO_MANIFEST_DIR"),
};

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

#[test]
fn every_engine_matches_enumeration() {
    let fixture = ("default_scenarios", DEFAULT_TOLERANCE);
    run_logged_test(
        SUITE,
        module_path!(),
        "every_engine_matches_enumeration",
        &fixture,
        TestMode::Scenario,
        || {
            let report = run_conformance(DEFAULT_TOLERANCE);
            if report.total_cases != default_scenarios().len() {
                return Err(format!("ran {} cases", report.total_cases));
            }
            if let Some(case) = report.cases.iter().find(|case| !case.passed) {
                return Err(format!(
                    "{} via {} failed: error={:?} max_abs_error={:?}",
                    case.case_id, case.engine, case.error, case.max_abs_error
                ));
            }
            Ok(vec![format!("cases={}", report.total_cases)])
        },
    );
}

#[test]
fn scenario_ids_pair_with_engines_uniquely() {
    let scenarios = default_scenarios();
    let keys: BTreeSet<(&str, &str)> = scenarios
        .iter()
        .map(|scenario| (scenario.case_id, scenario.engine))
        .collect();
    assert_eq!(keys.len(), scenarios.len());
}

#[test]
fn kept_plate_case_runs_and_passes() {
    let scenario = default_scenarios()
        .into_iter()
        .find(|scenario| scenario.case_id == "kept_plate")
        .expect("kept_plate is a built-in case");
    let report = scenario.evaluate(DEFAULT_TOLERANCE);
    assert_eq!(report.error, None);
    assert!(report.passed, "max_abs_error={:?}", report.max_abs_error);
}

#[test]
fn kept_plate_must_index_every_operand() {
    let factors = [
        fixture_tensor(&[("a", 3)], 9).expect("fixture"),
        fixture_tensor(&[("a", 3), ("i", 4)], 10).expect("fixture"),
    ];
    let err = with_interpretation(eager(), || {
        naive_plated_einsum("a,ai->i", &factors, "i", Backend::Linear)
    })
    .expect_err("the first operand has no i");
    assert!(matches!(err, ApiError::Unsupported { .. }));
}

#[test]
fn oracle_and_engine_agree_on_crossed_plates() {
    let factors = [
        fixture_tensor(&[("i", 2), ("x", 2)], 1).expect("fixture"),
        fixture_tensor(&[("j", 2), ("y", 2)], 2).expect("fixture"),
        fixture_tensor(&[("i", 2), ("j", 2), ("x", 2), ("y", 2)], 3).expect("fixture"),
    ];
    let eliminate = names(&["i", "j", "x", "y"]);
    let plates = names(&["i", "j"]);
    let oracle = enumerate(Op::Add, Op::Mul, &factors, &eliminate, &plates)
        .expect_err("oracle should refuse crossed plates");
    assert!(matches!(oracle, ConformanceError::CrossedPlates { .. }));
    let engine = with_interpretation(eager(), || {
        sum_product(Op::Add, Op::Mul, &factors, &eliminate, &plates)
    });
    assert!(engine.is_err(), "engine should refuse crossed plates");
}

#[test]
fn prop_plated_sum_product_matches_enumeration() {
    run_logged_test(
        SUITE,
        module_path!(),
        "prop_plated_sum_product_matches_enumeration",
        &"random_plated_models",
        TestMode::Property,
        || {
            check_random_plated_models();
            Ok(Vec::new())
        },
    );
}

fn check_random_plated_models() {
    let mut runner = TestRunner::new(ProptestConfig::with_cases(
        ff_test_utils::property_test_case_count().min(64),
    ));
    let size = 1_usize..=3;
    let strategy = (
        size.clone(),
        size.clone(),
        size.clone(),
        size,
        any::<u64>(),
        any::<bool>(),
    );
    runner
        .run(&strategy, |(a, b, i, j, seed, nested)| {
            with_interpretation(eager(), || {
                let fail = |e: ConformanceError| TestCaseError::fail(e.to_string());
                let mut factors = vec![
                    fixture_tensor(&[("a", a)], seed).map_err(fail)?,
                    fixture_tensor(&[("a", a), ("i", i), ("b", b)], seed ^ 1).map_err(fail)?,
                ];
                let mut eliminate = names(&["a", "b", "i"]);
                let mut plates = names(&["i"]);
                if nested {
                    factors.push(
                        fixture_tensor(&[("b", b), ("i", i), ("j", j), ("c", 2)], seed ^ 2)
                            .map_err(fail)?,
                    );
                    eliminate.extend(names(&["c", "j"]));
                    plates.insert("j".to_owned());
                }
                let want = enumerate(Op::Add, Op::Mul, &factors, &eliminate, &plates)
                    .map_err(fail)?;
                let got = sum_product(Op::Add, Op::Mul, &factors, &eliminate, &plates)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let err = want.max_abs_error(&got).map_err(fail)?;
                prop_assert!(err <= 1e-9 * (1.0 + want.values[0].abs()), "error {err}");
                Ok(())
            })
        })
        .expect("sum_product should match enumeration");
}
