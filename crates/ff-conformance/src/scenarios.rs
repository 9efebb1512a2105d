//! Built-in conformance cases: small models evaluated by an engine and by
//! the enumeration oracle.

use std::collections::BTreeSet;

use ff_api::{Backend, einsum, naive_plated_einsum};
use ff_core::{DenseArray, Domain, Inputs, Op, Term, with_interpretation};
use ff_interpreters::eager;
use ff_sum_product::{
    PlateSteps, Step, modified_partial_sum_product, sarkka_bilmes_product, sequential_sum_product,
    sum_product,
};

use crate::oracle::{enumerate, enumerate_chain};
use crate::{CaseReport, ConformanceError};

/// Deterministic factor over named discrete inputs with entries in
/// `[0.1, 1.1)`.
pub fn fixture_tensor(inputs: &[(&str, usize)], seed: u64) -> Result<Term, ConformanceError> {
    let shape: Vec<usize> = inputs.iter().map(|(_, size)| *size).collect();
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    let values = (0..shape.iter().product::<usize>())
        .map(|_| {
            // splitmix64
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            0.1 + (z >> 11) as f64 / (1_u64 << 53) as f64
        })
        .collect();
    let data = DenseArray::new(shape, values)?;
    let inputs =
        Inputs::from_pairs(inputs.iter().map(|(name, size)| (*name, Domain::bint(*size))))?;
    Ok(Term::tensor(data, inputs)?)
}

fn log_fixture(inputs: &[(&str, usize)], seed: u64) -> Result<Term, ConformanceError> {
    let linear = fixture_tensor(inputs, seed)?;
    Ok(with_interpretation(eager(), || linear.log())?)
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

/// One engine run compared against the oracle.
pub struct Scenario {
    pub case_id: &'static str,
    pub engine: &'static str,
    pub backend: Backend,
    run: fn() -> Result<f64, ConformanceError>,
}

impl Scenario {
    /// Runs the case under eager evaluation.
    #[must_use]
    pub fn evaluate(&self, tolerance: f64) -> CaseReport {
        let (sum_op, prod_op) = self.backend.ops();
        let outcome = with_interpretation(eager(), self.run);
        let (max_abs_error, error) = match outcome {
            Ok(err) => (Some(err), None),
            Err(err) => (None, Some(err.to_string())),
        };
        CaseReport {
            case_id: self.case_id.to_owned(),
            engine: self.engine.to_owned(),
            sum_op: sum_op.as_str().to_owned(),
            prod_op: prod_op.as_str().to_owned(),
            passed: max_abs_error.is_some_and(|err| err <= tolerance),
            max_abs_error,
            error,
        }
    }
}

fn xyz() -> Result<Vec<Term>, ConformanceError> {
    Ok(vec![
        fixture_tensor(&[("x", 2)], 1)?,
        fixture_tensor(&[("x", 2), ("y", 3)], 2)?,
        fixture_tensor(&[("y", 3), ("z", 2)], 3)?,
    ])
}

fn xyz_sum_product() -> Result<f64, ConformanceError> {
    let factors = xyz()?;
    let eliminate = names(&["x", "y"]);
    let plates = BTreeSet::new();
    let want = enumerate(Op::Add, Op::Mul, &factors, &eliminate, &plates)?;
    let got = sum_product(Op::Add, Op::Mul, &factors, &eliminate, &plates)?;
    want.max_abs_error(&got)
}

fn xyz_einsum() -> Result<f64, ConformanceError> {
    let factors = xyz()?;
    let want = enumerate(Op::Add, Op::Mul, &factors, &names(&["x", "y"]), &BTreeSet::new())?;
    let got = einsum("x,xy,yz->z", &factors, "", Backend::Linear)?;
    want.max_abs_error(&got)
}

fn xyz_log_partition() -> Result<f64, ConformanceError> {
    let factors = vec![
        log_fixture(&[("x", 2)], 13)?,
        log_fixture(&[("x", 2), ("y", 2)], 14)?,
        log_fixture(&[("y", 2), ("z", 2)], 15)?,
    ];
    let eliminate = names(&["x", "y", "z"]);
    let plates = BTreeSet::new();
    let want = enumerate(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    let got = sum_product(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    want.max_abs_error(&got)
}

fn plated() -> Result<Vec<Term>, ConformanceError> {
    Ok(vec![
        log_fixture(&[("a", 2)], 4)?,
        log_fixture(&[("a", 2), ("i", 3), ("b", 2)], 5)?,
    ])
}

fn plated_sum_product() -> Result<f64, ConformanceError> {
    let factors = plated()?;
    let eliminate = names(&["a", "b", "i"]);
    let plates = names(&["i"]);
    let want = enumerate(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    let got = sum_product(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    want.max_abs_error(&got)
}

fn plated_einsum() -> Result<f64, ConformanceError> {
    let factors = plated()?;
    let want = enumerate(
        Op::LogAddExp,
        Op::Add,
        &factors,
        &names(&["a", "b", "i"]),
        &names(&["i"]),
    )?;
    let got = einsum("a,aib->", &factors, "i", Backend::Log)?;
    want.max_abs_error(&got)
}

fn nested_sum_product() -> Result<f64, ConformanceError> {
    let factors = vec![
        log_fixture(&[("a", 2)], 6)?,
        log_fixture(&[("a", 2), ("i", 2), ("b", 3)], 7)?,
        log_fixture(&[("b", 3), ("i", 2), ("j", 3), ("c", 2)], 8)?,
    ];
    let eliminate = names(&["a", "b", "c", "i", "j"]);
    let plates = names(&["i", "j"]);
    let want = enumerate(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    let got = sum_product(Op::LogAddExp, Op::Add, &factors, &eliminate, &plates)?;
    want.max_abs_error(&got)
}

fn kept_plate_einsum() -> Result<f64, ConformanceError> {
    let factors = vec![
        fixture_tensor(&[("a", 3), ("i", 4)], 9)?,
        fixture_tensor(&[("i", 4)], 10)?,
    ];
    let want = enumerate(Op::Add, Op::Mul, &factors, &names(&["a"]), &names(&["i"]))?;
    let got = naive_plated_einsum("ai,i->i", &factors, "i", Backend::Linear)?;
    want.max_abs_error(&got)
}

const CHAIN_DURATION: usize = 5;

fn chain() -> Result<Term, ConformanceError> {
    log_fixture(
        &[("time", CHAIN_DURATION), ("x_prev", 2), ("x_curr", 2)],
        11,
    )
}

fn chain_scan() -> Result<f64, ConformanceError> {
    let trans = chain()?;
    let want = enumerate_chain(Op::LogAddExp, Op::Add, &trans, "time", "x_prev", "x_curr")?;
    let time = Term::variable("time", Domain::bint(CHAIN_DURATION))?;
    let step: Step = [("x_prev".to_owned(), "x_curr".to_owned())].into();
    let got = sequential_sum_product(Op::LogAddExp, Op::Add, &trans, &time, &step)?;
    want.max_abs_error(&got)
}

fn chain_markov_plate() -> Result<f64, ConformanceError> {
    let trans = chain()?;
    let want = enumerate_chain(Op::LogAddExp, Op::Add, &trans, "time", "x_prev", "x_curr")?
        .reduce(Op::LogAddExp, "x_curr")?
        .rename("x_prev", "x_0");
    let steps: PlateSteps = [(
        "time".to_owned(),
        vec![vec![
            "x_0".to_owned(),
            "x_prev".to_owned(),
            "x_curr".to_owned(),
        ]],
    )]
    .into();
    let eliminate = names(&["time", "x_prev", "x_curr"]);
    let results = modified_partial_sum_product(
        Op::LogAddExp,
        Op::Add,
        std::slice::from_ref(&trans),
        &eliminate,
        &steps,
    )?;
    let [got] = results.as_slice() else {
        return Err(ConformanceError::Mismatch {
            detail: format!("expected one result, got {}", results.len()),
        });
    };
    want.max_abs_error(got)
}

fn chain_sarkka_bilmes() -> Result<f64, ConformanceError> {
    let trans = log_fixture(&[("time", CHAIN_DURATION), ("Px", 2), ("x", 2)], 12)?;
    let want = enumerate_chain(Op::LogAddExp, Op::Add, &trans, "time", "Px", "x")?;
    let time = Term::variable("time", Domain::bint(CHAIN_DURATION))?;
    let got = sarkka_bilmes_product(Op::LogAddExp, Op::Add, &trans, &time, &BTreeSet::new(), 2)?;
    want.max_abs_error(&got)
}

/// Every built-in case, in report order.
#[must_use]
pub fn default_scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            case_id: "xyz_marginal",
            engine: "sum_product",
            backend: Backend::Linear,
            run: xyz_sum_product,
        },
        Scenario {
            case_id: "xyz_marginal",
            engine: "einsum",
            backend: Backend::Linear,
            run: xyz_einsum,
        },
        Scenario {
            case_id: "xyz_partition",
            engine: "sum_product",
            backend: Backend::Log,
            run: xyz_log_partition,
        },
        Scenario {
            case_id: "single_plate",
            engine: "sum_product",
            backend: Backend::Log,
            run: plated_sum_product,
        },
        Scenario {
            case_id: "single_plate",
            engine: "einsum",
            backend: Backend::Log,
            run: plated_einsum,
        },
        Scenario {
            case_id: "nested_plates",
            engine: "sum_product",
            backend: Backend::Log,
            run: nested_sum_product,
        },
        Scenario {
            case_id: "kept_plate",
            engine: "naive_plated_einsum",
            backend: Backend::Linear,
            run: kept_plate_einsum,
        },
        Scenario {
            case_id: "hmm_chain",
            engine: "sequential_sum_product",
            backend: Backend::Log,
            run: chain_scan,
        },
        Scenario {
            case_id: "hmm_chain",
            engine: "modified_partial_sum_product",
            backend: Backend::Log,
            run: chain_markov_plate,
        },
        Scenario {
            case_id: "lagged_chain",
            engine: "sarkka_bilmes_product",
            backend: Backend::Log,
            run: chain_sarkka_bilmes,
        },
    ]
}
