//! Einsum equations over terms.
//!
//! Each character of an equation names an input of the operands, e.g.
//! `"ab,bc->ac"`. Dimensions missing from the output are reduced; with
//! plates, plate dimensions are product-reduced and the rest sum-reduced.

use std::collections::BTreeSet;
use std::str::FromStr;

use ff_core::{Op, Term, with_interpretation};
use ff_interpreters::{apply_optimizer, normalize, optimize};
use ff_sum_product::sum_product;
use tracing::debug;

use crate::errors::ApiError;

/// Semiring an equation is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Densities: sum with `Add`, multiply with `Mul`.
    #[default]
    Linear,
    /// Log densities: sum with `LogAddExp`, multiply with `Add`.
    Log,
}

impl Backend {
    /// `(sum_op, prod_op)` of the semiring.
    #[must_use]
    pub fn ops(self) -> (Op, Op) {
        match self {
            Self::Linear => (Op::Add, Op::Mul),
            Self::Log => (Op::LogAddExp, Op::Add),
        }
    }
}

impl FromStr for Backend {
    type Err = ApiError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "linear" => Ok(Self::Linear),
            "log" | "logspace" => Ok(Self::Log),
            _ => Err(ApiError::UnknownBackend {
                name: name.to_owned(),
            }),
        }
    }
}

/// A parsed einsum equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equation {
    pub inputs: Vec<String>,
    pub output: String,
}

impl Equation {
    pub fn parse(equation: &str) -> Result<Self, ApiError> {
        let invalid = |detail: &str| ApiError::InvalidEquation {
            equation: equation.to_owned(),
            detail: detail.to_owned(),
        };
        let compact: String = equation.chars().filter(|c| !c.is_whitespace()).collect();
        let Some((lhs, output)) = compact.split_once("->") else {
            return Err(invalid("missing ->"));
        };
        if output.contains("->") {
            return Err(invalid("more than one ->"));
        }
        if output.contains(',') {
            return Err(invalid("more than one output"));
        }
        let inputs: Vec<String> = lhs.split(',').map(str::to_owned).collect();
        let named = |c: char| c.is_alphanumeric();
        if !inputs.iter().flat_map(|input| input.chars()).all(named) || !output.chars().all(named) {
            return Err(invalid("dimension names must be alphanumeric characters"));
        }
        Ok(Self {
            inputs,
            output: output.to_owned(),
        })
    }

    #[must_use]
    pub fn input_dims(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .flat_map(|input| input.chars())
            .map(String::from)
            .collect()
    }

    #[must_use]
    pub fn output_dims(&self) -> BTreeSet<String> {
        self.output.chars().map(String::from).collect()
    }

    fn check_operands(&self, terms: &[Term]) -> Result<(), ApiError> {
        if self.inputs.len() == terms.len() {
            Ok(())
        } else {
            Err(ApiError::OperandCount {
                expected: self.inputs.len(),
                actual: terms.len(),
            })
        }
    }
}

fn plate_set(plates: &str) -> BTreeSet<String> {
    plates
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(String::from)
        .collect()
}

/// Multiplies every operand, then sums out the dimensions missing from the
/// output.
pub fn naive_einsum(equation: &str, terms: &[Term], backend: Backend) -> Result<Term, ApiError> {
    let equation = Equation::parse(equation)?;
    let (sum_op, prod_op) = backend.ops();
    let product = Term::fold(prod_op, terms)?;
    let reduced: Vec<String> = equation
        .input_dims()
        .difference(&equation.output_dims())
        .filter(|dim| product.inputs().contains(dim))
        .cloned()
        .collect();
    Ok(product.reduce(sum_op, reduced)?)
}

/// Tensor variable elimination: dimensions in `plates` and not in the output
/// are product-reduced, the other reduced dimensions are summed out.
pub fn naive_plated_einsum(
    equation: &str,
    terms: &[Term],
    plates: &str,
    backend: Backend,
) -> Result<Term, ApiError> {
    let plates = plate_set(plates);
    if plates.is_empty() {
        return naive_einsum(equation, terms, backend);
    }
    let parsed = Equation::parse(equation)?;
    parsed.check_operands(terms)?;
    let (sum_op, prod_op) = backend.ops();
    let input_dims = parsed.input_dims();
    let output_dims = parsed.output_dims();

    let output_plates: BTreeSet<&String> = output_dims.intersection(&plates).collect();
    let every_input_plated = parsed
        .inputs
        .iter()
        .all(|input| output_plates.iter().all(|plate| input.contains(plate.as_str())));
    if !every_input_plated {
        return Err(ApiError::Unsupported {
            detail: format!(
                "output plates {output_plates:?} must index every operand of {equation}"
            ),
        });
    }

    let plate_dims: BTreeSet<String> = plates.difference(&output_dims).cloned().collect();
    let reduce_vars: BTreeSet<String> = input_dims
        .difference(&output_dims)
        .filter(|dim| !plates.contains(*dim))
        .cloned()
        .collect();
    let eliminate: BTreeSet<String> = plate_dims.union(&reduce_vars).cloned().collect();
    debug!(equation, plates = ?plates, eliminate = ?eliminate, "plated einsum");
    Ok(sum_product(sum_op, prod_op, terms, &eliminate, &plates)?)
}

/// The whole equation as one `Contraction`, built under `optimize`.
pub fn naive_contract_einsum(
    equation: &str,
    terms: &[Term],
    backend: Backend,
) -> Result<Term, ApiError> {
    let parsed = Equation::parse(equation)?;
    parsed.check_operands(terms)?;
    let (sum_op, prod_op) = backend.ops();
    let reduced: BTreeSet<String> = parsed
        .input_dims()
        .difference(&parsed.output_dims())
        .cloned()
        .collect();
    Ok(with_interpretation(optimize(), || {
        Term::contraction(sum_op, prod_op, reduced, terms.to_vec())
    })?)
}

/// Optimized tensor variable elimination: the plated einsum is built in
/// normal form, then its contractions are reordered and evaluated under the
/// active interpretation.
pub fn einsum(
    equation: &str,
    terms: &[Term],
    plates: &str,
    backend: Backend,
) -> Result<Term, ApiError> {
    let naive = with_interpretation(normalize(), || {
        naive_plated_einsum(equation, terms, plates, backend)
    })?;
    Ok(apply_optimizer(&naive)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::{DenseArray, Domain, Inputs};
    use ff_interpreters::eager;

    fn tensor(names: &str, sizes: &[usize], seed: usize) -> Term {
        let count: usize = sizes.iter().product();
        let values = (0..count)
            .map(|k| 0.3 + ((k * 3 + seed * 5) % 7) as f64 * 0.2)
            .collect();
        let data = DenseArray::new(sizes.to_vec(), values).expect("array");
        let inputs = Inputs::from_pairs(
            names
                .chars()
                .zip(sizes)
                .map(|(name, size)| (name.to_string(), Domain::bint(*size))),
        )
        .expect("inputs");
        Term::tensor(data, inputs).expect("tensor")
    }

    fn at(term: &Term, index: &[(&str, usize)]) -> f64 {
        let mut term = term.clone();
        for (name, i) in index {
            term = term.at(name, *i).expect("index");
        }
        term.item().expect("scalar")
    }

    #[test]
    fn equations_parse_and_reject() {
        let eq = Equation::parse("ab, bc -> ac").expect("parse");
        assert_eq!(eq.inputs, vec!["ab".to_owned(), "bc".to_owned()]);
        assert_eq!(eq.output, "ac");
        assert_eq!(eq.input_dims().len(), 3);

        let empty = Equation::parse("a->").expect("scalar output");
        assert!(empty.output_dims().is_empty());

        for bad in ["ab,bc", "a->b->c", "a->b,c", "a.b->a"] {
            let err = Equation::parse(bad).expect_err(bad);
            assert!(matches!(err, ApiError::InvalidEquation { .. }), "{bad}");
        }
        assert_eq!("log".parse::<Backend>(), Ok(Backend::Log));
        assert!(matches!("cuda".parse::<Backend>(), Err(ApiError::UnknownBackend { .. })));
    }

    #[test]
    fn matrix_product_matches_every_entry_point() {
        let x = tensor("ab", &[2, 3], 0);
        let y = tensor("bc", &[3, 2], 1);
        let terms = [x.clone(), y.clone()];
        with_interpretation(eager(), || {
            let naive = naive_einsum("ab,bc->ac", &terms, Backend::Linear).expect("naive");
            let contracted =
                naive_contract_einsum("ab,bc->ac", &terms, Backend::Linear).expect("contract");
            let optimized = einsum("ab,bc->ac", &terms, "", Backend::Linear).expect("einsum");
            for a in 0..2 {
                for c in 0..2 {
                    let want: f64 = (0..3)
                        .map(|b| at(&x, &[("a", a), ("b", b)]) * at(&y, &[("b", b), ("c", c)]))
                        .sum();
                    for got in [&naive, &contracted, &optimized] {
                        assert!((at(got, &[("a", a), ("c", c)]) - want).abs() < 1e-9);
                    }
                }
            }
        });
    }

    #[test]
    fn log_backend_sums_in_log_space() {
        with_interpretation(eager(), || {
            let x = tensor("ab", &[2, 2], 2).log().expect("log");
            let total = einsum("ab->", &[x.clone()], "", Backend::Log).expect("einsum");
            let want = (0..2)
                .flat_map(|a| (0..2).map(move |b| (a, b)))
                .map(|(a, b)| at(&x, &[("a", a), ("b", b)]).exp())
                .sum::<f64>()
                .ln();
            assert!((total.item().expect("scalar") - want).abs() < 1e-9);
        });
    }

    #[test]
    fn plated_einsum_products_over_plates() {
        let f = tensor("a", &[2], 3);
        let g = tensor("ai", &[2, 3], 4);
        let terms = [f.clone(), g.clone()];
        with_interpretation(eager(), || {
            let naive = naive_plated_einsum("a,ai->", &terms, "i", Backend::Linear).expect("naive");
            let optimized = einsum("a,ai->", &terms, "i", Backend::Linear).expect("einsum");
            let want: f64 = (0..2)
                .map(|a| {
                    let plate: f64 = (0..3).map(|i| at(&g, &[("a", a), ("i", i)])).product();
                    at(&f, &[("a", a)]) * plate
                })
                .sum();
            assert!((naive.item().expect("scalar") - want).abs() < 1e-9);
            assert!((optimized.item().expect("scalar") - want).abs() < 1e-9);

            // Output plates stay as inputs.
            let kept = naive_plated_einsum("ai->i", std::slice::from_ref(&g), "i", Backend::Linear)
                .expect("kept");
            assert_eq!(kept.inputs().name_set(), BTreeSet::from(["i".to_owned()]));
        });
    }

    #[test]
    fn operand_and_plate_mismatches_are_errors() {
        let f = tensor("a", &[2], 0);
        let err = naive_contract_einsum("a,a->", &[f.clone()], Backend::Linear).expect_err("count");
        assert_eq!(err, ApiError::OperandCount { expected: 2, actual: 1 });

        let g = tensor("ai", &[2, 3], 1);
        let err = naive_plated_einsum("a,ai->i", &[f, g], "i", Backend::Linear)
            .expect_err("output plate missing from an operand");
        assert!(matches!(err, ApiError::Unsupported { .. }));
    }
}
