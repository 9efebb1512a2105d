#![forbid(unsafe_code)]

//! Variable elimination over factor graphs of terms.
//!
//! Factors are combined with a semiring `(sum_op, prod_op)` such as
//! `(LogAddExp, Add)` for log densities or `(Add, Mul)` for densities.
//! [`partial_sum_product`] eliminates sum variables under nested plates,
//! [`sequential_sum_product`] eliminates a Markov chain in a logarithmic
//! number of rounds, and [`modified_partial_sum_product`] mixes the two.
//!
//! Everything is built through the active interpretation: under `eager` the
//! results are tensors, under `lazy` they are the term graph of the same
//! computation.

pub mod elimination;
pub mod forward_backward;
pub mod markov;
pub mod sarkka_bilmes;
pub mod scan;
pub mod unroll;

use std::collections::{BTreeMap, BTreeSet};

use ff_core::{Term, TermError};
use ff_lax::LaxError;

pub use elimination::{
    compute_expectation, modified_partial_sum_product, partial_sum_product, partition, sum_product,
};
pub use forward_backward::{
    forward_backward_terms, naive_backward_terms, naive_forward_terms, scatter,
};
pub use markov::register_markov_rules;
pub use sarkka_bilmes::{naive_sarkka_bilmes_product, sarkka_bilmes_product};
pub use scan::{
    contraction_identity, left_pad_right_crop, mixed_sequential_sum_product,
    naive_sequential_sum_product, right_pad_left_crop, sequential_sum_product,
};
pub use unroll::{Unrolled, partial_unroll};

/// Previous-to-current variable names of a Markov step, e.g. `x_prev -> x_curr`.
pub type Step = BTreeMap<String, String>;

/// Markov chains per plate name. Each chain lists a variable's names from
/// the initial slot to the current one, e.g. `["x_0", "x_prev", "x_curr"]`.
/// A plain plate maps to no chains.
pub type PlateSteps = BTreeMap<String, Vec<Vec<String>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum SumProductError {
    /// The requested elimination cannot proceed in the given plate order.
    Intractable {
        detail: String,
    },
    InvalidArgument {
        detail: String,
    },
    Term(TermError),
}

impl std::fmt::Display for SumProductError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intractable { detail } => write!(f, "intractable elimination: {detail}"),
            Self::InvalidArgument { detail } => write!(f, "invalid argument: {detail}"),
            Self::Term(err) => write!(f, "term error: {err}"),
        }
    }
}

impl std::error::Error for SumProductError {}

impl From<TermError> for SumProductError {
    fn from(value: TermError) -> Self {
        Self::Term(value)
    }
}

impl From<LaxError> for SumProductError {
    fn from(value: LaxError) -> Self {
        Self::Term(TermError::from(value))
    }
}

impl From<SumProductError> for TermError {
    fn from(value: SumProductError) -> Self {
        match value {
            SumProductError::Term(err) => err,
            other => TermError::Unsupported {
                detail: other.to_string(),
            },
        }
    }
}

/// Reduces the names of `vars` that are inputs of `term`; other names are
/// skipped.
pub(crate) fn reduce_present<'a, I>(
    term: &Term,
    op: ff_core::Op,
    vars: I,
) -> Result<Term, TermError>
where
    I: IntoIterator<Item = &'a String>,
{
    let present: BTreeSet<&String> = vars
        .into_iter()
        .filter(|var| term.inputs().contains(var))
        .collect();
    term.reduce(op, present)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_and_convert() {
        let err = SumProductError::Intractable {
            detail: "plate i".to_owned(),
        };
        assert_eq!(err.to_string(), "intractable elimination: plate i");
        let term_err = TermError::from(err);
        assert!(matches!(term_err, TermError::Unsupported { .. }));

        let inner = TermError::UnknownSubstitution {
            name: "x".to_owned(),
        };
        let wrapped = SumProductError::from(inner.clone());
        assert_eq!(TermError::from(wrapped), inner);
    }
}
