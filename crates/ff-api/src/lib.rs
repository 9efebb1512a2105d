#![forbid(unsafe_code)]

//! Entry points for tensor variable elimination.
//!
//! Re-exports the term model, the interpretations and the sum-product
//! algorithms, and adds einsum equations on top of them.

pub mod einsum;
pub mod errors;
pub mod logging;

pub use einsum::{
    Backend, Equation, einsum, naive_contract_einsum, naive_einsum, naive_plated_einsum,
};
pub use errors::ApiError;
pub use logging::{LOG_ENV, init_tracing};

pub use ff_core::{
    DenseArray, Domain, Dtype, Inputs, Interpretation, Op, Term, TermError, TermKind, TermTag,
    push_interpretation, with_interpretation,
};
pub use ff_interpreters::{
    apply_optimizer, die, eager, eager_or_die, lazy, memoize, moment_matching, normalize,
    optimize, reinterpret, sequential, simplify,
};
pub use ff_sum_product::{
    PlateSteps, Step, SumProductError, compute_expectation, forward_backward_terms,
    mixed_sequential_sum_product, modified_partial_sum_product, partial_sum_product,
    partial_unroll, sarkka_bilmes_product, sequential_sum_product, sum_product,
};
