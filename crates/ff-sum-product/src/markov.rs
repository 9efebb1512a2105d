//! Eager evaluation of lazy `MarkovProduct` terms.

use std::cell::Cell;

use ff_core::{Op, Term, TermError, TermKind, TermTag};
use ff_interpreters::Pattern;

use crate::Step;
use crate::scan::sequential_sum_product;

thread_local! {
    static REGISTERED: Cell<bool> = const { Cell::new(false) };
}

/// Installs the `MarkovProduct` rule in this thread's eager rule table, and
/// so in every interpretation built on it. Calling it again is a no-op.
pub fn register_markov_rules() {
    REGISTERED.with(|done| {
        if !done.replace(true) {
            ff_interpreters::eager_rules()
                .register(Pattern::new(TermTag::MarkovProduct), eager_markov_product);
            tracing::debug!("registered markov product rule");
        }
    });
}

fn eager_markov_product(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::MarkovProduct {
        sum_op,
        prod_op,
        trans,
        time,
        step,
        step_names,
    } = kind
    else {
        return Ok(None);
    };
    let Some((time_name, domain)) = time.as_variable() else {
        return Ok(None);
    };
    let result = if !step.is_empty() {
        let step: Step = step.iter().cloned().collect();
        sequential_sum_product(*sum_op, *prod_op, trans, time, &step)?
    } else if trans.inputs().contains(time_name) {
        trans.reduce(*prod_op, [time_name])?
    } else {
        let Some(size) = domain.size() else {
            return Ok(None);
        };
        match prod_op {
            Op::Add => trans.combine_number(Op::Mul, size as f64)?,
            Op::Mul => trans.combine_number(Op::Pow, size as f64)?,
            _ => return Ok(None),
        }
    };
    result.rename(step_names.iter().cloned()).map(Some)
}
