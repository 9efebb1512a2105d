//! Chains with longer lags, named by prefix.
//!
//! An input `Px` is the value of `x` one step earlier, `PPx` two steps
//! earlier, and so on. Inputs listed as global keep their names at every
//! step.

use std::collections::BTreeSet;

use ff_core::{Domain, Op, Term, TermError};

use crate::scan::{
    mixed_sequential_sum_product, naive_sequential_sum_product, sequential_sum_product, sliced,
    time_dim,
};
use crate::{Step, SumProductError, reduce_present};

fn lag(name: &str) -> usize {
    name.bytes().take_while(|byte| *byte == b'P').count()
}

fn shift_name(name: &str, shift: isize) -> String {
    let prefix = "P".repeat(shift.unsigned_abs());
    if shift >= 0 {
        format!("{prefix}{name}")
    } else {
        name.replacen(&prefix, "", 1)
    }
}

fn shift_term(
    term: &Term,
    shift: isize,
    global_vars: &BTreeSet<String>,
) -> Result<Term, TermError> {
    if shift == 0 {
        return Ok(term.clone());
    }
    let pairs: Vec<(String, String)> = term
        .inputs()
        .names()
        .filter(|name| !global_vars.contains(*name))
        .map(|name| (name.to_owned(), shift_name(name, shift)))
        .collect();
    term.rename(pairs)
}

fn lags(trans: &Term, time: &str) -> BTreeSet<usize> {
    trans
        .inputs()
        .names()
        .filter(|name| *name != time)
        .map(lag)
        .filter(|lag| *lag > 0)
        .collect()
}

fn original_names(trans: &Term, global_vars: &BTreeSet<String>) -> Vec<String> {
    trans
        .inputs()
        .names()
        .filter(|name| !global_vars.contains(*name) && !name.starts_with('P'))
        .map(str::to_owned)
        .collect()
}

fn reduce_shifted(
    term: &Term,
    sum_op: Op,
    names: &[String],
    shifts: impl Iterator<Item = isize> + Clone,
) -> Result<Term, TermError> {
    let vars: BTreeSet<String> = names
        .iter()
        .flat_map(|name| shifts.clone().map(move |shift| shift_name(name, shift)))
        .collect();
    reduce_present(term, sum_op, &vars)
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Eliminates a lagged chain by folding from the last step to the first.
/// The result keeps the last step's names and the pre-chain lags.
pub fn naive_sarkka_bilmes_product(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    global_vars: &BTreeSet<String>,
) -> Result<Term, SumProductError> {
    let (name, duration) = time_dim(trans, time)?;
    if lags(trans, &name).is_empty() {
        return naive_sequential_sum_product(sum_op, prod_op, trans, time, &Step::new());
    }
    if duration == 0 {
        return Err(SumProductError::InvalidArgument {
            detail: format!("chain {name} has no steps"),
        });
    }
    let mut global_vars = global_vars.clone();
    global_vars.insert(name.clone());
    let originals = original_names(trans, &global_vars);

    let mut result = trans.at(&name, duration - 1)?;
    for t in (0..duration - 1).rev() {
        let shift = (duration - t - 1) as isize;
        let factor = shift_term(&trans.at(&name, t)?, shift, &global_vars)?;
        result = factor.combine(prod_op, &result)?;
        result = reduce_shifted(&result, sum_op, &originals, std::iter::once(shift))?;
    }
    Ok(shift_term(&result, -((duration - 1) as isize), &global_vars)?)
}

/// [`naive_sarkka_bilmes_product`] in parallel: steps are grouped into blocks
/// of the least common multiple of the lags, which form a first-order chain
/// that [`mixed_sequential_sum_product`] eliminates in about
/// `num_periods` sequential steps per segment.
pub fn sarkka_bilmes_product(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    global_vars: &BTreeSet<String>,
    num_periods: usize,
) -> Result<Term, SumProductError> {
    let (name, duration) = time_dim(trans, time)?;
    let lags = lags(trans, &name);
    if lags.is_empty() {
        return sequential_sum_product(sum_op, prod_op, trans, time, &Step::new());
    }
    if duration == 0 || num_periods == 0 {
        return Err(SumProductError::InvalidArgument {
            detail: format!("{num_periods} periods over a chain of {duration} steps"),
        });
    }
    let period = lags.iter().fold(1, |acc, lag| acc * lag / gcd(acc, *lag));
    let mut globals = global_vars.clone();
    globals.insert(name.clone());
    let originals = original_names(trans, &globals);

    let remaining = duration % period;
    if remaining != 0 {
        // Eliminate the whole blocks at the right, then fold in the first
        // `remaining` steps one by one.
        let truncated = duration - remaining;
        let (mut result, remaining) = if truncated == 0 {
            (trans.at(&name, remaining - 1)?, remaining - 1)
        } else {
            let tail = sliced(trans, &name, remaining, duration, 1, duration)?;
            let tail_time = Term::variable(name.as_str(), Domain::bint(truncated))?;
            let tail_product = sarkka_bilmes_product(
                sum_op,
                prod_op,
                &tail,
                &tail_time,
                global_vars,
                num_periods,
            )?;
            (tail_product, remaining)
        };
        for t in (0..remaining).rev() {
            let shift = (remaining - t) as isize;
            let factor = shift_term(&trans.at(&name, t)?, shift, &globals)?;
            result = factor.combine(prod_op, &result)?;
            result = reduce_shifted(&result, sum_op, &originals, std::iter::once(shift))?;
        }
        return Ok(shift_term(&result, -(remaining as isize), &globals)?);
    }

    let mut blocks = Vec::with_capacity(period);
    for t in 0..period {
        let factor = shift_term(trans, (period - t - 1) as isize, &globals)?;
        blocks.push(sliced(&factor, &name, t, duration - period + t + 1, period, duration)?);
    }
    let block_trans = Term::fold(prod_op, &blocks)?;
    let block_step: Step = block_trans
        .inputs()
        .names()
        .filter(|input| !globals.contains(*input) && lag(input) < period)
        .map(|input| (shift_name(input, period as isize), input.to_owned()))
        .collect();
    let block_time = Term::variable(name.as_str(), Domain::bint(duration / period))?;
    tracing::debug!(time = name.as_str(), period, blocks = duration / period, "lagged chain");
    let chunk = mixed_sequential_sum_product(
        sum_op,
        prod_op,
        &block_trans,
        &block_time,
        &block_step,
        Some((duration / (period * num_periods)).max(1)),
    )?;
    let result = reduce_shifted(&chunk, sum_op, &originals, (1..period).map(|t| t as isize))?;
    Ok(shift_term(&result, -((period - 1) as isize), &globals)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::{DenseArray, Inputs, with_interpretation};
    use ff_interpreters::eager;

    fn lagged(duration: usize, names: &[&str], seed: usize) -> Term {
        let mut pairs = vec![("time", Domain::bint(duration))];
        pairs.extend(names.iter().map(|name| (*name, Domain::bint(2))));
        let count = duration << names.len();
        let values = (0..count)
            .map(|k| ((k * 7 + seed) % 13) as f64 * 0.1 - 0.5)
            .collect();
        let mut shape = vec![duration];
        shape.extend(std::iter::repeat_n(2, names.len()));
        let data = DenseArray::new(shape, values).expect("array");
        Term::tensor(data, Inputs::from_pairs(pairs).expect("inputs")).expect("tensor")
    }

    fn time(duration: usize) -> Term {
        Term::variable("time", Domain::bint(duration)).expect("time")
    }

    fn assert_close(a: &Term, b: &Term) {
        assert_eq!(a.inputs().name_set(), b.inputs().name_set());
        let names: Vec<String> = a.inputs().name_set().into_iter().collect();
        let a = a.align(&names).expect("align");
        let b = b.align(&names).expect("align");
        let (x, _, _) = a.as_tensor().expect("tensor");
        let (y, _, _) = b.as_tensor().expect("tensor");
        assert!(x.allclose(y, 1e-9), "{x:?} vs {y:?}");
    }

    #[test]
    fn names_shift_by_prefix() {
        assert_eq!(lag("PPx"), 2);
        assert_eq!(lag("x"), 0);
        assert_eq!(shift_name("x", 2), "PPx");
        assert_eq!(shift_name("PPx", -1), "Px");
        assert_eq!(shift_name("x", -1), "x");
    }

    #[test]
    fn first_order_lags_match_the_scan() {
        with_interpretation(eager(), || {
            for duration in [1, 2, 3, 5] {
                let trans = lagged(duration, &["x", "Px"], 1);
                let naive = naive_sarkka_bilmes_product(
                    Op::LogAddExp,
                    Op::Add,
                    &trans,
                    &time(duration),
                    &BTreeSet::new(),
                )
                .expect("naive");
                let step: Step = [("Px".to_owned(), "x".to_owned())].into();
                let scan =
                    sequential_sum_product(Op::LogAddExp, Op::Add, &trans, &time(duration), &step)
                        .expect("scan");
                assert_close(&naive, &scan);
            }
        });
    }

    #[test]
    fn second_order_lags_match_the_fold() {
        with_interpretation(eager(), || {
            for duration in [1, 2, 3, 4, 5, 6, 7, 8] {
                let trans = lagged(duration, &["x", "Px", "PPx"], 2);
                let naive = naive_sarkka_bilmes_product(
                    Op::LogAddExp,
                    Op::Add,
                    &trans,
                    &time(duration),
                    &BTreeSet::new(),
                )
                .expect("naive");
                for num_periods in [1, 2] {
                    let parallel = sarkka_bilmes_product(
                        Op::LogAddExp,
                        Op::Add,
                        &trans,
                        &time(duration),
                        &BTreeSet::new(),
                        num_periods,
                    )
                    .expect("parallel");
                    assert_close(&parallel, &naive);
                }
            }
        });
    }

    #[test]
    fn mixed_lags_keep_global_inputs() {
        let globals: BTreeSet<String> = ["g".to_owned()].into();
        with_interpretation(eager(), || {
            for duration in [2, 5, 6] {
                let trans = lagged(duration, &["g", "x", "Px", "y", "PPy"], 3);
                let naive = naive_sarkka_bilmes_product(
                    Op::LogAddExp,
                    Op::Add,
                    &trans,
                    &time(duration),
                    &globals,
                )
                .expect("naive");
                assert!(naive.inputs().contains("g"));
                let parallel = sarkka_bilmes_product(
                    Op::LogAddExp,
                    Op::Add,
                    &trans,
                    &time(duration),
                    &globals,
                    1,
                )
                .expect("parallel");
                assert_close(&parallel, &naive);
            }
        });
    }
}
