//! Eliminating a Markov chain along a time input.
//!
//! `trans` carries one transition factor per time step over paired inputs
//! `prev -> curr`. Eliminating the chain joins `curr` of step `t` with `prev`
//! of step `t + 1` and sums the joined variable out, leaving a factor over
//! the `prev` of the first step and the `curr` of the last.

use std::collections::BTreeSet;

use ff_core::{DenseArray, Domain, Inputs, Op, Term, TermError};

use crate::{Step, SumProductError, reduce_present};

/// Name and length of the chain variable `time`, checked against `trans`.
pub(crate) fn time_dim(trans: &Term, time: &Term) -> Result<(String, usize), SumProductError> {
    let Some((name, domain)) = time.as_variable() else {
        return Err(SumProductError::InvalidArgument {
            detail: format!("time must be a variable, got {}", time.tag().as_str()),
        });
    };
    let size = domain.size().ok_or_else(|| SumProductError::InvalidArgument {
        detail: format!("time {name} must be a bounded integer, got {domain}"),
    })?;
    if let Some(existing) = trans.inputs().get(name) {
        if existing != domain {
            return Err(SumProductError::InvalidArgument {
                detail: format!("time {name} is {domain} but trans has it as {existing}"),
            });
        }
    }
    Ok((name.to_owned(), size))
}

/// Length of the bounded input `time` of `trans`.
pub(crate) fn duration_of(trans: &Term, time: &str) -> Result<usize, SumProductError> {
    trans
        .inputs()
        .get(time)
        .and_then(Domain::size)
        .ok_or_else(|| SumProductError::InvalidArgument {
            detail: format!("trans has no bounded input {time}"),
        })
}

/// Fresh names that stand for the joined variable of each step pair.
pub(crate) struct Drops {
    pub(crate) prev: Vec<(String, String)>,
    pub(crate) curr: Vec<(String, String)>,
    pub(crate) names: BTreeSet<String>,
}

impl Drops {
    pub(crate) fn new(step: &Step) -> Self {
        let mut drops = Self {
            prev: Vec::with_capacity(step.len()),
            curr: Vec::with_capacity(step.len()),
            names: BTreeSet::new(),
        };
        for (i, (prev, curr)) in step.iter().enumerate() {
            let drop = format!("_drop_{i}");
            drops.prev.push((prev.clone(), drop.clone()));
            drops.curr.push((curr.clone(), drop.clone()));
            drops.names.insert(drop);
        }
        drops
    }

    /// `prod_op(x, y)` with `x.curr` joined to `y.prev`, joined names summed out.
    pub(crate) fn join(
        &self,
        sum_op: Op,
        prod_op: Op,
        x: &Term,
        y: &Term,
    ) -> Result<Term, TermError> {
        let x = x.rename(self.curr.iter().cloned())?;
        let y = y.rename(self.prev.iter().cloned())?;
        reduce_present(&x.combine(prod_op, &y)?, sum_op, &self.names)
    }
}

/// `trans` restricted to the time steps `start..stop` by `step`.
pub(crate) fn sliced(
    trans: &Term,
    time: &str,
    start: usize,
    stop: usize,
    step: usize,
    duration: usize,
) -> Result<Term, TermError> {
    trans.subs([(time, Term::slice(time, start, stop, step, duration)?)])
}

/// A factor shaped like `factor` that leaves any chain it is joined with
/// unchanged: a log identity matrix over each step pair, zero elsewhere.
pub fn contraction_identity(factor: &Term, step: &Step) -> Result<Term, SumProductError> {
    let mut inputs = factor.inputs().clone();
    let dtype = factor.output().dtype();
    let mut parts = Vec::with_capacity(step.len() + 1);
    for (prev, curr) in step {
        let (Some(prev_domain), Some(curr_domain)) = (inputs.remove(prev), inputs.remove(curr))
        else {
            return Err(SumProductError::InvalidArgument {
                detail: format!("factor lacks step inputs {prev} -> {curr}"),
            });
        };
        let size = prev_domain
            .size()
            .ok_or_else(|| SumProductError::InvalidArgument {
                detail: format!("step input {prev} is not a bounded integer"),
            })?;
        let eye = ff_lax::eye(size)?;
        let log_eye = eye.elements().iter().map(|v| v.ln()).collect();
        let data = DenseArray::new(vec![size, size], log_eye).map_err(TermError::from)?;
        let pair = Inputs::from_pairs([(prev.clone(), prev_domain), (curr.clone(), curr_domain)])?;
        parts.push(Term::tensor_with_dtype(data, pair, dtype)?);
    }
    let zeros = DenseArray::full(inputs.bint_sizes()?, 0.0).map_err(TermError::from)?;
    parts.push(Term::tensor_with_dtype(zeros, inputs, dtype)?);
    Ok(Term::fold(Op::Add, &parts)?)
}

/// Shifts `trans` one step later along `time`: an identity step first, the
/// last step dropped.
pub fn left_pad_right_crop(trans: &Term, time: &str, step: &Step) -> Result<Term, SumProductError> {
    let duration = duration_of(trans, time)?;
    let pad = contraction_identity(&sliced(trans, time, 0, 1, 1, duration)?, step)?;
    let cropped = sliced(trans, time, 0, duration - 1, 1, duration)?;
    Ok(Term::cat(time, vec![pad, cropped], time)?)
}

/// Shifts `trans` one step earlier along `time`: the first step dropped, an
/// identity step last.
pub fn right_pad_left_crop(trans: &Term, time: &str, step: &Step) -> Result<Term, SumProductError> {
    let duration = duration_of(trans, time)?;
    let pad = contraction_identity(&sliced(trans, time, 0, 1, 1, duration)?, step)?;
    let cropped = sliced(trans, time, 1, duration, 1, duration)?;
    Ok(Term::cat(time, vec![cropped, pad], time)?)
}

/// Eliminates the chain by folding from the last step to the first.
pub fn naive_sequential_sum_product(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
) -> Result<Term, SumProductError> {
    let (time, duration) = time_dim(trans, time)?;
    let drops = Drops::new(step);
    let mut factors = (0..duration)
        .map(|t| trans.at(&time, t))
        .collect::<Result<Vec<_>, _>>()?;
    while factors.len() > 1 {
        let (Some(y), Some(x)) = (factors.pop(), factors.pop()) else {
            break;
        };
        factors.push(drops.join(sum_op, prod_op, &x, &y)?);
    }
    factors.pop().ok_or_else(|| SumProductError::InvalidArgument {
        detail: format!("chain {time} has no steps"),
    })
}

/// Eliminates the chain in `ceil(log2(duration))` rounds. Each round joins
/// even steps with their odd successors; an odd last step is carried over
/// unjoined.
pub fn sequential_sum_product(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
) -> Result<Term, SumProductError> {
    let (time, mut duration) = time_dim(trans, time)?;
    if duration == 0 {
        return Err(SumProductError::InvalidArgument {
            detail: format!("chain {time} has no steps"),
        });
    }
    let drops = Drops::new(step);
    let mut trans = trans.clone();
    while duration > 1 {
        let even = duration / 2 * 2;
        let x = sliced(&trans, &time, 0, even, 2, duration)?.rename(drops.curr.iter().cloned())?;
        let y = sliced(&trans, &time, 1, even, 2, duration)?.rename(drops.prev.iter().cloned())?;
        let mut contracted = Term::contraction(sum_op, prod_op, drops.names.clone(), vec![x, y])?;
        if duration > even {
            let extra = sliced(&trans, &time, duration - 1, duration, 1, duration)?;
            contracted = Term::cat(time.as_str(), vec![contracted, extra], time.as_str())?;
        }
        trans = contracted;
        duration = duration.div_ceil(2);
        tracing::debug!(time = time.as_str(), duration, "scan round");
    }
    Ok(trans.at(&time, 0)?)
}

/// Eliminates the chain in `num_segments` blocks: each block is folded
/// step by step, then the block results are scanned in parallel. `None`
/// uses one block per step.
pub fn mixed_sequential_sum_product(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
    num_segments: Option<usize>,
) -> Result<Term, SumProductError> {
    let (name, duration) = time_dim(trans, time)?;
    let num_segments = num_segments.unwrap_or(duration);
    if num_segments == 0 || duration == 0 {
        return Err(SumProductError::InvalidArgument {
            detail: format!("{num_segments} segments over a chain of {duration} steps"),
        });
    }

    // Uneven blocks: eliminate the even prefix, then fold in the remainder.
    let remainder = duration % num_segments;
    if remainder != 0 && duration > remainder {
        let cut = duration - remainder;
        let tail = sliced(trans, &name, cut, duration, 1, duration)?;
        let head = sliced(trans, &name, 0, cut, 1, duration)?;
        let head_time = Term::variable(name.as_str(), Domain::bint(cut))?;
        let head = mixed_sequential_sum_product(
            sum_op,
            prod_op,
            &head,
            &head_time,
            step,
            Some(num_segments),
        )?;
        let rest = Term::cat(
            name.as_str(),
            vec![Term::stack(name.as_str(), vec![head])?, tail],
            name.as_str(),
        )?;
        let rest_time = Term::variable(name.as_str(), Domain::bint(1 + remainder))?;
        return naive_sequential_sum_product(sum_op, prod_op, &rest, &rest_time, step);
    }

    if num_segments == 1 {
        return naive_sequential_sum_product(sum_op, prod_op, trans, time, step);
    }
    if num_segments >= duration {
        return sequential_sum_product(sum_op, prod_op, trans, time, step);
    }

    let length = duration / num_segments;
    let segments = (0..num_segments)
        .map(|i| sliced(trans, &name, i * length, (i + 1) * length, 1, duration))
        .collect::<Result<Vec<_>, _>>()?;
    let segmented = format!("{name}__SEGMENTED");
    tracing::debug!(
        time = name.as_str(),
        segments = num_segments,
        length,
        "segmented scan"
    );
    let blocks = Term::stack(segmented.as_str(), segments)?;
    let within = naive_sequential_sum_product(
        sum_op,
        prod_op,
        &blocks,
        &Term::variable(name.as_str(), Domain::bint(length))?,
        step,
    )?;
    sequential_sum_product(
        sum_op,
        prod_op,
        &within,
        &Term::variable(segmented, Domain::bint(num_segments))?,
        step,
    )
}
