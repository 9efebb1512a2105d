//! Prefix and suffix products of a Markov chain at every time step.
//!
//! For a chain `trans[0], ..., trans[T-1]` joined on `prev -> curr`, the
//! forward terms are `alpha[t] = trans[0] ... trans[t]` and the backward terms
//! are `beta[t] = trans[t] ... trans[T-1]`, both stacked along `time`.

use ff_core::{Inputs, Op, Term, TermKind};
use ff_lax::NamedArray;

use crate::scan::{Drops, contraction_identity, duration_of, sliced, time_dim};
use crate::{Step, SumProductError};

fn named(term: &Term) -> Result<Option<NamedArray>, SumProductError> {
    let Some((data, inputs, _)) = term.as_tensor() else {
        return Ok(None);
    };
    Ok(Some(NamedArray::new(
        data.clone(),
        inputs.names().map(str::to_owned).collect(),
    )?))
}

/// Writes the tensor `src` into the tensor `dest` at the positions of the
/// `Slice` term `slice` along `name`. Only ground tensors are supported.
pub fn scatter(src: &Term, dest: &Term, name: &str, slice: &Term) -> Result<Term, SumProductError> {
    let TermKind::Slice {
        start, stop, step, ..
    } = slice.kind()
    else {
        return Err(SumProductError::InvalidArgument {
            detail: format!("scatter positions must be a slice, got {}", slice.tag().as_str()),
        });
    };
    let positions: Vec<usize> = (*start..*stop).step_by((*step).max(1)).collect();
    let (Some(dst), Some(values)) = (named(dest)?, named(src)?) else {
        return Err(SumProductError::InvalidArgument {
            detail: format!(
                "scatter needs tensors, got {} into {}",
                src.tag().as_str(),
                dest.tag().as_str()
            ),
        });
    };
    let out = ff_lax::scatter(&dst, &values, name, &positions)?;
    let inputs = Inputs::from_pairs(
        out.names()
            .iter()
            .cloned()
            .zip(out.batch_shape().iter().map(|size| ff_core::Domain::bint(*size))),
    )?;
    Ok(Term::tensor_with_dtype(
        out.into_data(),
        inputs,
        dest.output().dtype(),
    )?)
}

/// Forward and backward terms by an up-sweep and down-sweep over the same
/// tree as [`crate::sequential_sum_product`].
///
/// Needs `eager`: the down-sweep scatters tensors into place.
pub fn forward_backward_terms(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
) -> Result<(Term, Term), SumProductError> {
    let (time, mut duration) = time_dim(trans, time)?;
    if duration == 0 {
        return Err(SumProductError::InvalidArgument {
            detail: format!("chain {time} has no steps"),
        });
    }
    let drops = Drops::new(step);
    let join = |x: &Term, y: &Term| -> Result<Term, SumProductError> {
        let x = x.rename(drops.curr.iter().cloned())?;
        let y = y.rename(drops.prev.iter().cloned())?;
        Ok(Term::contraction(
            sum_op,
            prod_op,
            drops.names.clone(),
            vec![x, y],
        )?)
    };

    // Up-sweep, keeping every level.
    let mut levels = Vec::new();
    let mut level = trans.clone();
    while duration > 1 {
        let even = duration / 2 * 2;
        let x = sliced(&level, &time, 0, even, 2, duration)?;
        let y = sliced(&level, &time, 1, even, 2, duration)?;
        let mut contracted = join(&x, &y)?;
        if duration > even {
            let extra = sliced(&level, &time, duration - 1, duration, 1, duration)?;
            contracted = Term::cat(time.as_str(), vec![contracted, extra], time.as_str())?;
        }
        levels.push(level);
        level = contracted;
        duration = duration.div_ceil(2);
    }

    // Down-sweep: `left[t]` is the product before step t, `right[t]` the
    // product after it.
    let mut left = contraction_identity(&level, step)?;
    let mut right = left.clone();
    let mut sum_term = level;
    while let Some(below) = levels.pop() {
        sum_term = below;
        let duration = duration_of(&sum_term, &time)?;
        let even = duration / 2 * 2;
        let half = even / 2;
        let parent = duration.div_ceil(2);
        let mut new_left = contraction_identity(&sum_term, step)?;
        let mut new_right = new_left.clone();

        if duration > even {
            let last = Term::slice(time.as_str(), duration - 1, duration, 1, duration)?;
            let extra = sliced(&left, &time, half, half + 1, 1, parent)?;
            left = sliced(&left, &time, 0, half, 1, parent)?;
            new_left = scatter(&extra, &new_left, &time, &last)?;
            let extra = sliced(&right, &time, half, half + 1, 1, parent)?;
            right = sliced(&right, &time, 0, half, 1, parent)?;
            new_right = scatter(&extra, &new_right, &time, &last)?;
        }
        let evens = Term::slice(time.as_str(), 0, even, 2, duration)?;
        let odds = Term::slice(time.as_str(), 1, even, 2, duration)?;

        let even_steps = sliced(&sum_term, &time, 0, even, 2, duration)?;
        let left_and_step = join(&left, &even_steps)?;
        new_left = scatter(&left, &new_left, &time, &evens)?;
        left = scatter(&left_and_step, &new_left, &time, &odds)?;

        let odd_steps = sliced(&sum_term, &time, 1, even, 2, duration)?;
        let step_and_right = join(&odd_steps, &right)?;
        new_right = scatter(&right, &new_right, &time, &odds)?;
        right = scatter(&step_and_right, &new_right, &time, &evens)?;
        tracing::debug!(time = time.as_str(), duration, "down-sweep level");
    }

    let alphas = join(&left, &sum_term)?;
    let betas = join(&sum_term, &right)?;
    Ok((alphas, betas))
}

/// Forward terms by a left-to-right fold.
pub fn naive_forward_terms(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
) -> Result<Term, SumProductError> {
    let (time, duration) = time_dim(trans, time)?;
    let drops = Drops::new(step);
    let mut alphas: Vec<Term> = Vec::with_capacity(duration);
    for t in 0..duration {
        let factor = trans.at(&time, t)?;
        let alpha = match alphas.last() {
            Some(prefix) => drops.join(sum_op, prod_op, prefix, &factor)?,
            None => factor,
        };
        alphas.push(alpha);
    }
    Ok(Term::stack(time, alphas)?)
}

/// Backward terms by a right-to-left fold.
pub fn naive_backward_terms(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &Term,
    step: &Step,
) -> Result<Term, SumProductError> {
    let (time, duration) = time_dim(trans, time)?;
    let drops = Drops::new(step);
    let mut betas: Vec<Term> = Vec::with_capacity(duration);
    for t in (0..duration).rev() {
        let factor = trans.at(&time, t)?;
        let beta = match betas.last() {
            Some(suffix) => drops.join(sum_op, prod_op, &factor, suffix)?,
            None => factor,
        };
        betas.push(beta);
    }
    betas.reverse();
    Ok(Term::stack(time, betas)?)
}
