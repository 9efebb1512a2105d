//! Collapsing mixtures of point masses to their first moment.

use std::collections::BTreeSet;

use ff_core::{Dtype, Op, Term, TermError, TermKind, TermTag, with_interpretation};

use crate::dispatch::{Dispatched, OpPattern, Pattern};

pub(crate) fn register(moment_matching: &Dispatched) {
    moment_matching.register(
        Pattern::new(TermTag::Contraction).op(OpPattern::Exactly(Op::Add)),
        moment_matching_contraction,
    );
}

/// `logsumexp_vars(logits + Delta(x, point, ld))` over bounded `vars`
/// becomes `Delta(x, mean, total)`, where `total` is the log mass of the
/// mixture and `mean` its weighted average point.
fn moment_matching_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op: Op::LogAddExp,
        bin_op: Op::Add,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    let [a, b] = terms.as_slice() else {
        return Ok(None);
    };
    let (logits, delta) = match (a.tag(), b.tag()) {
        (TermTag::Tensor, TermTag::Delta) => (a, b),
        (TermTag::Delta, TermTag::Tensor) => (b, a),
        _ => return Ok(None),
    };
    let TermKind::Delta {
        name,
        point,
        log_density,
    } = delta.kind()
    else {
        return Ok(None);
    };
    if reduced_vars.contains(name)
        || point.tag() != TermTag::Tensor
        || point.output().dtype() != Dtype::Real
        || !log_density.is_ground()
    {
        return Ok(None);
    }
    let bounded = reduced_vars.iter().all(|var| {
        logits
            .inputs()
            .get(var)
            .or_else(|| log_density.inputs().get(var))
            .is_some_and(|domain| domain.size().is_some())
    });
    if !bounded {
        return Ok(None);
    }

    with_interpretation(crate::eager(), || {
        let joint = logits.add(log_density)?;
        let total = joint.reduce(Op::LogAddExp, reduced_vars.iter())?;
        let finite = match total.as_tensor() {
            Some((data, _, _)) => data.elements().iter().all(|v| v.is_finite()),
            None => total.item().is_some_and(f64::is_finite),
        };
        if !finite {
            tracing::warn!(
                delta = name.as_str(),
                "mixture has zero mass, falling back to exact evaluation"
            );
            return Ok(None);
        }
        let weights = joint.sub(&total)?.exp()?;
        let point_vars: BTreeSet<&String> = reduced_vars
            .iter()
            .filter(|var| point.inputs().contains(var) || weights.inputs().contains(var))
            .collect();
        let mean = weights.mul(point)?.reduce(Op::Add, point_vars)?;
        Term::delta(name.clone(), &mean, &total).map(Some)
    })
}
