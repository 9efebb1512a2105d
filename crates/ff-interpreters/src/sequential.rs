//! Looped reductions for terms with no vectorized rule.

use std::collections::BTreeSet;

use ff_core::{Inputs, Op, Term, TermError, TermKind, TermTag};

use crate::dispatch::{Dispatched, OpPattern, Pattern};

pub(crate) fn register(sequential: &Dispatched) {
    sequential.register(
        Pattern::new(TermTag::Reduce).op(OpPattern::Associative),
        sequential_reduce,
    );
    sequential.register(Pattern::new(TermTag::Contraction), sequential_contraction);
}

fn sequential_reduce(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    if arg.is_ground() {
        return Ok(None);
    }
    enumerate(*op, reduced_vars, arg.inputs(), |subs| {
        arg.subs(subs.iter().cloned())
    })
}

fn sequential_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op,
        bin_op,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    if *red_op == Op::Null || terms.iter().all(Term::is_ground) {
        return Ok(None);
    }
    let mut joint = Inputs::new();
    for term in terms {
        joint.merge(term.inputs())?;
    }
    enumerate(*red_op, reduced_vars, &joint, |subs| {
        let parts = terms
            .iter()
            .map(|term| term.subs(subs.iter().cloned()))
            .collect::<Result<Vec<_>, _>>()?;
        Term::fold(*bin_op, &parts)
    })
}

/// Folds `body` with `op` over every value of the bounded scalar names in
/// `reduced_vars`. Other reduced names stay as a lazy reduction.
fn enumerate(
    op: Op,
    reduced_vars: &BTreeSet<String>,
    inputs: &Inputs,
    mut body: impl FnMut(&[(String, Term)]) -> Result<Term, TermError>,
) -> Result<Option<Term>, TermError> {
    let mut looped = Vec::new();
    let mut lazy = Vec::new();
    for var in reduced_vars {
        let size = inputs
            .get(var)
            .filter(|domain| domain.shape().is_empty())
            .and_then(|domain| domain.size());
        match size {
            Some(size) => looped.push((var.clone(), size)),
            None => lazy.push(var.clone()),
        }
    }
    if looped.is_empty() {
        return Ok(None);
    }
    if looped.iter().any(|(_, size)| *size == 0) {
        return Term::unit(op).map(Some);
    }
    tracing::trace!(
        vars = looped.len(),
        lazy = lazy.len(),
        "reducing by enumeration"
    );

    let mut index = vec![0_usize; looped.len()];
    let mut result: Option<Term> = None;
    loop {
        let subs = looped
            .iter()
            .zip(&index)
            .map(|((name, size), &value)| Ok((name.clone(), Term::int(value, *size)?)))
            .collect::<Result<Vec<_>, TermError>>()?;
        let value = body(&subs)?;
        result = Some(match result {
            None => value,
            Some(acc) => acc.combine(op, &value)?,
        });

        // Odometer over the looped names, last name fastest.
        let mut pos = looped.len();
        loop {
            if pos == 0 {
                let Some(result) = result else {
                    return Ok(None);
                };
                return result.reduce(op, lazy).map(Some);
            }
            pos -= 1;
            index[pos] += 1;
            if index[pos] < looped[pos].1 {
                break;
            }
            index[pos] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{eager, sequential};
    use ff_core::{Domain, Op, Term, TermTag, with_interpretation};

    #[test]
    fn looped_reduction_evaluates_what_eager_leaves_lazy() {
        let i = Term::variable("i", Domain::bint(3)).expect("variable");
        let x = Term::variable("x", Domain::real()).expect("variable");
        let build = || i.add(&x).and_then(|t| t.exp()).and_then(|t| t.reduce(Op::Add, ["i"]));

        let lazy = with_interpretation(eager(), build).expect("eager build");
        assert!(lazy.inputs().contains("x"));
        assert_ne!(lazy.tag(), TermTag::Number);

        let looped = with_interpretation(sequential(), build).expect("sequential build");
        let at_zero = with_interpretation(eager(), || {
            looped.subs([("x", Term::number(0.0)?)])
        })
        .expect("substitute x");
        let expected: f64 = (0..3).map(|k| f64::from(k).exp()).sum();
        let got = at_zero.item().expect("closed scalar");
        assert!((got - expected).abs() < 1e-9, "{got} vs {expected}");
    }

    #[test]
    fn real_reduced_names_stay_lazy() {
        let i = Term::variable("i", Domain::bint(2)).expect("variable");
        let x = Term::variable("x", Domain::real()).expect("variable");
        let reduced = with_interpretation(sequential(), || {
            i.mul(&x).and_then(|t| t.reduce(Op::Add, ["i", "x"]))
        })
        .expect("sequential build");
        assert!(reduced.inputs().is_empty());
        assert_ne!(reduced.tag(), TermTag::Number);
    }
}
