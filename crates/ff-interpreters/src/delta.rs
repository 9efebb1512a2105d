//! Point masses: substitution, integration and `solve`.

use std::collections::BTreeSet;

use ff_core::{Domain, Dtype, Op, Term, TermError, TermKind, TermTag};

use crate::dispatch::{ArgPattern, Dispatched, OpPattern, Pattern};

pub(crate) fn register_subs(table: &Dispatched) {
    table.register(
        Pattern::new(TermTag::Subs).args(&[ArgPattern::Is(TermTag::Delta)]),
        subs_delta,
    );
}

pub(crate) fn register(eager: &Dispatched) {
    use ArgPattern::{Any, Is};
    eager.register(
        Pattern::new(TermTag::Binary)
            .op(OpPattern::Exactly(Op::Add))
            .args(&[Is(TermTag::Delta), Any]),
        add_delta,
    );
    eager.register(
        Pattern::new(TermTag::Binary)
            .op(OpPattern::Exactly(Op::Add))
            .args(&[Any, Is(TermTag::Delta)]),
        add_delta,
    );
    eager.register(
        Pattern::new(TermTag::Binary)
            .op(OpPattern::Exactly(Op::Sub))
            .args(&[Is(TermTag::Delta), Any]),
        add_delta,
    );
    eager.register(
        Pattern::new(TermTag::Reduce)
            .op(OpPattern::Exactly(Op::LogAddExp))
            .args(&[Is(TermTag::Delta)]),
        reduce_delta,
    );
}

fn has_real_input(term: &Term) -> bool {
    term.inputs().iter().any(|(_, domain)| domain.is_real())
}

fn subs_delta(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Subs { arg, subs } = kind else {
        return Ok(None);
    };
    let TermKind::Delta {
        name,
        point,
        log_density,
    } = arg.kind()
    else {
        return Ok(None);
    };
    let mut value = None;
    let mut index_part = Vec::new();
    for (key, v) in subs {
        if key == name {
            value = Some(v.clone());
        } else {
            index_part.push((key.clone(), v.clone()));
        }
    }

    if !index_part.is_empty() {
        let point = point.subs(index_part.iter().cloned())?;
        let log_density = log_density.subs(index_part)?;
        let result = Term::delta(name.clone(), &point, &log_density)?;
        return match value {
            Some(value) => result.subs([(name.clone(), value)]).map(Some),
            None => Ok(Some(result)),
        };
    }
    let Some(value) = value else {
        return Ok(Some(arg.clone()));
    };

    if let Some((renamed, _)) = value.as_variable() {
        return Term::delta(renamed, point, log_density).map(Some);
    }
    if !has_real_input(&value) && !has_real_input(point) {
        let hit = Term::binary(Op::Eq, &value, point)?.apply(Op::And)?.log()?;
        return hit.add(log_density).map(Some);
    }
    match solve(&value, point)? {
        Some((solved, solved_point, jacobian)) => {
            let log_density = jacobian.add(log_density)?;
            Term::delta(solved, &solved_point, &log_density).map(Some)
        }
        None => {
            tracing::trace!(delta = name.as_str(), "no inverse, substituting lazily");
            Ok(None)
        }
    }
}

/// `Delta(x, p) + f` is `Delta(x, p) + f(x = p)`.
fn add_delta(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let (delta, other, delta_first) = match (lhs.kind(), rhs.kind()) {
        (TermKind::Delta { .. }, _) => (lhs, rhs, true),
        (_, TermKind::Delta { .. }) if *op == Op::Add => (rhs, lhs, false),
        _ => return Ok(None),
    };
    let TermKind::Delta { name, point, .. } = delta.kind() else {
        return Ok(None);
    };
    if !other.inputs().contains(name) {
        return Ok(None);
    }
    let other = other.subs([(name.clone(), point.clone())])?;
    if delta_first {
        Term::binary(*op, delta, &other).map(Some)
    } else {
        Term::binary(*op, &other, delta).map(Some)
    }
}

/// `log(size)` for each bounded name in `lost`; `None` if one is real.
fn counting_mass(lost: &BTreeSet<String>, domains: &[(String, Domain)]) -> Option<Vec<f64>> {
    lost.iter()
        .map(|var| {
            domains
                .iter()
                .find(|(name, _)| name == var)
                .and_then(|(_, domain)| domain.size())
                .map(|size| (size as f64).ln())
        })
        .collect()
}

fn reduce_delta(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        arg, reduced_vars, ..
    } = kind
    else {
        return Ok(None);
    };
    let TermKind::Delta {
        name, log_density, ..
    } = arg.kind()
    else {
        return Ok(None);
    };
    if !reduced_vars.contains(name) {
        return Ok(None);
    }
    integrate(log_density.clone(), Vec::new(), name, reduced_vars, arg).map(Some)
}

/// Sums the point mass over its own name: `others` no longer mention `name`,
/// and reduced names that only the point used count once per value.
fn integrate(
    log_density: Term,
    mut others: Vec<Term>,
    name: &str,
    reduced_vars: &BTreeSet<String>,
    delta: &Term,
) -> Result<Term, TermError> {
    others.push(log_density);
    let mut remaining: BTreeSet<String> = reduced_vars.clone();
    remaining.remove(name);
    let live: BTreeSet<String> = others
        .iter()
        .flat_map(|term| term.inputs().names().map(str::to_owned).collect::<Vec<_>>())
        .collect();
    let lost: BTreeSet<String> = remaining.difference(&live).cloned().collect();
    let domains: Vec<(String, Domain)> = delta
        .inputs()
        .iter()
        .map(|(n, d)| (n.to_owned(), d.clone()))
        .collect();
    let Some(mass) = counting_mass(&lost, &domains) else {
        return Err(TermError::Unsupported {
            detail: format!("cannot integrate {name} over real inputs of its point"),
        });
    };
    for log_count in mass {
        others.push(Term::number(log_count)?);
    }
    remaining.retain(|var| live.contains(var));
    let red_op = if remaining.is_empty() {
        Op::Null
    } else {
        Op::LogAddExp
    };
    Term::contraction(red_op, Op::Add, remaining, others)
}

/// Integrates or propagates point masses inside a log-space product.
pub(crate) fn contract_deltas(
    red_op: Op,
    bin_op: Op,
    reduced_vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>, TermError> {
    if bin_op != Op::Add || !(red_op == Op::LogAddExp || reduced_vars.is_empty()) {
        return Ok(None);
    }
    for (pos, delta) in terms.iter().enumerate() {
        let TermKind::Delta {
            name,
            point,
            log_density,
        } = delta.kind()
        else {
            continue;
        };
        let integrated = reduced_vars.contains(name);
        let shared = terms
            .iter()
            .enumerate()
            .any(|(other, term)| other != pos && term.inputs().contains(name));
        if !integrated && !shared {
            continue;
        }
        let mut others = Vec::with_capacity(terms.len());
        for (other, term) in terms.iter().enumerate() {
            if other != pos {
                others.push(term.subs([(name.clone(), point.clone())])?);
            }
        }
        if integrated {
            return integrate(log_density.clone(), others, name, reduced_vars, delta).map(Some);
        }
        others.push(delta.clone());
        return Term::contraction(red_op, bin_op, reduced_vars.clone(), others).map(Some);
    }
    Ok(None)
}

/// Solves `expr == value` for the single free variable of `expr`.
///
/// Returns the variable's name, its solution, and the log-abs-det-Jacobian
/// to add to a density transported through the substitution. `None` means
/// no inverse is known, and the caller keeps the substitution lazy.
pub fn solve(expr: &Term, value: &Term) -> Result<Option<(String, Term, Term)>, TermError> {
    match expr.kind() {
        TermKind::Variable { name, .. } => {
            Ok(Some((name.clone(), value.clone(), Term::number(0.0)?)))
        }
        TermKind::Unary { op, arg } => {
            let (x, jacobian) = match op {
                Op::Exp => {
                    let x = value.log()?;
                    (x.clone(), x)
                }
                Op::Log => {
                    let x = value.exp()?;
                    (x, value.neg()?)
                }
                Op::Neg => (value.neg()?, Term::number(0.0)?),
                _ => return Ok(None),
            };
            let Some((name, point, log_density)) = solve(arg, &x)? else {
                return Ok(None);
            };
            Ok(Some((name, point, log_density.add(&jacobian)?)))
        }
        TermKind::Binary { op, lhs, rhs } => {
            let (arg, constant) = match (has_free_real(lhs), has_free_real(rhs)) {
                (true, false) => (lhs.clone(), rhs.clone()),
                (false, true) => (rhs.clone(), lhs.clone()),
                _ => return Ok(None),
            };
            solve_affine(*op, &arg, &constant, value)
        }
        TermKind::Contraction {
            bin_op,
            reduced_vars,
            terms,
            ..
        } if reduced_vars.is_empty() => {
            let (free, constants): (Vec<Term>, Vec<Term>) =
                terms.iter().cloned().partition(has_free_real);
            let [arg] = free.as_slice() else {
                return Ok(None);
            };
            let constant = Term::fold(*bin_op, &constants)?;
            solve_affine(*bin_op, arg, &constant, value)
        }
        _ => Ok(None),
    }
}

/// Solves `arg op constant == value` for `op` in `{add, mul}`.
fn solve_affine(
    op: Op,
    arg: &Term,
    constant: &Term,
    value: &Term,
) -> Result<Option<(String, Term, Term)>, TermError> {
    let jacobian = match op {
        Op::Add => Term::number(0.0)?,
        Op::Mul => constant.abs()?.log()?,
        _ => return Ok(None),
    };
    let Some(inverse) = op.binary_inverse() else {
        return Ok(None);
    };
    let x = Term::binary(inverse, value, constant)?;
    let Some((name, point, log_density)) = solve(arg, &x)? else {
        return Ok(None);
    };
    Ok(Some((name, point, log_density.add(&jacobian)?)))
}

fn has_free_real(term: &Term) -> bool {
    term.output().dtype() == Dtype::Real && has_real_input(term)
}
