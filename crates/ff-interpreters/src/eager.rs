//! Numeric rules of the eager interpretation.

use std::collections::BTreeSet;

use ff_core::{Dtype, Op, Term, TermError, TermKind, TermTag, find_domain};
use ff_lax::NamedArray;

use crate::dispatch::{ArgPattern, Dispatched, OpPattern, Pattern};
use crate::numeric::{from_named, from_named_or_number, to_named};

pub(crate) fn register(eager: &Dispatched) {
    use ArgPattern::{Any, Ground, Is};
    eager.register(Pattern::new(TermTag::Unary).args(&[Ground]), eager_unary);
    eager.register(Pattern::new(TermTag::Unary).args(&[Is(TermTag::Align)]), unary_strip_align);
    eager.register(
        Pattern::new(TermTag::Binary).args(&[Ground, Ground]),
        eager_binary,
    );
    eager.register(
        Pattern::new(TermTag::Binary).args(&[Is(TermTag::Variable), Ground]),
        eager_binary,
    );
    eager.register(
        Pattern::new(TermTag::Binary).args(&[Ground, Is(TermTag::Variable)]),
        eager_binary,
    );
    eager.register(
        Pattern::new(TermTag::Binary).args(&[Is(TermTag::Align), Any]),
        binary_strip_align,
    );
    eager.register(
        Pattern::new(TermTag::Binary).args(&[Any, Is(TermTag::Align)]),
        binary_strip_align,
    );
    eager.register(
        Pattern::new(TermTag::Reduce)
            .op(OpPattern::Associative)
            .args(&[Ground]),
        eager_reduce,
    );
    eager.register(
        Pattern::new(TermTag::Reduce).args(&[Is(TermTag::Reduce)]),
        fuse_reductions,
    );
    eager.register(
        Pattern::new(TermTag::Reduce).args(&[Is(TermTag::Stack)]),
        reduce_stack,
    );
    eager.register(
        Pattern::new(TermTag::Reduce).args(&[Is(TermTag::Align)]),
        reduce_align,
    );
    eager.register(Pattern::new(TermTag::Contraction), eager_contraction);
    eager.register(Pattern::new(TermTag::Stack), eager_stack);
    eager.register(Pattern::new(TermTag::Cat), eager_cat);
    eager.register(Pattern::new(TermTag::Align).args(&[Ground]), eager_align);
}

fn is_ground(term: &Term) -> bool {
    matches!(term.tag(), TermTag::Number | TermTag::Tensor)
}

fn eager_unary(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Unary { op, arg } = kind else {
        return Ok(None);
    };
    let dtype = find_domain(*op, &[arg.output().clone()])?.dtype();
    if op.is_associative() && arg.output().shape().is_empty() {
        return Ok(Some(arg.clone()));
    }
    let Some(x) = to_named(arg)? else {
        return Ok(None);
    };
    let out = if op.is_associative() {
        ff_lax::reduce_event(*op, &x)?
    } else {
        ff_lax::unary(*op, &x)?
    };
    let term = if arg.tag() == TermTag::Number {
        from_named_or_number(out, dtype)?
    } else {
        from_named(out, dtype)?
    };
    Ok(Some(term))
}

fn unary_strip_align(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Unary { op, arg } = kind else {
        return Ok(None);
    };
    let TermKind::Align { arg: inner, .. } = arg.kind() else {
        return Ok(None);
    };
    Term::unary(*op, inner).map(Some)
}

fn eager_binary(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let (Some(a), Some(b)) = (to_named(lhs)?, to_named(rhs)?) else {
        return Ok(None);
    };
    let dtype = find_domain(*op, &[lhs.output().clone(), rhs.output().clone()])?.dtype();
    let out = ff_lax::binary(*op, &a, &b)?;
    let term = if lhs.tag() == TermTag::Number && rhs.tag() == TermTag::Number {
        from_named_or_number(out, dtype)?
    } else {
        from_named(out, dtype)?
    };
    Ok(Some(term))
}

fn binary_strip_align(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let strip = |term: &Term| match term.kind() {
        TermKind::Align { arg, .. } => arg.clone(),
        _ => term.clone(),
    };
    Term::binary(*op, &strip(lhs), &strip(rhs)).map(Some)
}

fn eager_reduce(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    if *op == Op::Null {
        return Ok(None);
    }
    let Some(x) = to_named(arg)? else {
        return Ok(None);
    };
    let out = ff_lax::reduce_names(*op, &x, reduced_vars)?;
    from_named(out, arg.output().dtype()).map(Some)
}

fn fuse_reductions(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    let TermKind::Reduce {
        op: inner_op,
        arg: inner,
        reduced_vars: inner_vars,
    } = arg.kind()
    else {
        return Ok(None);
    };
    if op != inner_op {
        return Ok(None);
    }
    let vars: BTreeSet<String> = reduced_vars.union(inner_vars).cloned().collect();
    Term::reduction(*op, inner, vars).map(Some)
}

fn reduce_stack(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    let TermKind::Stack { name, parts } = arg.kind() else {
        return Ok(None);
    };
    let mut rest = reduced_vars.clone();
    let over_stack = rest.remove(name);
    // A part constant along a reduced name would need an op-specific power.
    if parts
        .iter()
        .any(|part| rest.iter().any(|var| !part.inputs().contains(var)))
    {
        return Ok(None);
    }
    let reduced = parts
        .iter()
        .map(|part| part.reduce(*op, &rest))
        .collect::<Result<Vec<_>, _>>()?;
    if over_stack {
        Term::fold(*op, &reduced).map(Some)
    } else {
        Term::stack(name.clone(), reduced).map(Some)
    }
}

fn reduce_align(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    let TermKind::Align { arg: inner, .. } = arg.kind() else {
        return Ok(None);
    };
    inner.reduce(*op, reduced_vars).map(Some)
}

/// Folds `terms` with `op` numerically. Every term must be ground.
fn fold_ground(op: Op, terms: &[Term]) -> Result<Option<(NamedArray, Dtype)>, TermError> {
    let Some((first, rest)) = terms.split_first() else {
        return Ok(None);
    };
    let Some(mut acc) = to_named(first)? else {
        return Ok(None);
    };
    let mut output = first.output().clone();
    for term in rest {
        let Some(x) = to_named(term)? else {
            return Ok(None);
        };
        acc = ff_lax::binary(op, &acc, &x)?;
        output = find_domain(op, &[output, term.output().clone()])?;
    }
    Ok(Some((acc, output.dtype())))
}

fn eager_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op,
        bin_op,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    if let Some(term) = crate::delta::contract_deltas(*red_op, *bin_op, reduced_vars, terms)? {
        return Ok(Some(term));
    }
    if terms.len() == 1 && reduced_vars.is_empty() {
        return Ok(terms.first().cloned());
    }

    let (ground, lazy): (Vec<Term>, Vec<Term>) = terms.iter().cloned().partition(is_ground);
    if lazy.is_empty() {
        let Some((mut acc, dtype)) = fold_ground(*bin_op, &ground)? else {
            return Ok(None);
        };
        if !reduced_vars.is_empty() {
            if *red_op == Op::Null {
                return Ok(None);
            }
            acc = ff_lax::reduce_names(*red_op, &acc, reduced_vars)?;
        }
        let closed = ground.iter().all(|term| term.tag() == TermTag::Number);
        let term = if closed {
            from_named_or_number(acc, dtype)?
        } else {
            from_named(acc, dtype)?
        };
        return Ok(Some(term));
    }

    // Fold the ground factors together, summing out names no lazy factor needs.
    if ground.is_empty() {
        return Ok(None);
    }
    let lazy_names: BTreeSet<String> = lazy
        .iter()
        .flat_map(|term| term.inputs().names().map(str::to_owned).collect::<Vec<_>>())
        .collect();
    let distributive = *bin_op == Op::Null || red_op.distributes_over(*bin_op);
    let local: BTreeSet<String> = if distributive {
        reduced_vars
            .iter()
            .filter(|var| !lazy_names.contains(*var))
            .filter(|var| ground.iter().any(|term| term.inputs().contains(var)))
            .cloned()
            .collect()
    } else {
        BTreeSet::new()
    };
    if ground.len() < 2 && local.is_empty() {
        return Ok(None);
    }
    let Some((mut acc, dtype)) = fold_ground(*bin_op, &ground)? else {
        return Ok(None);
    };
    if !local.is_empty() {
        acc = ff_lax::reduce_names(*red_op, &acc, &local)?;
    }
    let mut operands = vec![from_named(acc, dtype)?];
    operands.extend(lazy);
    let remaining: BTreeSet<String> = reduced_vars.difference(&local).cloned().collect();
    let red = if remaining.is_empty() { Op::Null } else { *red_op };
    Term::contraction(red, *bin_op, remaining, operands).map(Some)
}

fn eager_stack(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Stack { name, parts } = kind else {
        return Ok(None);
    };
    if !parts.iter().all(is_ground) {
        return Ok(None);
    }
    let arrays = parts
        .iter()
        .map(to_named)
        .collect::<Result<Option<Vec<_>>, _>>()?;
    let (Some(arrays), Some(first)) = (arrays, parts.first()) else {
        return Ok(None);
    };
    let out = ff_lax::stack(&arrays, name)?;
    from_named(out, first.output().dtype()).map(Some)
}

fn eager_cat(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Cat {
        name,
        parts,
        part_name,
    } = kind
    else {
        return Ok(None);
    };
    if !parts.iter().all(|part| part.tag() == TermTag::Tensor) {
        return Ok(None);
    }
    let arrays = parts
        .iter()
        .map(to_named)
        .collect::<Result<Option<Vec<_>>, _>>()?;
    let (Some(arrays), Some(first)) = (arrays, parts.first()) else {
        return Ok(None);
    };
    let out = ff_lax::concat(&arrays, part_name, name)?;
    from_named(out, first.output().dtype()).map(Some)
}

fn eager_align(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Align { arg, names } = kind else {
        return Ok(None);
    };
    let Some(x) = to_named(arg)? else {
        return Ok(None);
    };
    let mut order = names.clone();
    order.extend(
        arg.inputs()
            .names()
            .filter(|name| !names.iter().any(|n| n == name))
            .map(str::to_owned),
    );
    let out = ff_lax::permute(&x, &order)?;
    from_named(out, arg.output().dtype()).map(Some)
}
