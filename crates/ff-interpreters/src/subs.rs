//! Substitution rules shared by the eager and lazy interpretations.
//!
//! A `Subs` request is pushed through its argument: structural nodes
//! substitute into their children and rebuild, tensors index by integer
//! values, and index-like nodes compose. A value with no rule for the
//! argument at hand stays behind as a lazy `Subs`.

use std::collections::BTreeSet;

use ff_core::{Domain, Dtype, Term, TermError, TermKind, TermTag, construct};
use ff_lax::NamedArray;

use crate::dispatch::{ArgPattern, Dispatched, Pattern};
use crate::numeric::{from_named, is_materializable, to_named};

pub(crate) fn register(table: &Dispatched) {
    let rules: [(TermTag, crate::dispatch::Handler); 12] = [
        (TermTag::Variable, subs_variable),
        (TermTag::Unary, subs_structural),
        (TermTag::Binary, subs_structural),
        (TermTag::Reduce, subs_binder),
        (TermTag::Contraction, subs_binder),
        (TermTag::Subs, subs_nested),
        (TermTag::Tensor, subs_tensor),
        (TermTag::Stack, subs_stack),
        (TermTag::Cat, subs_cat),
        (TermTag::Slice, subs_slice),
        (TermTag::Align, subs_align),
        (TermTag::MarkovProduct, subs_markov_product),
    ];
    for (tag, handler) in rules {
        table.register(
            Pattern::new(TermTag::Subs).args(&[ArgPattern::Is(tag)]),
            handler,
        );
    }
    crate::delta::register_subs(table);
}

fn parts(kind: &TermKind) -> Option<(&Term, &[(String, Term)])> {
    match kind {
        TermKind::Subs { arg, subs } => Some((arg, subs.as_slice())),
        _ => None,
    }
}

fn subs_variable(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let Some((name, _)) = arg.as_variable() else {
        return Ok(None);
    };
    Ok(subs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone()))
}

fn subs_structural(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let kind = arg
        .kind()
        .map_children(|child| child.subs(subs.iter().cloned()))?;
    construct(kind).map(Some)
}

/// Substitution under a binder. Bound names that a substituted value
/// mentions are renamed apart before substituting.
fn subs_binder(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let (bound, children) = match arg.kind() {
        TermKind::Reduce {
            reduced_vars, arg, ..
        } => (reduced_vars, vec![arg]),
        TermKind::Contraction {
            reduced_vars,
            terms,
            ..
        } => (reduced_vars, terms.iter().collect()),
        _ => return Ok(None),
    };
    let free: BTreeSet<String> = subs
        .iter()
        .flat_map(|(_, value)| value.inputs().name_set())
        .collect();
    if bound.is_disjoint(&free) {
        return subs_structural(kind);
    }

    let mut taken: BTreeSet<String> = free.union(bound).cloned().collect();
    for child in &children {
        taken.extend(child.inputs().name_set());
    }
    let mut fresh = Vec::new();
    for name in bound.intersection(&free) {
        let renamed = (1..)
            .map(|k| format!("{name}__{k}"))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or_else(|| format!("{name}__"));
        taken.insert(renamed.clone());
        fresh.push((name.clone(), renamed));
    }
    tracing::trace!(renamed = fresh.len(), "renaming bound variables apart");
    let rebound: BTreeSet<String> = bound
        .iter()
        .map(|name| {
            fresh
                .iter()
                .find(|(old, _)| old == name)
                .map_or_else(|| name.clone(), |(_, new)| new.clone())
        })
        .collect();
    let apart = match arg.kind() {
        TermKind::Reduce { op, arg: inner, .. } => {
            Term::reduction(*op, &inner.rename(fresh.iter().cloned())?, rebound)?
        }
        TermKind::Contraction {
            red_op,
            bin_op,
            terms,
            ..
        } => {
            let terms = terms
                .iter()
                .map(|term| term.rename(fresh.iter().cloned()))
                .collect::<Result<Vec<_>, _>>()?;
            Term::contraction(*red_op, *bin_op, rebound, terms)?
        }
        _ => return Ok(None),
    };
    apart.subs(subs.iter().cloned()).map(Some)
}

/// `Subs(Subs(x, inner), outer)` as one simultaneous substitution into `x`.
fn subs_nested(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, outer)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::Subs {
        arg: base,
        subs: inner,
    } = arg.kind()
    else {
        return Ok(None);
    };
    let mut combined = Vec::with_capacity(inner.len() + outer.len());
    for (name, value) in inner {
        combined.push((name.clone(), value.subs(outer.iter().cloned())?));
    }
    for (name, value) in outer {
        if base.inputs().contains(name) && !inner.iter().any(|(key, _)| key == name) {
            combined.push((name.clone(), value.clone()));
        }
    }
    base.subs(combined).map(Some)
}

fn temp_name(name: &str) -> String {
    format!("__subs_{name}")
}

fn subs_tensor(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let Some((data, inputs, dtype)) = arg.as_tensor() else {
        return Ok(None);
    };
    let (ready, deferred): (Vec<(String, Term)>, Vec<(String, Term)>) = subs
        .iter()
        .cloned()
        .partition(|(_, value)| is_materializable(value));
    if ready.is_empty() {
        return Ok(None);
    }
    // Substituted axes are renamed first so that index values may mention
    // any of the original names.
    let names: Vec<String> = inputs
        .names()
        .map(|name| {
            if ready.iter().any(|(key, _)| key == name) {
                temp_name(name)
            } else {
                name.to_owned()
            }
        })
        .collect();
    let mut x = NamedArray::new(data.clone(), names)?;
    for (name, value) in &ready {
        let Some(index) = to_named(value)? else {
            return Ok(None);
        };
        x = ff_lax::gather(&x, &temp_name(name), &index)?;
    }
    let indexed = from_named(x, dtype)?;
    if deferred.is_empty() {
        Ok(Some(indexed))
    } else {
        indexed.subs(deferred).map(Some)
    }
}

/// Splits the binding of `name` from the rest.
fn split_binding(subs: &[(String, Term)], name: &str) -> (Option<Term>, Vec<(String, Term)>) {
    let mut index = None;
    let mut rest = Vec::new();
    for (key, value) in subs {
        if key == name {
            index = Some(value.clone());
        } else {
            rest.push((key.clone(), value.clone()));
        }
    }
    (index, rest)
}

fn subs_stack(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::Stack { name, parts } = arg.kind() else {
        return Ok(None);
    };
    let (index, rest) = split_binding(subs, name);
    if index.as_ref().is_some_and(|value| !is_index_rule(value)) && rest.is_empty() {
        return Ok(None);
    }
    let parts = parts
        .iter()
        .map(|part| part.subs(rest.iter().cloned()))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(value) = index else {
        return Term::stack(name.clone(), parts).map(Some);
    };
    match value.kind() {
        TermKind::Number { value: k, .. } => parts
            .get(*k as usize)
            .cloned()
            .map(Some)
            .ok_or_else(|| TermError::Unsupported {
                detail: format!("index {k} out of range for stack over {name}"),
            }),
        TermKind::Variable { name: renamed, .. } => Term::stack(renamed.clone(), parts).map(Some),
        _ => Term::stack(name.clone(), parts)?
            .subs([(name.clone(), value)])
            .map(Some),
    }
}

/// Index values that structural index rules resolve directly.
fn is_index_rule(value: &Term) -> bool {
    matches!(value.tag(), TermTag::Number | TermTag::Variable)
}

fn subs_cat(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::Cat {
        name,
        parts,
        part_name,
    } = arg.kind()
    else {
        return Ok(None);
    };
    let (index, rest) = split_binding(subs, name);
    if index.as_ref().is_some_and(|value| !is_index_rule(value)) && rest.is_empty() {
        return Ok(None);
    }
    let parts = parts
        .iter()
        .map(|part| part.subs(rest.iter().cloned()))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(value) = index else {
        return Term::cat(name.clone(), parts, part_name.clone()).map(Some);
    };
    match value.kind() {
        TermKind::Number { value: k, .. } => {
            let mut offset = 0_usize;
            let k = *k as usize;
            for part in &parts {
                let size = part
                    .inputs()
                    .get(part_name)
                    .and_then(Domain::size)
                    .unwrap_or(0);
                if k < offset + size {
                    return part.subs([(part_name.clone(), Term::int(k - offset, size)?)]).map(Some);
                }
                offset += size;
            }
            Err(TermError::Unsupported {
                detail: format!("index {k} out of range for cat over {name}"),
            })
        }
        TermKind::Variable { name: renamed, .. } => {
            Term::cat(renamed.clone(), parts, part_name.clone()).map(Some)
        }
        _ => Term::cat(name.clone(), parts, part_name.clone())?
            .subs([(name.clone(), value)])
            .map(Some),
    }
}

fn subs_slice(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::Slice {
        name,
        start,
        step,
        dtype,
        ..
    } = arg.kind()
    else {
        return Ok(None);
    };
    let Some((_, value)) = subs.iter().find(|(key, _)| key == name) else {
        return Ok(None);
    };
    match value.kind() {
        TermKind::Variable { name: renamed, .. } => {
            let TermKind::Slice { stop, .. } = arg.kind() else {
                return Ok(None);
            };
            Term::slice(renamed.clone(), *start, *stop, *step, *dtype).map(Some)
        }
        TermKind::Slice {
            name: inner_name,
            start: inner_start,
            stop: inner_stop,
            step: inner_step,
            ..
        } => {
            // i -> start + (inner_start + i * inner_step) * step
            let count = (inner_stop - inner_start).div_ceil(*inner_step);
            let first = start + inner_start * step;
            let stride = inner_step * step;
            let stop = if count == 0 {
                first
            } else {
                first + (count - 1) * stride + 1
            };
            Term::slice(inner_name.clone(), first, stop, stride, *dtype).map(Some)
        }
        _ => {
            let (Some(range), Some(index)) = (to_named(arg)?, to_named(value)?) else {
                return Ok(None);
            };
            let picked = ff_lax::gather(&range, name, &index)?;
            if picked.names().is_empty() {
                let value = picked.elements().first().copied().unwrap_or_default();
                return construct(TermKind::Number {
                    value,
                    dtype: Dtype::Int(*dtype),
                })
                .map(Some);
            }
            from_named(picked, Dtype::Int(*dtype)).map(Some)
        }
    }
}

fn subs_align(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::Align { arg: inner, names } = arg.kind() else {
        return Ok(None);
    };
    let substituted = inner.subs(subs.iter().cloned())?;
    substituted.align(names).map(Some)
}

/// Renames the outputs of a lazy chain product, or substitutes into the
/// batch inputs of its transition term.
fn subs_markov_product(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let Some((arg, subs)) = parts(kind) else {
        return Ok(None);
    };
    let TermKind::MarkovProduct {
        sum_op,
        prod_op,
        trans,
        time,
        step,
        step_names,
    } = arg.kind()
    else {
        return Ok(None);
    };
    let Some((time_name, _)) = time.as_variable() else {
        return Ok(None);
    };
    let mut renamed = step_names.clone();
    let mut batch = Vec::new();
    for (key, value) in subs {
        match renamed.iter_mut().find(|(_, output)| output == key) {
            Some((_, output)) => match value.as_variable() {
                Some((new_name, _)) => *output = new_name.to_owned(),
                None => return Ok(None),
            },
            None => batch.push((key.clone(), value.clone())),
        }
    }
    let trans = trans.subs(batch)?;
    Term::markov_product_named(*sum_op, *prod_op, &trans, time_name, step, renamed).map(Some)
}

#[cfg(test)]
mod tests {
    use crate::{eager, lazy};
    use ff_core::{DenseArray, Domain, Inputs, Op, Term, TermTag, with_interpretation};
    use ff_test_utils::all_close;

    fn matrix() -> Term {
        let data = DenseArray::new(vec![2, 3], (0..6).map(f64::from).collect())
            .expect("array should build");
        let inputs = Inputs::from_pairs([("i", Domain::bint(2)), ("j", Domain::bint(3))])
            .expect("inputs should build");
        Term::tensor(data, inputs).expect("tensor should build")
    }

    fn elements(term: &Term) -> Vec<f64> {
        term.as_tensor()
            .map(|(data, _, _)| data.elements().to_vec())
            .expect("term should be a tensor")
    }

    #[test]
    fn integer_substitution_indexes_tensors() {
        with_interpretation(lazy(), || {
            let row = matrix().at("i", 1).expect("index i");
            assert_eq!(row.tag(), TermTag::Tensor);
            assert!(all_close(&elements(&row), &[3.0, 4.0, 5.0], 1e-12));
            let entry = row.at("j", 2).expect("index j");
            assert_eq!(entry.item(), Some(5.0));
        });
    }

    #[test]
    fn slices_and_renames_gather_along_axes() {
        with_interpretation(eager(), || {
            let odd = Term::slice("k", 1, 3, 1, 3).expect("slice");
            let picked = matrix().subs([("j", odd)]).expect("slice subs");
            let names: Vec<&str> = picked.inputs().names().collect();
            assert_eq!(names, vec!["i", "k"]);
            assert!(all_close(&elements(&picked), &[1.0, 2.0, 4.0, 5.0], 1e-12));

            let renamed = matrix().rename([("i", "r")]).expect("rename");
            assert!(renamed.inputs().contains("r"));
            assert!(!renamed.inputs().contains("i"));
        });
    }

    #[test]
    fn slice_of_slice_composes() {
        with_interpretation(lazy(), || {
            let outer = Term::slice("a", 1, 9, 2, 10).expect("outer slice");
            let inner = Term::slice("b", 1, 4, 1, 4).expect("inner slice");
            let composed = outer.subs([("a", inner)]).expect("compose");
            let direct = Term::slice("b", 3, 8, 2, 10).expect("direct slice");
            assert!(composed.ptr_eq(&direct));
        });
    }

    #[test]
    fn substitution_distributes_through_lazy_structure() {
        let x = Term::variable("x", Domain::real()).expect("variable");
        let expr = with_interpretation(lazy(), || x.mul(&x).and_then(|xx| xx.exp()))
            .expect("lazy build");
        assert_eq!(expr.tag(), TermTag::Unary);
        let value = with_interpretation(eager(), || expr.subs([("x", Term::number(2.0)?)]))
            .expect("eager subs");
        assert!((value.item().expect("number") - 4.0_f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn stacks_index_and_reduce() {
        with_interpretation(eager(), || {
            let a = Term::variable("a", Domain::real()).expect("variable");
            let b = Term::variable("b", Domain::real()).expect("variable");
            let stacked = Term::stack("k", vec![a.clone(), b.clone()]).expect("stack");
            assert!(stacked.at("k", 1).expect("index").ptr_eq(&b));
            let other = stacked.rename([("k", "m")]).expect("rename");
            assert!(other.inputs().contains("m"));
        });
    }

    #[test]
    fn cat_indexes_the_right_part() {
        let part = |values: Vec<f64>| {
            let n = values.len();
            let data = DenseArray::new(vec![n], values).expect("array");
            let inputs = Inputs::from_pairs([("p", Domain::bint(n))]).expect("inputs");
            Term::tensor(data, inputs).expect("tensor")
        };
        with_interpretation(lazy(), || {
            let joined =
                Term::cat("t", vec![part(vec![1.0, 2.0]), part(vec![3.0, 4.0, 5.0])], "p")
                    .expect("cat");
            assert_eq!(joined.inputs().get("t"), Some(&Domain::bint(5)));
            assert_eq!(joined.at("t", 3).expect("index").item(), Some(4.0));
        });
    }

    #[test]
    fn binders_rename_bound_variables_apart() {
        let x = Term::variable("x", Domain::bint(2)).expect("variable");
        let y = Term::variable("y", Domain::bint(2)).expect("variable");
        with_interpretation(lazy(), || {
            let summed = x
                .add(&y)
                .and_then(|s| s.reduce(Op::Add, ["x"]))
                .expect("lazy reduce");
            let renamed = summed.subs([("y", x.clone())]).expect("subs under binder");
            assert_eq!(renamed.inputs().names().collect::<Vec<_>>(), vec!["x"]);
            let int = summed
                .subs([("y", Term::int(1, 2).expect("int"))])
                .expect("subs under binder");
            assert!(!int.inputs().contains("y"));
        });
        let value = with_interpretation(crate::sequential(), || {
            let summed = with_interpretation(lazy(), || {
                x.add(&y)?.reduce(Op::Add, ["x"])?.subs([("y", x.clone())])
            })?;
            crate::reinterpret(&summed.at("x", 1)?)
        })
        .expect("evaluate");
        // sum over the renamed bound x of (x' + 1)
        assert_eq!(value.item(), Some(3.0));
    }
}
