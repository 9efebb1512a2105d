//! Greedy pairwise contraction order for n-ary contractions.
//!
//! A [`TermKind::Contraction`] of three or more factors is rewritten into a
//! tree of binary contractions. Each step joins the pair whose result is
//! smallest relative to its operands, and a reduced name is summed out as
//! soon as no remaining operand mentions it.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use ff_core::{Domain, Op, Term, TermError, TermKind, TermTag, with_interpretation};

use crate::dispatch::{Dispatched, Pattern};
use crate::reinterpret::reinterpret;

/// Size given to a real-valued dimension by the path heuristic.
pub const REAL_SIZE: usize = 3;

pub(crate) fn register(optimize: &Dispatched) {
    optimize.register(Pattern::new(TermTag::Contraction), optimize_contraction);
}

/// Rebuilds `term` with every n-ary contraction reordered, falling back to
/// the active interpretation for everything else.
pub fn apply_optimizer(term: &Term) -> Result<Term, TermError> {
    let base: Rc<dyn ff_core::Interpretation> = crate::optimize_rules();
    with_interpretation(base, || reinterpret(term))
}

fn dim_size(domain: &Domain) -> u128 {
    match domain.size() {
        Some(size) => size as u128,
        None => (REAL_SIZE * domain.num_elements()) as u128,
    }
}

fn set_size(dims: &BTreeSet<String>, sizes: &BTreeMap<String, u128>) -> u128 {
    dims.iter()
        .map(|dim| sizes.get(dim).copied().unwrap_or(1))
        .product()
}

/// Greedy contraction path over `inputs`. Each entry indexes the operand
/// list as it stands when the step runs; the joined operand is appended.
pub fn greedy_path(
    inputs: &[BTreeSet<String>],
    output: &BTreeSet<String>,
    sizes: &BTreeMap<String, u128>,
) -> Vec<(usize, usize)> {
    let mut operands: Vec<BTreeSet<String>> = inputs.to_vec();
    let mut path = Vec::with_capacity(inputs.len().saturating_sub(1));
    while operands.len() > 1 {
        let mut best: Option<(bool, i128, usize, usize, BTreeSet<String>)> = None;
        for a in 0..operands.len() {
            for b in a + 1..operands.len() {
                let shares = !operands[a].is_disjoint(&operands[b]);
                let keep: BTreeSet<String> = operands
                    .iter()
                    .enumerate()
                    .filter(|(pos, _)| *pos != a && *pos != b)
                    .flat_map(|(_, dims)| dims.iter().cloned())
                    .chain(output.iter().cloned())
                    .collect();
                let joined: BTreeSet<String> = operands[a]
                    .union(&operands[b])
                    .filter(|dim| keep.contains(*dim))
                    .cloned()
                    .collect();
                let cost = set_size(&joined, sizes) as i128
                    - set_size(&operands[a], sizes) as i128
                    - set_size(&operands[b], sizes) as i128;
                let better = match &best {
                    None => true,
                    Some((best_shares, best_cost, ..)) => {
                        (shares && !best_shares) || (shares == *best_shares && cost < *best_cost)
                    }
                };
                if better {
                    best = Some((shares, cost, a, b, joined));
                }
            }
        }
        let Some((_, _, a, b, joined)) = best else {
            break;
        };
        operands.remove(b);
        operands.remove(a);
        operands.push(joined);
        path.push((a, b));
    }
    path
}

fn optimize_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op,
        bin_op,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    if terms.len() < 3
        || *red_op == Op::Null
        || *bin_op == Op::Null
        || !red_op.distributes_over(*bin_op)
    {
        return Ok(None);
    }

    let inputs: Vec<BTreeSet<String>> = terms.iter().map(|t| t.inputs().name_set()).collect();
    let mut sizes = BTreeMap::new();
    for term in terms {
        for (name, domain) in term.inputs().iter() {
            sizes.insert(name.to_owned(), dim_size(domain));
        }
    }
    let all: BTreeSet<String> = inputs.iter().flatten().cloned().collect();
    let output: BTreeSet<String> = all.difference(reduced_vars).cloned().collect();
    let path = greedy_path(&inputs, &output, &sizes);
    tracing::debug!(
        factors = terms.len(),
        steps = path.len(),
        "contraction path chosen"
    );

    // Only reduce a name once every operand that mentions it has been joined.
    let mut counter: BTreeMap<String, usize> = BTreeMap::new();
    for dims in &inputs {
        for dim in dims {
            *counter.entry(dim.clone()).or_default() += 1;
        }
    }
    let mut operands: Vec<Term> = terms.clone();
    let mut last = None;
    for (a, b) in path {
        let tb = operands.remove(b);
        let ta = operands.remove(a);
        let both: BTreeSet<String> = ta
            .inputs()
            .name_set()
            .union(&tb.inputs().name_set())
            .cloned()
            .collect();
        for term in [&ta, &tb] {
            for dim in term.inputs().names().filter(|d| reduced_vars.contains(*d)) {
                if let Some(count) = counter.get_mut(dim) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        let finished: BTreeSet<String> = both
            .iter()
            .filter(|dim| reduced_vars.contains(*dim) && counter.get(*dim) == Some(&0))
            .cloned()
            .collect();
        for dim in both.iter().filter(|d| reduced_vars.contains(*d) && !finished.contains(*d)) {
            *counter.entry(dim.clone()).or_default() += 1;
        }
        let red = if finished.is_empty() { Op::Null } else { *red_op };
        let joined = Term::contraction(red, *bin_op, finished, vec![ta, tb])?;
        operands.push(joined.clone());
        last = Some(joined);
    }
    let Some(mut result) = last else {
        return Ok(None);
    };
    let leftover: Vec<String> = counter
        .into_iter()
        .filter(|(dim, count)| *count > 0 && reduced_vars.contains(dim))
        .map(|(dim, _)| dim)
        .filter(|dim| result.inputs().contains(dim))
        .collect();
    if !leftover.is_empty() {
        result = result.reduce(*red_op, leftover)?;
    }
    Ok(Some(result))
}
