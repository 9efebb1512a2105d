//! Unrolling plates and Markov chains into plain factor graphs.
//!
//! Unrolling plate `i` of size `n` replaces every factor over `i` by `n`
//! copies indexed at `i = 0 .. n`, renaming each variable local to the plate
//! with an index suffix. A Markov chain `("x_0", "x_prev", "x_curr")` renames
//! `x_prev` to `x_{t}` and `x_curr` to `x_{t+1}` in copy `t`.

use std::collections::{BTreeMap, BTreeSet};

use ff_core::Term;
use tracing::debug;

use crate::{PlateSteps, Step, SumProductError};

/// Factors after [`partial_unroll`].
#[derive(Debug, Clone, PartialEq)]
pub struct Unrolled {
    pub factors: Vec<Term>,
    /// Sum variables after renaming, including every unrolled copy.
    pub sum_vars: BTreeSet<String>,
    /// Plates that were not unrolled, with their chains.
    pub remaining: PlateSteps,
}

fn base_name(var: &str) -> &str {
    var.split('_').next().unwrap_or(var)
}

/// Unrolls the plates of `plate_to_step` named in `eliminate`. Only chains
/// of history one are supported: each must read `(x_0, x_prev, x_curr)` with
/// a shared base name.
pub fn partial_unroll(
    factors: &[Term],
    eliminate: &BTreeSet<String>,
    plate_to_step: &PlateSteps,
) -> Result<Unrolled, SumProductError> {
    let mut steps: BTreeMap<&str, Step> = BTreeMap::new();
    for (plate, chains) in plate_to_step {
        let mut step = Step::new();
        for chain in chains {
            let shared_base = chain.iter().all(|var| base_name(var) == base_name(&chain[0]));
            if chain.len() != 3 || !shared_base || !chain[0].ends_with("_0") {
                return Err(SumProductError::InvalidArgument {
                    detail: format!("cannot unroll chain {chain:?} of plate {plate}"),
                });
            }
            step.insert(chain[1].clone(), chain[2].clone());
        }
        steps.insert(plate.as_str(), step);
    }

    let plates: BTreeSet<String> = plate_to_step.keys().cloned().collect();
    let mut sum_vars: BTreeSet<String> = eliminate.difference(&plates).cloned().collect();
    let remaining: PlateSteps = plate_to_step
        .iter()
        .filter(|(plate, _)| !eliminate.contains(*plate))
        .map(|(plate, chains)| (plate.clone(), chains.clone()))
        .collect();

    let mut var_to_ordinal: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for factor in factors {
        let ordinal: BTreeSet<String> = factor
            .inputs()
            .names()
            .filter(|name| plates.contains(*name))
            .map(str::to_owned)
            .collect();
        for var in factor.inputs().names().filter(|name| !plates.contains(*name)) {
            let shared = match var_to_ordinal.get(var) {
                Some(seen) => seen.intersection(&ordinal).cloned().collect(),
                None => ordinal.clone(),
            };
            var_to_ordinal.insert(var.to_owned(), shared);
        }
    }

    // Markov plates first, deepest first, then plain plates.
    let mut order: Vec<(&str, usize)> = Vec::new();
    for (plate, step) in steps.iter().filter(|(plate, _)| eliminate.contains(**plate)) {
        let mut depth = 0;
        for prev in step.keys() {
            let ordinal = var_to_ordinal.get(prev).ok_or_else(|| SumProductError::InvalidArgument {
                detail: format!("markov variable {prev} of plate {plate} is not a factor input"),
            })?;
            depth = depth.max(ordinal.len());
        }
        order.push((*plate, depth));
    }
    order.sort_by(|a, b| b.1.cmp(&a.1));

    let mut factors = factors.to_vec();
    for (plate, _) in order {
        let step = &steps[plate];
        factors = unroll_plate(&factors, &mut var_to_ordinal, &mut sum_vars, plate, step)?;
    }
    Ok(Unrolled {
        factors,
        sum_vars,
        remaining,
    })
}

fn unroll_plate(
    factors: &[Term],
    var_to_ordinal: &mut BTreeMap<String, BTreeSet<String>>,
    sum_vars: &mut BTreeSet<String>,
    plate: &str,
    step: &Step,
) -> Result<Vec<Term>, SumProductError> {
    let Some(size) = factors
        .iter()
        .find_map(|factor| factor.inputs().get(plate))
        .and_then(|domain| domain.size())
    else {
        return Err(SumProductError::InvalidArgument {
            detail: format!("plate {plate} is not a bounded factor input"),
        });
    };
    let history = usize::from(!step.is_empty());
    let is_prev = |var: &str| step.contains_key(var);
    let is_curr = |var: &str| step.values().any(|curr| curr == var);

    let plate_vars: BTreeSet<String> = var_to_ordinal
        .iter()
        .filter(|(_, ordinal)| ordinal.contains(plate))
        .map(|(var, _)| var.clone())
        .collect();
    if let Some(var) = plate_vars.iter().find(|var| !sum_vars.contains(*var)) {
        return Err(SumProductError::InvalidArgument {
            detail: format!("{var} lives in plate {plate} but is not eliminated"),
        });
    }

    // Name of copy `i` of a plate variable.
    let copy_name = |var: &str, i: usize| -> String {
        if is_prev(var) {
            format!("{}_{i}", base_name(var))
        } else if is_curr(var) {
            format!("{}_{}", base_name(var), i + history)
        } else {
            format!("{var}_{}", i + history)
        }
    };

    for var in &plate_vars {
        sum_vars.remove(var);
        let ordinal = var_to_ordinal.remove(var).unwrap_or_default();
        let outer: BTreeSet<String> = ordinal.into_iter().filter(|p| p != plate).collect();
        for i in 0..size {
            let name = copy_name(var, i);
            sum_vars.insert(name.clone());
            var_to_ordinal.insert(name, outer.clone());
        }
    }

    let mut unrolled = Vec::with_capacity(factors.len());
    for factor in factors {
        if !factor.inputs().contains(plate) {
            unrolled.push(factor.clone());
            continue;
        }
        for i in 0..size {
            let mut bindings = vec![(plate.to_owned(), Term::int(i, size)?)];
            for (var, domain) in factor.inputs().iter() {
                if plate_vars.contains(var) || is_prev(var) || is_curr(var) {
                    let copy = Term::variable(copy_name(var, i), domain.clone())?;
                    bindings.push((var.to_owned(), copy));
                }
            }
            unrolled.push(factor.subs(bindings)?);
        }
    }
    debug!(plate, size, history, factors = unrolled.len(), "unrolled plate");
    Ok(unrolled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{modified_partial_sum_product, sum_product};
    use ff_core::{DenseArray, Domain, Inputs, Op, with_interpretation};
    use ff_interpreters::eager;

    fn factor(names: &[(&str, usize)], seed: usize) -> Term {
        let shape: Vec<usize> = names.iter().map(|(_, size)| *size).collect();
        let count: usize = shape.iter().product();
        let values = (0..count)
            .map(|k| 0.4 + ((k * 5 + seed) % 9) as f64 * 0.15)
            .collect();
        let data = DenseArray::new(shape, values).expect("array");
        let inputs =
            Inputs::from_pairs(names.iter().map(|(name, size)| (*name, Domain::bint(*size))))
                .expect("inputs");
        Term::tensor(data, inputs).expect("tensor")
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn unrolled_plate_matches_plated_elimination() {
        let f = factor(&[("x", 2)], 0);
        let g = factor(&[("i", 3), ("x", 2), ("y", 2)], 1);
        let plates: PlateSteps = [("i".to_owned(), Vec::new())].into();
        let eliminate = names(&["i", "x", "y"]);
        with_interpretation(eager(), || {
            let unrolled =
                partial_unroll(&[f.clone(), g.clone()], &eliminate, &plates).expect("unroll");
            assert_eq!(unrolled.factors.len(), 4);
            assert_eq!(unrolled.sum_vars, names(&["x", "y_0", "y_1", "y_2"]));
            assert!(unrolled.remaining.is_empty());

            let flat = sum_product(
                Op::Add,
                Op::Mul,
                &unrolled.factors,
                &unrolled.sum_vars,
                &BTreeSet::new(),
            )
            .expect("flat");
            let plated = sum_product(Op::Add, Op::Mul, &[f, g], &eliminate, &names(&["i"]))
                .expect("plated");
            assert!((flat.item().expect("value") - plated.item().expect("value")).abs() < 1e-9);
        });
    }

    #[test]
    fn unrolled_chain_matches_markov_elimination() {
        let (init, trans) = with_interpretation(eager(), || {
            (
                factor(&[("x_0", 2)], 2).log().expect("log"),
                factor(&[("time", 3), ("x_prev", 2), ("x_curr", 2)], 3)
                    .log()
                    .expect("log"),
            )
        });
        let steps: PlateSteps = [(
            "time".to_owned(),
            vec![vec!["x_0".to_owned(), "x_prev".to_owned(), "x_curr".to_owned()]],
        )]
        .into();
        let eliminate = names(&["time", "x_0", "x_prev", "x_curr"]);
        with_interpretation(eager(), || {
            let unrolled =
                partial_unroll(&[init.clone(), trans.clone()], &eliminate, &steps).expect("unroll");
            assert_eq!(unrolled.sum_vars, names(&["x_0", "x_1", "x_2", "x_3"]));
            assert!(unrolled.factors[1..].iter().all(|f| !f.inputs().contains("time")));
            let flat = sum_product(
                Op::LogAddExp,
                Op::Add,
                &unrolled.factors,
                &unrolled.sum_vars,
                &BTreeSet::new(),
            )
            .expect("flat");
            let chained = modified_partial_sum_product(
                Op::LogAddExp,
                Op::Add,
                &[init, trans],
                &eliminate,
                &steps,
            )
            .expect("markov");
            assert!((flat.item().expect("value") - chained[0].item().expect("value")).abs() < 1e-9);
        });
    }

    #[test]
    fn plates_outside_eliminate_remain() {
        let g = factor(&[("i", 2), ("j", 3), ("y", 2)], 4);
        let plates: PlateSteps =
            [("i".to_owned(), Vec::new()), ("j".to_owned(), Vec::new())].into();
        let unrolled = partial_unroll(&[g], &names(&["j", "y"]), &plates).expect("unroll");
        assert_eq!(unrolled.factors.len(), 3);
        assert_eq!(unrolled.sum_vars, names(&["y_0", "y_1", "y_2"]));
        assert_eq!(unrolled.remaining.keys().collect::<Vec<_>>(), vec!["i"]);
        for (k, factor) in unrolled.factors.iter().enumerate() {
            assert_eq!(factor.inputs().name_set(), names(&["i", &format!("y_{k}")]));
        }
    }

    #[test]
    fn kept_variables_block_unrolling() {
        let g = factor(&[("j", 3), ("y", 2)], 5);
        let plates: PlateSteps = [("j".to_owned(), Vec::new())].into();
        let err = partial_unroll(&[g], &names(&["j"]), &plates).expect_err("y is not eliminated");
        assert!(matches!(err, SumProductError::InvalidArgument { .. }));
    }

    #[test]
    fn chains_must_share_a_base_name() {
        let steps: PlateSteps = [(
            "time".to_owned(),
            vec![vec!["x_0".to_owned(), "y_prev".to_owned(), "x_curr".to_owned()]],
        )]
        .into();
        let err = partial_unroll(&[], &names(&["time"]), &steps).expect_err("mixed names");
        assert!(matches!(err, SumProductError::InvalidArgument { .. }));
    }
}
