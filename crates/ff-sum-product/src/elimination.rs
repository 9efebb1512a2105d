//! Variable elimination under plates.
//!
//! Factors are grouped by their ordinal, the set of plate names among their
//! inputs. Elimination starts at the deepest ordinal: sum variables local to
//! it are summed out, then the plates that no remaining sum variable needs
//! are product-reduced, and the result moves up to a shallower ordinal.

use std::collections::{BTreeMap, BTreeSet};

use ff_core::{Op, Term};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::forward_backward::forward_backward_terms;
use crate::markov::register_markov_rules;
use crate::scan::{left_pad_right_crop, right_pad_left_crop};
use crate::{PlateSteps, Step, SumProductError, reduce_present};

type Ordinal = BTreeSet<String>;

/// Splits `terms` into connected components, where two terms are connected
/// when they share a name in `sum_vars`. Each component carries the sum
/// variables it touches. Terms keep their relative order.
#[must_use]
pub fn partition(
    terms: &[Term],
    sum_vars: &BTreeSet<String>,
) -> Vec<(Vec<Term>, BTreeSet<String>)> {
    let mut by_dim: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
    for (index, term) in terms.iter().enumerate() {
        for dim in term.inputs().names().filter(|dim| sum_vars.contains(*dim)) {
            by_dim.entry(dim).or_default().push(index);
        }
    }

    let mut visited = vec![false; terms.len()];
    let mut components = Vec::new();
    for seed in 0..terms.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut members = Vec::new();
        let mut dims = BTreeSet::new();
        let mut pending = vec![seed];
        while let Some(index) = pending.pop() {
            members.push(index);
            for dim in terms[index].inputs().names() {
                let Some(neighbours) = by_dim.get(dim) else {
                    continue;
                };
                if !dims.insert(dim.to_owned()) {
                    continue;
                }
                for &other in neighbours {
                    if !visited[other] {
                        visited[other] = true;
                        pending.push(other);
                    }
                }
            }
        }
        members.sort_unstable();
        components.push((members.into_iter().map(|i| terms[i].clone()).collect(), dims));
    }
    components
}

// ── Ordinal bookkeeping ─────────────────────────────────────────────

/// Factors grouped by ordinal, in first-seen order.
#[derive(Default)]
struct Ordinals {
    groups: Vec<(Ordinal, Vec<Term>)>,
}

impl Ordinals {
    fn push(&mut self, ordinal: Ordinal, term: Term) {
        match self.groups.iter_mut().find(|(key, _)| *key == ordinal) {
            Some((_, terms)) => terms.push(term),
            None => self.groups.push((ordinal, vec![term])),
        }
    }

    /// Removes the first group with the most plates.
    fn pop_deepest(&mut self) -> Option<(Ordinal, Vec<Term>)> {
        let deepest = self.groups.iter().map(|(key, _)| key.len()).max()?;
        let index = self.groups.iter().position(|(key, _)| key.len() == deepest)?;
        Some(self.groups.remove(index))
    }
}

fn ordinal_of(term: &Term, plates: &BTreeSet<String>) -> Ordinal {
    term.inputs()
        .names()
        .filter(|name| plates.contains(*name))
        .map(str::to_owned)
        .collect()
}

struct FactorIndex {
    ordinals: Ordinals,
    var_to_ordinal: BTreeMap<String, Ordinal>,
    ordinal_to_vars: BTreeMap<Ordinal, BTreeSet<String>>,
}

impl FactorIndex {
    fn new(factors: &[Term], plates: &BTreeSet<String>, sum_vars: &BTreeSet<String>) -> Self {
        let mut ordinals = Ordinals::default();
        let mut var_to_ordinal: BTreeMap<String, Ordinal> = BTreeMap::new();
        for factor in factors {
            let ordinal = ordinal_of(factor, plates);
            for var in factor.inputs().names().filter(|name| sum_vars.contains(*name)) {
                let shared = match var_to_ordinal.get(var) {
                    Some(seen) => seen.intersection(&ordinal).cloned().collect(),
                    None => ordinal.clone(),
                };
                var_to_ordinal.insert(var.to_owned(), shared);
            }
            ordinals.push(ordinal, factor.clone());
        }
        let mut ordinal_to_vars: BTreeMap<Ordinal, BTreeSet<String>> = BTreeMap::new();
        for (var, ordinal) in &var_to_ordinal {
            ordinal_to_vars
                .entry(ordinal.clone())
                .or_default()
                .insert(var.clone());
        }
        Self {
            ordinals,
            var_to_ordinal,
            ordinal_to_vars,
        }
    }

    fn leaf_vars(&self, leaf: &Ordinal) -> BTreeSet<String> {
        self.ordinal_to_vars.get(leaf).cloned().unwrap_or_default()
    }

    /// Plates still needed by the sum variables of `term`. A variable lives
    /// in the plates shared by every factor it appears in.
    fn plates_needed(&self, term: &Term, sum_vars: &BTreeSet<String>) -> Option<Ordinal> {
        let remaining: Vec<&str> = term
            .inputs()
            .names()
            .filter(|name| sum_vars.contains(*name))
            .collect();
        if remaining.is_empty() {
            return None;
        }
        Some(
            remaining
                .iter()
                .filter_map(|var| self.var_to_ordinal.get(*var))
                .flatten()
                .cloned()
                .collect(),
        )
    }
}

fn intractable(term: &Term, sum_vars: &BTreeSet<String>, leaf: &Ordinal) -> SumProductError {
    let remaining: Vec<&str> = term
        .inputs()
        .names()
        .filter(|name| sum_vars.contains(*name))
        .collect();
    SumProductError::Intractable {
        detail: format!("cannot eliminate {remaining:?} before leaving plates {leaf:?}"),
    }
}

// ── Plated elimination ──────────────────────────────────────────────

/// Eliminates every name of `eliminate` from `factors`. Names in `plates` are
/// product-reduced, the rest are sum-reduced. Returns the factors left once
/// nothing more can be eliminated, one per connected component.
pub fn partial_sum_product(
    sum_op: Op,
    prod_op: Op,
    factors: &[Term],
    eliminate: &BTreeSet<String>,
    plates: &BTreeSet<String>,
) -> Result<Vec<Term>, SumProductError> {
    let sum_vars: BTreeSet<String> = eliminate.difference(plates).cloned().collect();
    let mut index = FactorIndex::new(factors, plates, &sum_vars);
    let mut results = Vec::new();

    while let Some((leaf, leaf_factors)) = index.ordinals.pop_deepest() {
        let leaf_vars = index.leaf_vars(&leaf);
        debug!(plates = ?leaf, factors = leaf_factors.len(), "eliminating ordinal");
        for (group, group_vars) in partition(&leaf_factors, &leaf_vars) {
            let factor = reduce_present(&Term::fold(prod_op, &group)?, sum_op, &group_vars)?;
            match index.plates_needed(&factor, &sum_vars) {
                None => results.push(reduce_present(
                    &factor,
                    prod_op,
                    leaf.intersection(eliminate),
                )?),
                Some(new_plates) => {
                    if new_plates == leaf {
                        return Err(intractable(&factor, &sum_vars, &leaf));
                    }
                    let factor = reduce_present(&factor, prod_op, leaf.difference(&new_plates))?;
                    index.ordinals.push(new_plates, factor);
                }
            }
        }
    }
    Ok(results)
}

/// [`partial_sum_product`] folded into a single term.
pub fn sum_product(
    sum_op: Op,
    prod_op: Op,
    factors: &[Term],
    eliminate: &BTreeSet<String>,
    plates: &BTreeSet<String>,
) -> Result<Term, SumProductError> {
    let mut terms = vec![Term::unit(prod_op)?];
    terms.extend(partial_sum_product(sum_op, prod_op, factors, eliminate, plates)?);
    Ok(Term::fold(prod_op, &terms)?)
}

// ── Markov plates ───────────────────────────────────────────────────

/// Elimination plan shared by the Markov-aware entry points.
struct MarkovPlan {
    plates: BTreeSet<String>,
    sum_vars: BTreeSet<String>,
    prod_vars: BTreeSet<String>,
    markov_sum_vars: BTreeSet<String>,
    markov_prod_vars: BTreeSet<String>,
    /// Markov plates each Markov sum variable steps along.
    markov_sum_to_prod: BTreeMap<String, BTreeSet<String>>,
    steps: BTreeMap<String, Step>,
    prev_to_init: Vec<(String, String)>,
}

impl MarkovPlan {
    fn new(
        eliminate: &BTreeSet<String>,
        plate_to_step: &PlateSteps,
    ) -> Result<Self, SumProductError> {
        let plates: BTreeSet<String> = plate_to_step.keys().cloned().collect();
        let sum_vars: BTreeSet<String> = eliminate.difference(&plates).cloned().collect();
        let mut steps = BTreeMap::new();
        let mut prev_to_init = Vec::new();
        for (plate, chains) in plate_to_step {
            let mut step = Step::new();
            for chain in chains {
                if chain.len() < 3 || chain.len() % 2 == 0 {
                    return Err(SumProductError::InvalidArgument {
                        detail: format!(
                            "markov chain {chain:?} of plate {plate} must list init, prev \
                             and curr names"
                        ),
                    });
                }
                let half = chain.len() / 2;
                let (init, rest) = chain.split_at(half);
                prev_to_init.extend(rest[..half].iter().cloned().zip(init.iter().cloned()));
                step.insert(chain[1].clone(), chain[2].clone());
            }
            steps.insert(plate.clone(), step);
        }

        let markov_sum_vars: BTreeSet<String> = steps
            .values()
            .flat_map(|step| step.iter().flat_map(|(prev, curr)| [prev, curr]))
            .filter(|var| sum_vars.contains(*var))
            .cloned()
            .collect();
        let markov_prod_vars: BTreeSet<String> = steps
            .iter()
            .filter(|(plate, step)| !step.is_empty() && eliminate.contains(*plate))
            .map(|(plate, _)| plate.clone())
            .collect();
        let mut markov_sum_to_prod: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for plate in &markov_prod_vars {
            for (prev, curr) in steps.get(plate).into_iter().flatten() {
                for var in [prev, curr] {
                    markov_sum_to_prod
                        .entry(var.clone())
                        .or_default()
                        .insert(plate.clone());
                }
            }
        }
        Ok(Self {
            prod_vars: eliminate.intersection(&plates).cloned().collect(),
            sum_vars,
            plates,
            markov_sum_vars,
            markov_prod_vars,
            markov_sum_to_prod,
            steps,
            prev_to_init,
        })
    }

    /// The Markov plate the chain variables of `factor` step along.
    fn markov_time(
        &self,
        markov_vars: &BTreeSet<String>,
        factor: &Term,
        index: &FactorIndex,
        leaf: &Ordinal,
    ) -> Result<String, SumProductError> {
        let mut owners = markov_vars
            .iter()
            .map(|var| self.markov_sum_to_prod.get(var).cloned().unwrap_or_default());
        let first = owners.next().unwrap_or_default();
        if owners.any(|other| other != first) || first.len() != 1 {
            return Err(SumProductError::Intractable {
                detail: format!("markov variables {markov_vars:?} step along different plates"),
            });
        }
        let Some(time) = first.into_iter().next() else {
            return Err(SumProductError::Intractable {
                detail: format!("markov variables {markov_vars:?} have no time plate"),
            });
        };
        for var in factor.inputs().names().filter(|name| self.sum_vars.contains(*name)) {
            if let Some(ordinal) = index.var_to_ordinal.get(var) {
                if ordinal.contains(&time) && ordinal.is_subset(leaf) && ordinal != leaf {
                    return Err(SumProductError::Intractable {
                        detail: format!(
                            "{var} is local to a shallower plate of markov plate {time}"
                        ),
                    });
                }
            }
        }
        Ok(time)
    }

    fn chain_step(&self, time: &str, markov_vars: &BTreeSet<String>) -> Vec<(String, String)> {
        self.steps
            .get(time)
            .into_iter()
            .flatten()
            .filter(|(_, curr)| markov_vars.contains(*curr))
            .map(|(prev, curr)| (prev.clone(), curr.clone()))
            .collect()
    }

    /// Collapses the chain of `factor` along `time` and renames the surviving
    /// previous names to their initial names.
    fn eliminate_chain(
        &self,
        sum_op: Op,
        prod_op: Op,
        factor: &Term,
        time: &str,
        markov_vars: &BTreeSet<String>,
    ) -> Result<Term, SumProductError> {
        let step = self.chain_step(time, markov_vars);
        let chain = Term::markov_product(sum_op, prod_op, factor, time, &step)?;
        let chain = reduce_present(&chain, sum_op, step.iter().map(|(_, curr)| curr))?;
        Ok(chain.rename(self.prev_to_init.iter().cloned())?)
    }

    fn drop_markov_plates<'a>(
        &'a self,
        plates: impl Iterator<Item = &'a String>,
    ) -> Vec<&'a String> {
        plates
            .filter(|plate| !self.markov_prod_vars.contains(*plate))
            .collect()
    }
}

/// [`partial_sum_product`] where some plates are Markov chains. A plate with
/// chains in `plate_to_step` is eliminated with a `MarkovProduct` of its
/// factors rather than a plain product.
pub fn modified_partial_sum_product(
    sum_op: Op,
    prod_op: Op,
    factors: &[Term],
    eliminate: &BTreeSet<String>,
    plate_to_step: &PlateSteps,
) -> Result<Vec<Term>, SumProductError> {
    register_markov_rules();
    let plan = MarkovPlan::new(eliminate, plate_to_step)?;
    let mut index = FactorIndex::new(factors, &plan.plates, &plan.sum_vars);
    let mut results = Vec::new();

    while let Some((leaf, leaf_factors)) = index.ordinals.pop_deepest() {
        let reduce_vars: BTreeSet<String> = index
            .leaf_vars(&leaf)
            .union(&plan.markov_prod_vars)
            .cloned()
            .collect();
        debug!(plates = ?leaf, factors = leaf_factors.len(), "eliminating markov ordinal");
        for (group, group_vars) in partition(&leaf_factors, &reduce_vars) {
            let nonmarkov: BTreeSet<&String> = group_vars
                .iter()
                .filter(|var| {
                    !plan.markov_sum_vars.contains(*var) && !plan.markov_prod_vars.contains(*var)
                })
                .collect();
            let mut factor =
                reduce_present(&Term::fold(prod_op, &group)?, sum_op, nonmarkov.into_iter())?;

            let markov_vars: BTreeSet<String> = group_vars
                .intersection(&plan.markov_sum_vars)
                .cloned()
                .collect();
            if !markov_vars.is_empty() {
                let time = plan.markov_time(&markov_vars, &factor, &index, &leaf)?;
                factor = plan.eliminate_chain(sum_op, prod_op, &factor, &time, &markov_vars)?;
            }

            match index.plates_needed(&factor, &plan.sum_vars) {
                None => {
                    let plates = plan.drop_markov_plates(leaf.intersection(&plan.prod_vars));
                    results.push(reduce_present(&factor, prod_op, plates)?);
                }
                Some(new_plates) => {
                    if new_plates == leaf {
                        return Err(intractable(&factor, &plan.sum_vars, &leaf));
                    }
                    let plates = plan.drop_markov_plates(leaf.difference(&new_plates));
                    let factor = reduce_present(&factor, prod_op, plates)?;
                    index.ordinals.push(new_plates, factor);
                }
            }
        }
    }
    Ok(results)
}

/// Integral of `integrand` against the density `exp(sum of factors)`,
/// eliminating `eliminate` as in
/// [`modified_partial_sum_product`].
///
/// Markov plates are handled with forward and backward terms: the integrand
/// at step `t` is weighted by the chain before `t`, the factor at `t`, and the
/// chain after `t`. Needs `eager`.
pub fn compute_expectation(
    factors: &[Term],
    integrand: &Term,
    eliminate: &BTreeSet<String>,
    plate_to_step: &PlateSteps,
) -> Result<Term, SumProductError> {
    register_markov_rules();
    let plan = MarkovPlan::new(eliminate, plate_to_step)?;
    let mut index = FactorIndex::new(factors, &plan.plates, &plan.sum_vars);
    let mut integrand = integrand.clone();

    while let Some((leaf, leaf_factors)) = index.ordinals.pop_deepest() {
        let reduce_vars: BTreeSet<String> = index
            .leaf_vars(&leaf)
            .union(&plan.markov_prod_vars)
            .cloned()
            .collect();
        for (group, group_vars) in partition(&leaf_factors, &reduce_vars) {
            let nonmarkov: BTreeSet<String> = group_vars
                .iter()
                .filter(|var| {
                    !plan.markov_sum_vars.contains(*var) && !plan.markov_prod_vars.contains(*var)
                })
                .cloned()
                .collect();
            let touches = |term: &Term| nonmarkov.iter().any(|var| term.inputs().contains(var));
            let (nonmarkov_factors, markov_factors): (Vec<Term>, Vec<Term>) =
                group.iter().cloned().partition(|term| touches(term));
            let markov_vars: BTreeSet<String> = group_vars
                .intersection(&plan.markov_sum_vars)
                .cloned()
                .collect();

            if group_vars.iter().any(|var| integrand.inputs().contains(var)) {
                if !nonmarkov_factors.is_empty() {
                    let log_measure = Term::fold(Op::Add, &nonmarkov_factors)?;
                    integrand = Term::contraction(
                        Op::Add,
                        Op::Mul,
                        nonmarkov.clone(),
                        vec![log_measure.exp()?, integrand],
                    )?;
                }
                if !markov_vars.is_empty() {
                    let factor = Term::fold(Op::Add, &markov_factors)?;
                    let time = plan.markov_time(&markov_vars, &factor, &index, &leaf)?;
                    integrand = weigh_by_chain(&plan, &factor, &integrand, &time, &markov_vars)?;
                }
                continue;
            }

            let mut factor = if nonmarkov.is_empty() {
                Term::fold(Op::Add, &group)?
            } else {
                let marginal = reduce_present(
                    &Term::fold(Op::Add, &nonmarkov_factors)?,
                    Op::LogAddExp,
                    &nonmarkov,
                )?;
                let mut terms = markov_factors;
                terms.push(marginal);
                Term::fold(Op::Add, &terms)?
            };
            if !markov_vars.is_empty() {
                let time = plan.markov_time(&markov_vars, &factor, &index, &leaf)?;
                factor =
                    plan.eliminate_chain(Op::LogAddExp, Op::Add, &factor, &time, &markov_vars)?;
            }
            if let Some(new_plates) = index.plates_needed(&factor, &plan.sum_vars) {
                if new_plates == leaf {
                    return Err(intractable(&factor, &plan.sum_vars, &leaf));
                }
                let plates = plan.drop_markov_plates(leaf.difference(&new_plates));
                let factor = reduce_present(&factor, Op::Add, plates)?;
                index.ordinals.push(new_plates, factor);
            }
        }
    }
    Ok(integrand)
}

/// `integrand[t] * exp(alpha[t-1] + factor[t] + beta[t+1])`, contracted over
/// the chain variables, with the previous names renamed to initial names.
fn weigh_by_chain(
    plan: &MarkovPlan,
    factor: &Term,
    integrand: &Term,
    time: &str,
    markov_vars: &BTreeSet<String>,
) -> Result<Term, SumProductError> {
    let pairs = plan.chain_step(time, markov_vars);
    let step: Step = pairs.iter().cloned().collect();
    let time_var = match factor.inputs().get(time) {
        Some(domain) => Term::variable(time, domain.clone())?,
        None => {
            return Err(SumProductError::InvalidArgument {
                detail: format!("markov factor has no input {time}"),
            });
        }
    };
    let (alphas, betas) = forward_backward_terms(Op::LogAddExp, Op::Add, factor, &time_var, &step)?;
    let alphas = left_pad_right_crop(&alphas, time, &step)?;
    let betas = right_pad_left_crop(&betas, time, &step)?;
    let weighted = integrand.mul(&factor.exp()?)?;
    let history = Term::stack("history", vec![alphas.exp()?, weighted, betas.exp()?])?;
    let chain = Term::markov_product(Op::Add, Op::Mul, &history, "history", &pairs)?;
    let chain = reduce_present(&chain, Op::Add, step.values())?;
    Ok(chain.rename(plan.prev_to_init.iter().cloned())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::{DenseArray, Domain, Inputs, with_interpretation};
    use ff_interpreters::{eager, lazy, reinterpret};

    fn factor(names: &[(&str, usize)], seed: usize) -> Term {
        let shape: Vec<usize> = names.iter().map(|(_, size)| *size).collect();
        let count: usize = shape.iter().product();
        let values = (0..count)
            .map(|k| 0.5 + ((k * 7 + seed * 3) % 11) as f64 * 0.1)
            .collect();
        let data = DenseArray::new(shape, values).expect("array");
        let inputs =
            Inputs::from_pairs(names.iter().map(|(name, size)| (*name, Domain::bint(*size))))
                .expect("inputs");
        Term::tensor(data, inputs).expect("tensor")
    }

    fn value(term: &Term) -> f64 {
        term.item().expect("scalar")
    }

    fn at(term: &Term, index: &[(&str, usize)]) -> f64 {
        let mut term = term.clone();
        for (name, i) in index {
            term = term.at(name, *i).expect("index");
        }
        value(&term)
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn partition_follows_shared_sum_variables() {
        let a = factor(&[("x", 2)], 0);
        let b = factor(&[("x", 2), ("y", 2)], 1);
        let c = factor(&[("z", 2)], 2);
        let d = factor(&[("y", 2), ("i", 3)], 3);
        let parts = partition(
            &[a.clone(), c.clone(), b.clone(), d.clone()],
            &names(&["x", "y", "z"]),
        );
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, vec![a, b, d]);
        assert_eq!(parts[0].1, names(&["x", "y"]));
        assert_eq!(parts[1].0, vec![c]);
        assert_eq!(parts[1].1, names(&["z"]));

        // Plates alone do not connect factors.
        let parts = partition(&[factor(&[("i", 3)], 0), factor(&[("i", 3)], 1)], &names(&["x"]));
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|(_, vars)| vars.is_empty()));
    }

    #[test]
    fn plated_sum_product_matches_enumeration() {
        // sum_x f(x) * prod_i sum_y g(i, x, y)
        let f = factor(&[("x", 2)], 0);
        let g = factor(&[("i", 3), ("x", 2), ("y", 2)], 1);
        with_interpretation(eager(), || {
            let total = sum_product(
                Op::Add,
                Op::Mul,
                &[f.clone(), g.clone()],
                &names(&["x", "y", "i"]),
                &names(&["i"]),
            )
            .expect("sum product");
            let mut want = 0.0;
            for x in 0..2 {
                let mut plate = 1.0;
                for i in 0..3 {
                    let inner: f64 = (0..2)
                        .map(|y| at(&g, &[("i", i), ("x", x), ("y", y)]))
                        .sum();
                    plate *= inner;
                }
                want += at(&f, &[("x", x)]) * plate;
            }
            assert!((value(&total) - want).abs() < 1e-9);
        });
    }

    #[test]
    fn partial_results_keep_uneliminated_plates() {
        let g = factor(&[("i", 3), ("y", 2)], 4);
        with_interpretation(eager(), || {
            let results = partial_sum_product(
                Op::Add,
                Op::Mul,
                &[g.clone()],
                &names(&["y"]),
                &names(&["i"]),
            )
            .expect("partial");
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].inputs().name_set(), names(&["i"]));
            for i in 0..3 {
                let want: f64 = (0..2).map(|y| at(&g, &[("i", i), ("y", y)])).sum();
                assert!((at(&results[0], &[("i", i)]) - want).abs() < 1e-9);
            }
        });
    }

    #[test]
    fn crossed_plates_are_intractable() {
        let a = factor(&[("i", 2), ("x", 2)], 0);
        let b = factor(&[("j", 2), ("y", 2)], 1);
        let h = factor(&[("i", 2), ("j", 2), ("x", 2), ("y", 2)], 2);
        with_interpretation(eager(), || {
            let err = partial_sum_product(
                Op::Add,
                Op::Mul,
                &[a, b, h],
                &names(&["x", "y", "i", "j"]),
                &names(&["i", "j"]),
            )
            .expect_err("crossed plates");
            assert!(matches!(err, SumProductError::Intractable { .. }));
        });
    }

    #[test]
    fn lazy_sum_product_evaluates_to_eager() {
        let f = factor(&[("x", 2)], 0);
        let g = factor(&[("i", 3), ("x", 2)], 1);
        let eliminate = names(&["x", "i"]);
        let plates = names(&["i"]);
        let lazy_total = with_interpretation(lazy(), || {
            sum_product(Op::Add, Op::Mul, &[f.clone(), g.clone()], &eliminate, &plates)
        })
        .expect("lazy");
        assert!(lazy_total.as_tensor().is_none());
        let eager_total = with_interpretation(eager(), || {
            sum_product(Op::Add, Op::Mul, &[f.clone(), g.clone()], &eliminate, &plates)
        })
        .expect("eager");
        let evaluated =
            with_interpretation(eager(), || reinterpret(&lazy_total)).expect("evaluate");
        assert!((value(&evaluated) - value(&eager_total)).abs() < 1e-9);
    }

    fn hmm_steps() -> PlateSteps {
        [(
            "time".to_owned(),
            vec![vec!["x_0".to_owned(), "x_prev".to_owned(), "x_curr".to_owned()]],
        )]
        .into()
    }

    fn log_factor(names: &[(&str, usize)], seed: usize) -> Term {
        with_interpretation(eager(), || factor(names, seed).log()).expect("log")
    }

    /// Log weight of every path `x_0 .. x_T`.
    fn paths(duration: usize, states: usize) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new()];
        for _ in 0..=duration {
            out = out
                .into_iter()
                .flat_map(|path| {
                    (0..states).map(move |s| {
                        let mut next = path.clone();
                        next.push(s);
                        next
                    })
                })
                .collect();
        }
        out
    }

    fn path_weight(init: Option<&Term>, trans: &Term, path: &[usize]) -> f64 {
        let mut weight = init.map_or(0.0, |init| at(init, &[("x_0", path[0])]));
        for t in 0..path.len() - 1 {
            weight += at(trans, &[("time", t), ("x_prev", path[t]), ("x_curr", path[t + 1])]);
        }
        weight
    }

    #[test]
    fn markov_plate_matches_path_enumeration() {
        let duration = 4;
        let init = log_factor(&[("x_0", 2)], 0);
        let trans = log_factor(&[("time", duration), ("x_prev", 2), ("x_curr", 2)], 1);
        with_interpretation(eager(), || {
            let results = modified_partial_sum_product(
                Op::LogAddExp,
                Op::Add,
                &[init.clone(), trans.clone()],
                &names(&["x_0", "x_prev", "x_curr", "time"]),
                &hmm_steps(),
            )
            .expect("markov elimination");
            assert_eq!(results.len(), 1);
            let want = paths(duration, 2)
                .iter()
                .map(|path| path_weight(Some(&init), &trans, path))
                .fold(f64::NEG_INFINITY, ff_core::logaddexp);
            assert!((value(&results[0]) - want).abs() < 1e-9);
        });
    }

    #[test]
    fn malformed_chains_are_rejected() {
        let steps: PlateSteps = [(
            "time".to_owned(),
            vec![vec!["x_prev".to_owned(), "x_curr".to_owned()]],
        )]
        .into();
        let err =
            modified_partial_sum_product(Op::LogAddExp, Op::Add, &[], &names(&["time"]), &steps)
                .expect_err("two names");
        assert!(matches!(err, SumProductError::InvalidArgument { .. }));
    }

    #[test]
    fn expectation_without_plates_is_a_weighted_sum() {
        let log_p = log_factor(&[("x", 3)], 2);
        let g = factor(&[("x", 3)], 5);
        with_interpretation(eager(), || {
            let expectation =
                compute_expectation(&[log_p.clone()], &g, &names(&["x"]), &PlateSteps::new())
                    .expect("expectation");
            let want: f64 = (0..3)
                .map(|x| at(&log_p, &[("x", x)]).exp() * at(&g, &[("x", x)]))
                .sum();
            assert!((value(&expectation) - want).abs() < 1e-9);
        });
    }

    #[test]
    fn expectation_along_a_chain_weighs_each_step() {
        let duration = 3;
        let trans = log_factor(&[("time", duration), ("x_prev", 2), ("x_curr", 2)], 3);
        let h = factor(&[("time", duration), ("x_prev", 2), ("x_curr", 2)], 6);
        with_interpretation(eager(), || {
            let expectation = compute_expectation(
                &[trans.clone()],
                &h,
                &names(&["x_prev", "x_curr", "time"]),
                &hmm_steps(),
            )
            .expect("expectation");
            assert_eq!(expectation.inputs().name_set(), names(&["time", "x_0"]));
            for t in 0..duration {
                for start in 0..2 {
                    let want: f64 = paths(duration, 2)
                        .iter()
                        .filter(|path| path[0] == start)
                        .map(|path| {
                            let edge =
                                [("time", t), ("x_prev", path[t]), ("x_curr", path[t + 1])];
                            path_weight(None, &trans, path).exp() * at(&h, &edge)
                        })
                        .sum();
                    let got = at(&expectation, &[("time", t), ("x_0", start)]);
                    assert!((got - want).abs() < 1e-9 * want.abs().max(1.0), "t={t} x_0={start}");
                }
            }
        });
    }
}
