//! Exhaustive evaluation of small discrete factor graphs.
//!
//! Every answer here is computed by visiting each joint assignment, with no
//! use of the rewrite machinery, so it can serve as ground truth for the
//! elimination algorithms.

use std::collections::{BTreeMap, BTreeSet};

use ff_core::{Op, Term, TermKind};
use serde::{Deserialize, Serialize};

use crate::ConformanceError;

type Assignment = BTreeMap<String, usize>;

/// Visits every index vector of a row-major shape, last axis fastest.
#[derive(Debug, Clone)]
pub struct Odometer {
    sizes: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Odometer {
    #[must_use]
    pub fn new(sizes: &[usize]) -> Self {
        let next = if sizes.contains(&0) {
            None
        } else {
            Some(vec![0; sizes.len()])
        };
        Self {
            sizes: sizes.to_vec(),
            next,
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut following = current.clone();
        for axis in (0..following.len()).rev() {
            following[axis] += 1;
            if following[axis] < self.sizes[axis] {
                self.next = Some(following);
                return Some(current);
            }
            following[axis] = 0;
        }
        Some(current)
    }
}

/// A dense function of named discrete variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub names: Vec<String>,
    pub sizes: Vec<usize>,
    pub values: Vec<f64>,
}

impl Table {
    fn strides(&self) -> Vec<usize> {
        ff_core::DenseArray::strides(&self.sizes)
    }

    fn offset(&self, assignment: &Assignment) -> Option<usize> {
        self.names
            .iter()
            .zip(self.strides())
            .map(|(name, stride)| assignment.get(name).map(|index| index * stride))
            .sum()
    }

    /// Value at an assignment covering every name of the table.
    #[must_use]
    pub fn get(&self, assignment: &BTreeMap<String, usize>) -> Option<f64> {
        self.values.get(self.offset(assignment)?).copied()
    }

    /// Sums `name` out with `op`.
    pub fn reduce(&self, op: Op, name: &str) -> Result<Self, ConformanceError> {
        let Some(axis) = self.names.iter().position(|n| n == name) else {
            return Ok(self.clone());
        };
        let unit = op.unit().ok_or_else(|| ConformanceError::Unsupported {
            detail: format!("{} has no unit", op.as_str()),
        })?;
        let mut names = self.names.clone();
        let mut sizes = self.sizes.clone();
        names.remove(axis);
        sizes.remove(axis);
        let mut reduced = Self {
            values: vec![unit; sizes.iter().product()],
            names,
            sizes,
        };
        let strides = reduced.strides();
        for (index, value) in Odometer::new(&self.sizes).zip(&self.values) {
            let offset: usize = index
                .iter()
                .enumerate()
                .filter(|(a, _)| *a != axis)
                .map(|(_, i)| *i)
                .zip(&strides)
                .map(|(i, stride)| i * stride)
                .sum();
            reduced.values[offset] = op.apply_binary(reduced.values[offset], *value);
        }
        Ok(reduced)
    }

    #[must_use]
    pub fn rename(mut self, from: &str, to: &str) -> Self {
        for name in &mut self.names {
            if name == from {
                *name = to.to_owned();
            }
        }
        self
    }

    /// Largest absolute difference between the table and a ground term over
    /// the same variables. Matching infinities count as equal.
    pub fn max_abs_error(&self, term: &Term) -> Result<f64, ConformanceError> {
        let actual = GroundFactor::from_term(term)?;
        let expected: BTreeSet<&String> = self.names.iter().collect();
        let got: BTreeSet<&String> = actual.names.iter().collect();
        if expected != got {
            return Err(ConformanceError::Mismatch {
                detail: format!("expected inputs {expected:?}, got {got:?}"),
            });
        }
        let mut worst = 0.0_f64;
        for index in Odometer::new(&self.sizes) {
            let assignment: Assignment = self.names.iter().cloned().zip(index).collect();
            let want = self.get(&assignment).unwrap_or(f64::NAN);
            let have = actual.value(&assignment)?;
            let error = if want == have { 0.0 } else { (want - have).abs() };
            worst = if error.is_nan() { f64::INFINITY } else { worst.max(error) };
        }
        Ok(worst)
    }
}

/// A closed tensor or number read straight from its buffer.
#[derive(Debug, Clone)]
struct GroundFactor {
    names: Vec<String>,
    strides: Vec<usize>,
    values: Vec<f64>,
    ordinal: BTreeSet<String>,
}

impl GroundFactor {
    fn from_term(term: &Term) -> Result<Self, ConformanceError> {
        match term.kind() {
            TermKind::Number { value, .. } => Ok(Self {
                names: Vec::new(),
                strides: Vec::new(),
                values: vec![*value],
                ordinal: BTreeSet::new(),
            }),
            TermKind::Tensor { data, inputs, .. } => {
                if data.rank() != inputs.len() {
                    return Err(ConformanceError::Unsupported {
                        detail: "tensor factors must have scalar outputs".to_owned(),
                    });
                }
                Ok(Self {
                    names: inputs.names().map(str::to_owned).collect(),
                    strides: ff_core::DenseArray::strides(data.shape()),
                    values: data.elements().to_vec(),
                    ordinal: BTreeSet::new(),
                })
            }
            _ => Err(ConformanceError::NotGround {
                detail: term.to_string(),
            }),
        }
    }

    fn value(&self, assignment: &Assignment) -> Result<f64, ConformanceError> {
        let mut offset = 0;
        for (name, stride) in self.names.iter().zip(&self.strides) {
            let index = assignment.get(name).ok_or_else(|| ConformanceError::CrossedPlates {
                detail: format!("{name} is never assigned"),
            })?;
            offset += index * stride;
        }
        self.values
            .get(offset)
            .copied()
            .ok_or_else(|| ConformanceError::Mismatch {
                detail: format!("offset {offset} out of range"),
            })
    }
}

struct Graph<'a> {
    sum_op: Op,
    prod_op: Op,
    factors: Vec<GroundFactor>,
    sizes: &'a BTreeMap<String, usize>,
    /// Eliminated non-plate variables keyed by the plates they live in.
    var_ordinals: Vec<(String, BTreeSet<String>)>,
}

impl Graph<'_> {
    /// Value of the factors in `members` with every variable at `scope` and
    /// below summed out, given the outer assignment.
    fn eval(
        &self,
        scope: &BTreeSet<String>,
        members: &[usize],
        assignment: &mut Assignment,
    ) -> Result<f64, ConformanceError> {
        let (local, deeper): (Vec<usize>, Vec<usize>) = members
            .iter()
            .copied()
            .partition(|index| self.factors[*index].ordinal == *scope);
        let level_vars: Vec<&String> = self
            .var_ordinals
            .iter()
            .filter(|(name, ordinal)| {
                ordinal == scope
                    && members
                        .iter()
                        .any(|index| self.factors[*index].names.contains(name))
            })
            .map(|(name, _)| name)
            .collect();
        let groups = self.plate_groups(scope, &deeper)?;
        let level_sizes: Vec<usize> = level_vars.iter().map(|name| self.sizes[*name]).collect();

        let mut total = self.unit(self.sum_op)?;
        for index in Odometer::new(&level_sizes) {
            for (name, i) in level_vars.iter().zip(&index) {
                assignment.insert((*name).clone(), *i);
            }
            let mut product = self.unit(self.prod_op)?;
            for factor in &local {
                product = self
                    .prod_op
                    .apply_binary(product, self.factors[*factor].value(assignment)?);
            }
            for (plate, group) in &groups {
                let mut inner = scope.clone();
                inner.insert(plate.clone());
                for i in 0..self.sizes[plate] {
                    assignment.insert(plate.clone(), i);
                    let value = self.eval(&inner, group, assignment)?;
                    product = self.prod_op.apply_binary(product, value);
                }
                assignment.remove(plate);
            }
            total = self.sum_op.apply_binary(total, product);
        }
        for name in level_vars {
            assignment.remove(name);
        }
        Ok(total)
    }

    /// Splits factors nested below `scope` into independent plate subtrees,
    /// each entered through one plate shared by all of its factors.
    fn plate_groups(
        &self,
        scope: &BTreeSet<String>,
        deeper: &[usize],
    ) -> Result<Vec<(String, Vec<usize>)>, ConformanceError> {
        let extra = |index: usize| -> BTreeSet<String> {
            self.factors[index]
                .ordinal
                .difference(scope)
                .cloned()
                .collect()
        };
        let mut groups: Vec<(BTreeSet<String>, Vec<usize>)> = Vec::new();
        for index in deeper {
            let plates = extra(*index);
            let mut merged = (plates, vec![*index]);
            let mut kept = Vec::with_capacity(groups.len());
            for group in groups.drain(..) {
                if group.0.is_disjoint(&merged.0) {
                    kept.push(group);
                } else {
                    merged.0.extend(group.0);
                    merged.1.extend(group.1);
                }
            }
            kept.push(merged);
            groups = kept;
        }

        groups
            .into_iter()
            .map(|(plates, mut group)| {
                group.sort_unstable();
                let shared = plates
                    .iter()
                    .find(|plate| group.iter().all(|index| extra(*index).contains(*plate)))
                    .cloned()
                    .ok_or_else(|| ConformanceError::CrossedPlates {
                        detail: format!("no plate in {plates:?} is shared by every factor"),
                    })?;
                Ok((shared, group))
            })
            .collect()
    }

    fn unit(&self, op: Op) -> Result<f64, ConformanceError> {
        op.unit().ok_or_else(|| ConformanceError::Unsupported {
            detail: format!("{} has no unit", op.as_str()),
        })
    }
}

fn bint_sizes(terms: &[Term]) -> Result<BTreeMap<String, usize>, ConformanceError> {
    let mut sizes = BTreeMap::new();
    for term in terms {
        let names = term.inputs().names().map(str::to_owned);
        for (name, size) in names.zip(term.inputs().bint_sizes()?) {
            if let Some(previous) = sizes.insert(name.clone(), size)
                && previous != size
            {
                return Err(ConformanceError::Mismatch {
                    detail: format!("{name} has sizes {previous} and {size}"),
                });
            }
        }
    }
    Ok(sizes)
}

/// Plated sum-product by enumeration: the eliminated plates are
/// product-reduced, every other eliminated variable is summed, and the
/// result is tabulated over the remaining variables.
pub fn enumerate(
    sum_op: Op,
    prod_op: Op,
    factors: &[Term],
    eliminate: &BTreeSet<String>,
    plates: &BTreeSet<String>,
) -> Result<Table, ConformanceError> {
    let sizes = bint_sizes(factors)?;
    let kept_plates: BTreeSet<String> = plates
        .iter()
        .filter(|plate| sizes.contains_key(*plate) && !eliminate.contains(*plate))
        .cloned()
        .collect();

    let mut ground = Vec::with_capacity(factors.len());
    for term in factors {
        let mut factor = GroundFactor::from_term(term)?;
        factor.ordinal = factor
            .names
            .iter()
            .filter(|name| plates.contains(*name))
            .cloned()
            .chain(kept_plates.iter().cloned())
            .collect();
        ground.push(factor);
    }

    let mut var_ordinals = Vec::new();
    for name in sizes.keys().filter(|name| eliminate.contains(*name) && !plates.contains(*name)) {
        let ordinal = ground
            .iter()
            .filter(|factor| factor.names.contains(name))
            .map(|factor| factor.ordinal.clone())
            .reduce(|acc, ordinal| acc.intersection(&ordinal).cloned().collect())
            .unwrap_or_default();
        var_ordinals.push((name.clone(), ordinal));
    }

    let kept: Vec<String> = sizes
        .keys()
        .filter(|name| !eliminate.contains(*name))
        .cloned()
        .collect();
    let kept_sizes: Vec<usize> = kept.iter().map(|name| sizes[name]).collect();
    let graph = Graph {
        sum_op,
        prod_op,
        factors: ground,
        sizes: &sizes,
        var_ordinals,
    };
    let members: Vec<usize> = (0..graph.factors.len()).collect();

    let mut values = Vec::with_capacity(kept_sizes.iter().product());
    for index in Odometer::new(&kept_sizes) {
        let mut assignment: Assignment = kept.iter().cloned().zip(index).collect();
        values.push(graph.eval(&kept_plates, &members, &mut assignment)?);
    }
    Ok(Table {
        names: kept,
        sizes: kept_sizes,
        values,
    })
}

/// Sum over every state path of a chain: the result is indexed by the state
/// before the first step (`prev`) and after the last step (`curr`).
pub fn enumerate_chain(
    sum_op: Op,
    prod_op: Op,
    trans: &Term,
    time: &str,
    prev: &str,
    curr: &str,
) -> Result<Table, ConformanceError> {
    let sizes = bint_sizes(std::slice::from_ref(trans))?;
    let expected: BTreeSet<&str> = [time, prev, curr].into();
    if trans.inputs().names().collect::<BTreeSet<_>>() != expected {
        return Err(ConformanceError::Unsupported {
            detail: format!("chain factors must have exactly the inputs {expected:?}"),
        });
    }
    let factor = GroundFactor::from_term(trans)?;
    let duration = sizes[time];
    let states = sizes[prev];
    if sizes[curr] != states || duration == 0 {
        return Err(ConformanceError::Unsupported {
            detail: "chains need matching state sizes and at least one step".to_owned(),
        });
    }
    let unit = |op: Op| {
        op.unit().ok_or_else(|| ConformanceError::Unsupported {
            detail: format!("{} has no unit", op.as_str()),
        })
    };

    let mut values = vec![unit(sum_op)?; states * states];
    for path in Odometer::new(&vec![states; duration + 1]) {
        let mut weight = unit(prod_op)?;
        for t in 0..duration {
            let assignment: Assignment = [
                (time.to_owned(), t),
                (prev.to_owned(), path[t]),
                (curr.to_owned(), path[t + 1]),
            ]
            .into();
            weight = prod_op.apply_binary(weight, factor.value(&assignment)?);
        }
        let offset = path[0] * states + path[duration];
        values[offset] = sum_op.apply_binary(values[offset], weight);
    }
    Ok(Table {
        names: vec![prev.to_owned(), curr.to_owned()],
        sizes: vec![states, states],
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::{DenseArray, Domain, Inputs};
    use ff_test_utils::approx_eq;

    fn tensor(names: &[(&str, usize)], values: Vec<f64>) -> Term {
        let shape = names.iter().map(|(_, size)| *size).collect();
        let data = DenseArray::new(shape, values).expect("array should build");
        let inputs = Inputs::from_pairs(names.iter().map(|(n, s)| (*n, Domain::bint(*s))))
            .expect("inputs should build");
        Term::tensor(data, inputs).expect("tensor should build")
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn odometer_counts_in_row_major_order() {
        let all: Vec<Vec<usize>> = Odometer::new(&[2, 3]).collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], vec![0, 0]);
        assert_eq!(all[1], vec![0, 1]);
        assert_eq!(all[5], vec![1, 2]);
        assert_eq!(Odometer::new(&[]).count(), 1);
        assert_eq!(Odometer::new(&[3, 0]).count(), 0);
    }

    #[test]
    fn plain_sum_of_products() {
        let f = tensor(&[("a", 2)], vec![1.0, 2.0]);
        let g = tensor(&[("a", 2), ("b", 2)], vec![1.0, 3.0, 5.0, 7.0]);
        let table = enumerate(Op::Add, Op::Mul, &[f, g], &set(&["a"]), &BTreeSet::new())
            .expect("enumerate");
        assert_eq!(table.names, vec!["b".to_owned()]);
        assert_eq!(table.values, vec![1.0 + 10.0, 3.0 + 14.0]);
    }

    #[test]
    fn plates_take_products_of_local_sums() {
        // sum_a f(a) * prod_i sum_b g(a, i, b)
        let f = tensor(&[("a", 2)], vec![0.5, 1.5]);
        let g = tensor(
            &[("a", 2), ("i", 2), ("b", 2)],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        );
        let table = enumerate(
            Op::Add,
            Op::Mul,
            &[f, g],
            &set(&["a", "b", "i"]),
            &set(&["i"]),
        )
        .expect("enumerate");
        let want = 0.5 * (3.0 * 7.0) + 1.5 * (11.0 * 15.0);
        assert!(table.names.is_empty());
        assert!(approx_eq(table.values[0], want, 1e-12));
    }

    #[test]
    fn sibling_plates_split_from_local_factors() {
        // sum_a f(a) * prod_i g(a, i) * prod_j h(a, j)
        let f = tensor(&[("a", 2)], vec![2.0, 3.0]);
        let g = tensor(&[("a", 2), ("i", 2)], vec![1.0, 2.0, 3.0, 4.0]);
        let h = tensor(&[("a", 2), ("j", 3)], vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0]);
        let table = enumerate(
            Op::Add,
            Op::Mul,
            &[f, g, h],
            &set(&["a", "i", "j"]),
            &set(&["i", "j"]),
        )
        .expect("enumerate");
        let want = 2.0 * (1.0 * 2.0) * (1.0 * 1.0 * 2.0) + 3.0 * (3.0 * 4.0) * (2.0 * 1.0 * 1.0);
        assert!(table.names.is_empty());
        assert!(approx_eq(table.values[0], want, 1e-12));
    }

    #[test]
    fn crossed_plates_are_rejected() {
        let f = tensor(&[("i", 2), ("x", 2)], vec![1.0; 4]);
        let g = tensor(&[("j", 2), ("x", 2)], vec![1.0; 4]);
        let h = tensor(&[("i", 2), ("j", 2)], vec![1.0; 4]);
        let err = enumerate(
            Op::Add,
            Op::Mul,
            &[f, g, h],
            &set(&["i", "j", "x"]),
            &set(&["i", "j"]),
        )
        .expect_err("i and j cross");
        assert!(matches!(err, ConformanceError::CrossedPlates { .. }));
    }

    #[test]
    fn chains_sum_over_paths() {
        let trans = tensor(
            &[("t", 2), ("p", 2), ("c", 2)],
            vec![1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 1.0],
        );
        let table = enumerate_chain(Op::Add, Op::Mul, &trans, "t", "p", "c").expect("chain");
        // The second step is the identity, so the result is the first step.
        assert_eq!(table.values, vec![1.0, 2.0, 3.0, 4.0]);
        let marginal = table.reduce(Op::Add, "c").expect("reduce").rename("p", "x_0");
        assert_eq!(marginal.names, vec!["x_0".to_owned()]);
        assert_eq!(marginal.values, vec![3.0, 7.0]);
    }

    #[test]
    fn error_against_a_term_requires_matching_inputs() {
        let table = Table {
            names: vec!["a".to_owned()],
            sizes: vec![2],
            values: vec![1.0, f64::NEG_INFINITY],
        };
        let same = tensor(&[("a", 2)], vec![1.5, f64::NEG_INFINITY]);
        let err = table.max_abs_error(&same).expect("compare");
        assert!(approx_eq(err, 0.5, 1e-12));
        let other = tensor(&[("b", 2)], vec![1.0, 2.0]);
        assert!(matches!(
            table.max_abs_error(&other),
            Err(ConformanceError::Mismatch { .. })
        ));
    }
}
