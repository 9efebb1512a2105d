//! Public constructors and the term-level algebra.
//!
//! Constructors validate and complete their arguments, then hand the
//! resulting [`TermKind`] to the active interpretation. They are the only
//! supported way to build a term.

use std::collections::BTreeSet;

use crate::array::DenseArray;
use crate::domain::{Domain, Dtype};
use crate::error::TermError;
use crate::interpreter::interpret;
use crate::ops::Op;
use crate::term::{Inputs, Term, TermKind};

/// Type-checks `kind` and constructs it under the active interpretation.
pub fn construct(kind: TermKind) -> Result<Term, TermError> {
    kind.infer_type()?;
    interpret(kind)
}

fn sorted_pairs(mut pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs.sort();
    pairs.dedup();
    pairs
}

impl Term {
    pub fn variable(name: impl Into<String>, domain: Domain) -> Result<Term, TermError> {
        construct(TermKind::Variable {
            name: name.into(),
            domain,
        })
    }

    pub fn number(value: f64) -> Result<Term, TermError> {
        construct(TermKind::Number {
            value,
            dtype: Dtype::Real,
        })
    }

    /// A constant of domain `Bint[size]`.
    pub fn int(value: usize, size: usize) -> Result<Term, TermError> {
        if value >= size {
            return Err(TermError::Unsupported {
                detail: format!("index {value} is out of range for Bint[{size}]"),
            });
        }
        construct(TermKind::Number {
            value: value as f64,
            dtype: Dtype::Int(size),
        })
    }

    /// The identity element of `op`, as a real constant.
    pub fn unit(op: Op) -> Result<Term, TermError> {
        let value = op.unit().ok_or_else(|| TermError::Unsupported {
            detail: format!("{op} has no unit"),
        })?;
        Term::number(value)
    }

    pub fn tensor(data: DenseArray, inputs: Inputs) -> Result<Term, TermError> {
        Term::tensor_with_dtype(data, inputs, Dtype::Real)
    }

    pub fn tensor_with_dtype(
        data: DenseArray,
        inputs: Inputs,
        dtype: Dtype,
    ) -> Result<Term, TermError> {
        construct(TermKind::Tensor {
            data,
            inputs,
            dtype,
        })
    }

    pub fn unary(op: Op, arg: &Term) -> Result<Term, TermError> {
        construct(TermKind::Unary {
            op,
            arg: arg.clone(),
        })
    }

    pub fn binary(op: Op, lhs: &Term, rhs: &Term) -> Result<Term, TermError> {
        construct(TermKind::Binary {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        })
    }

    /// Raw `Reduce` node. Prefer [`Term::reduce`], which skips empty sets.
    pub fn reduction(
        op: Op,
        arg: &Term,
        reduced_vars: BTreeSet<String>,
    ) -> Result<Term, TermError> {
        construct(TermKind::Reduce {
            op,
            arg: arg.clone(),
            reduced_vars,
        })
    }

    pub fn contraction(
        red_op: Op,
        bin_op: Op,
        reduced_vars: BTreeSet<String>,
        terms: Vec<Term>,
    ) -> Result<Term, TermError> {
        construct(TermKind::Contraction {
            red_op,
            bin_op,
            reduced_vars,
            terms,
        })
    }

    /// Raw `Subs` node. Every key must be an input of `arg`.
    pub fn substitution(arg: &Term, mut subs: Vec<(String, Term)>) -> Result<Term, TermError> {
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        subs.dedup_by(|later, earlier| later.0 == earlier.0);
        construct(TermKind::Subs {
            arg: arg.clone(),
            subs,
        })
    }

    pub fn stack(name: impl Into<String>, parts: Vec<Term>) -> Result<Term, TermError> {
        construct(TermKind::Stack {
            name: name.into(),
            parts,
        })
    }

    pub fn cat(
        name: impl Into<String>,
        parts: Vec<Term>,
        part_name: impl Into<String>,
    ) -> Result<Term, TermError> {
        construct(TermKind::Cat {
            name: name.into(),
            parts,
            part_name: part_name.into(),
        })
    }

    pub fn slice(
        name: impl Into<String>,
        start: usize,
        stop: usize,
        step: usize,
        dtype: usize,
    ) -> Result<Term, TermError> {
        construct(TermKind::Slice {
            name: name.into(),
            start,
            stop: stop.min(dtype),
            step,
            dtype,
        })
    }

    pub fn delta(
        name: impl Into<String>,
        point: &Term,
        log_density: &Term,
    ) -> Result<Term, TermError> {
        construct(TermKind::Delta {
            name: name.into(),
            point: point.clone(),
            log_density: log_density.clone(),
        })
    }

    /// Lazy chain product of `trans` along `time`. `step` maps each previous
    /// variable to its current counterpart; every stepped name keeps its own
    /// name in the result.
    pub fn markov_product(
        sum_op: Op,
        prod_op: Op,
        trans: &Term,
        time: &str,
        step: &[(String, String)],
    ) -> Result<Term, TermError> {
        let step_names = step
            .iter()
            .flat_map(|(prev, curr)| {
                [(prev.clone(), prev.clone()), (curr.clone(), curr.clone())]
            })
            .collect();
        Term::markov_product_named(sum_op, prod_op, trans, time, step, step_names)
    }

    pub fn markov_product_named(
        sum_op: Op,
        prod_op: Op,
        trans: &Term,
        time: &str,
        step: &[(String, String)],
        step_names: Vec<(String, String)>,
    ) -> Result<Term, TermError> {
        let domain = trans
            .inputs()
            .get(time)
            .cloned()
            .ok_or_else(|| TermError::ReducedVarsNotSubset {
                vars: vec![time.to_owned()],
            })?;
        let time = Term::variable(time, domain)?;
        construct(TermKind::MarkovProduct {
            sum_op,
            prod_op,
            trans: trans.clone(),
            time,
            step: sorted_pairs(step.to_vec()),
            step_names: sorted_pairs(step_names),
        })
    }

    // ── Methods ─────────────────────────────────────────────────────

    /// Reduces over `vars` with `op`. An empty set returns `self`; names that
    /// are not inputs are an error.
    pub fn reduce<I, S>(&self, op: Op, vars: I) -> Result<Term, TermError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let reduced: BTreeSet<String> = vars.into_iter().map(|v| v.as_ref().to_owned()).collect();
        if reduced.is_empty() {
            return Ok(self.clone());
        }
        Term::reduction(op, self, reduced)
    }

    pub fn reduce_all(&self, op: Op) -> Result<Term, TermError> {
        self.reduce(op, self.inputs().names().map(str::to_owned).collect::<Vec<_>>())
    }

    /// Substitutes each bound name that is an input of `self`; other names
    /// are ignored.
    pub fn subs<I, S>(&self, bindings: I) -> Result<Term, TermError>
    where
        I: IntoIterator<Item = (S, Term)>,
        S: Into<String>,
    {
        let subs: Vec<(String, Term)> = bindings
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .filter(|(name, _)| self.inputs().contains(name))
            .collect();
        if subs.is_empty() {
            return Ok(self.clone());
        }
        Term::substitution(self, subs)
    }

    /// Renames inputs by substituting fresh variables of the same domain.
    pub fn rename<I, A, B>(&self, pairs: I) -> Result<Term, TermError>
    where
        I: IntoIterator<Item = (A, B)>,
        A: AsRef<str>,
        B: Into<String>,
    {
        let mut subs = Vec::new();
        for (old, new) in pairs {
            let old = old.as_ref();
            let new = new.into();
            if old == new {
                continue;
            }
            if let Some(domain) = self.inputs().get(old) {
                subs.push((old.to_owned(), Term::variable(new, domain.clone())?));
            }
        }
        self.subs(subs)
    }

    /// Indexes the bounded input `name` at `index`.
    pub fn at(&self, name: &str, index: usize) -> Result<Term, TermError> {
        let Some(domain) = self.inputs().get(name) else {
            return Ok(self.clone());
        };
        let size = domain.size().ok_or_else(|| TermError::Unsupported {
            detail: format!("cannot index non-integer input {name}: {domain}"),
        })?;
        self.subs([(name, Term::int(index, size)?)])
    }

    /// Reorders inputs so that `names` come first.
    pub fn align<S: AsRef<str>>(&self, names: &[S]) -> Result<Term, TermError> {
        let names: Vec<String> = names
            .iter()
            .map(|name| name.as_ref().to_owned())
            .filter(|name| self.inputs().contains(name))
            .collect();
        if names.iter().map(String::as_str).eq(self.inputs().names().take(names.len())) {
            return Ok(self.clone());
        }
        construct(TermKind::Align {
            arg: self.clone(),
            names,
        })
    }

    pub fn apply(&self, op: Op) -> Result<Term, TermError> {
        Term::unary(op, self)
    }

    pub fn combine(&self, op: Op, other: &Term) -> Result<Term, TermError> {
        Term::binary(op, self, other)
    }

    pub fn combine_number(&self, op: Op, value: f64) -> Result<Term, TermError> {
        Term::binary(op, self, &Term::number(value)?)
    }

    pub fn add(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::Add, other)
    }

    pub fn sub(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::Sub, other)
    }

    pub fn mul(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::Mul, other)
    }

    pub fn div(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::Div, other)
    }

    pub fn pow(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::Pow, other)
    }

    pub fn logaddexp(&self, other: &Term) -> Result<Term, TermError> {
        self.combine(Op::LogAddExp, other)
    }

    pub fn neg(&self) -> Result<Term, TermError> {
        self.apply(Op::Neg)
    }

    pub fn exp(&self) -> Result<Term, TermError> {
        self.apply(Op::Exp)
    }

    pub fn log(&self) -> Result<Term, TermError> {
        self.apply(Op::Log)
    }

    pub fn log1p(&self) -> Result<Term, TermError> {
        self.apply(Op::Log1p)
    }

    pub fn abs(&self) -> Result<Term, TermError> {
        self.apply(Op::Abs)
    }

    pub fn sqrt(&self) -> Result<Term, TermError> {
        self.apply(Op::Sqrt)
    }

    /// Left fold of `terms` under `op`; the op's unit when `terms` is empty.
    pub fn fold(op: Op, terms: &[Term]) -> Result<Term, TermError> {
        let Some((first, rest)) = terms.split_first() else {
            return Term::unit(op);
        };
        rest.iter()
            .try_fold(first.clone(), |acc, term| acc.combine(op, term))
    }
}
