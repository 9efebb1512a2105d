//! Term graph nodes and cons-hashed reflection.
//!
//! Every node is an immutable [`TermNode`] behind an `Rc`. Nodes are interned
//! in a per-thread table keyed by a SHA-256 digest of the variant and its
//! arguments. Child terms contribute their own digest and dense arrays
//! contribute their buffer identity, so building the same variant from the
//! same arguments twice returns the same allocation. The table only holds weak
//! references; a node lives exactly as long as some caller holds it.

use rustc_hash::FxHashMap;
use sha2::{Digest as _, Sha256};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use crate::array::DenseArray;
use crate::domain::{Domain, Dtype, find_domain};
use crate::error::TermError;
use crate::ops::{Op, OpArity};

pub type TermDigest = [u8; 32];

// ── Inputs ──────────────────────────────────────────────────────────

/// Ordered mapping from free-variable name to its domain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inputs {
    entries: Vec<(String, Domain)>,
}

impl Inputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, TermError>
    where
        I: IntoIterator<Item = (S, Domain)>,
        S: Into<String>,
    {
        let mut inputs = Self::new();
        for (name, domain) in pairs {
            inputs.insert(name, domain)?;
        }
        Ok(inputs)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, domain)| domain)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(key, _)| key == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Domain)> {
        self.entries
            .iter()
            .map(|(name, domain)| (name.as_str(), domain))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn name_set(&self) -> BTreeSet<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Inserts `name`, accepting a repeat only when the domain agrees.
    pub fn insert(&mut self, name: impl Into<String>, domain: Domain) -> Result<(), TermError> {
        let name = name.into();
        match self.get(&name) {
            Some(existing) if *existing == domain => Ok(()),
            Some(existing) => Err(TermError::InputConflict {
                name,
                existing: existing.clone(),
                incoming: domain,
            }),
            None => {
                self.entries.push((name, domain));
                Ok(())
            }
        }
    }

    pub fn merge(&mut self, other: &Inputs) -> Result<(), TermError> {
        for (name, domain) in other.iter() {
            self.insert(name, domain.clone())?;
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Domain> {
        let index = self.position(name)?;
        Some(self.entries.remove(index).1)
    }

    #[must_use]
    pub fn without(&self, names: &BTreeSet<String>) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| !names.contains(name))
                .cloned()
                .collect(),
        }
    }

    /// Sizes of the inputs, all of which must be scalar bounded integers.
    pub fn bint_sizes(&self) -> Result<Vec<usize>, TermError> {
        self.entries
            .iter()
            .map(|(name, domain)| {
                domain.size().ok_or_else(|| TermError::TensorShape {
                    detail: format!("tensor input {name} has non-integer domain {domain}"),
                })
            })
            .collect()
    }
}

impl std::fmt::Display for Inputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (name, domain)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {domain}")?;
        }
        f.write_str("}")
    }
}

// ── Term kinds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermTag {
    Variable,
    Number,
    Tensor,
    Unary,
    Binary,
    Reduce,
    Contraction,
    Subs,
    Stack,
    Cat,
    Slice,
    Align,
    Delta,
    MarkovProduct,
}

impl TermTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Variable => "Variable",
            Self::Number => "Number",
            Self::Tensor => "Tensor",
            Self::Unary => "Unary",
            Self::Binary => "Binary",
            Self::Reduce => "Reduce",
            Self::Contraction => "Contraction",
            Self::Subs => "Subs",
            Self::Stack => "Stack",
            Self::Cat => "Cat",
            Self::Slice => "Slice",
            Self::Align => "Align",
            Self::Delta => "Delta",
            Self::MarkovProduct => "MarkovProduct",
        }
    }
}

/// Constructor arguments of one term variant. This is the payload every
/// interpretation receives and the verbatim AST a reflected node stores.
#[derive(Debug, Clone)]
pub enum TermKind {
    Variable {
        name: String,
        domain: Domain,
    },
    Number {
        value: f64,
        dtype: Dtype,
    },
    /// Dense leaf whose leading axes correspond to `inputs` in order and whose
    /// trailing axes form the output shape.
    Tensor {
        data: DenseArray,
        inputs: Inputs,
        dtype: Dtype,
    },
    Unary {
        op: Op,
        arg: Term,
    },
    Binary {
        op: Op,
        lhs: Term,
        rhs: Term,
    },
    Reduce {
        op: Op,
        arg: Term,
        reduced_vars: BTreeSet<String>,
    },
    /// Flattened `red_op`-reduction of a `bin_op`-product. Either op may be
    /// [`Op::Null`] when absent.
    Contraction {
        red_op: Op,
        bin_op: Op,
        reduced_vars: BTreeSet<String>,
        terms: Vec<Term>,
    },
    /// Bindings are kept sorted by name.
    Subs {
        arg: Term,
        subs: Vec<(String, Term)>,
    },
    Stack {
        name: String,
        parts: Vec<Term>,
    },
    Cat {
        name: String,
        parts: Vec<Term>,
        part_name: String,
    },
    /// The index range `start..stop` by `step`, as a term with input `name`
    /// over a `Bint[dtype]` output.
    Slice {
        name: String,
        start: usize,
        stop: usize,
        step: usize,
        dtype: usize,
    },
    Align {
        arg: Term,
        names: Vec<String>,
    },
    /// Log-density `log_density` concentrated at `name == point`.
    Delta {
        name: String,
        point: Term,
        log_density: Term,
    },
    /// Step pairs are kept sorted.
    MarkovProduct {
        sum_op: Op,
        prod_op: Op,
        trans: Term,
        time: Term,
        step: Vec<(String, String)>,
        step_names: Vec<(String, String)>,
    },
}

impl TermKind {
    #[must_use]
    pub fn tag(&self) -> TermTag {
        match self {
            Self::Variable { .. } => TermTag::Variable,
            Self::Number { .. } => TermTag::Number,
            Self::Tensor { .. } => TermTag::Tensor,
            Self::Unary { .. } => TermTag::Unary,
            Self::Binary { .. } => TermTag::Binary,
            Self::Reduce { .. } => TermTag::Reduce,
            Self::Contraction { .. } => TermTag::Contraction,
            Self::Subs { .. } => TermTag::Subs,
            Self::Stack { .. } => TermTag::Stack,
            Self::Cat { .. } => TermTag::Cat,
            Self::Slice { .. } => TermTag::Slice,
            Self::Align { .. } => TermTag::Align,
            Self::Delta { .. } => TermTag::Delta,
            Self::MarkovProduct { .. } => TermTag::MarkovProduct,
        }
    }

    /// Child terms in argument order. Leaves have none.
    #[must_use]
    pub fn children(&self) -> SmallVec<[&Term; 4]> {
        let mut out = SmallVec::new();
        match self {
            Self::Variable { .. }
            | Self::Number { .. }
            | Self::Tensor { .. }
            | Self::Slice { .. } => {}
            Self::Unary { arg, .. }
            | Self::Reduce { arg, .. }
            | Self::Align { arg, .. } => out.push(arg),
            Self::Binary { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            Self::Contraction { terms, .. } => out.extend(terms.iter()),
            Self::Subs { arg, subs } => {
                out.push(arg);
                out.extend(subs.iter().map(|(_, value)| value));
            }
            Self::Stack { parts, .. } | Self::Cat { parts, .. } => out.extend(parts.iter()),
            Self::Delta {
                point, log_density, ..
            } => {
                out.push(point);
                out.push(log_density);
            }
            Self::MarkovProduct { trans, time, .. } => {
                out.push(trans);
                out.push(time);
            }
        }
        out
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Self::Variable { .. } | Self::Number { .. } | Self::Tensor { .. } | Self::Slice { .. }
        )
    }

    /// Rebuilds the same variant with each child replaced by `f(child)`,
    /// visiting children in [`TermKind::children`] order.
    pub fn map_children<E, F>(&self, mut f: F) -> Result<TermKind, E>
    where
        F: FnMut(&Term) -> Result<Term, E>,
    {
        Ok(match self {
            Self::Variable { .. }
            | Self::Number { .. }
            | Self::Tensor { .. }
            | Self::Slice { .. } => self.clone(),
            Self::Unary { op, arg } => Self::Unary {
                op: *op,
                arg: f(arg)?,
            },
            Self::Binary { op, lhs, rhs } => {
                let lhs = f(lhs)?;
                let rhs = f(rhs)?;
                Self::Binary { op: *op, lhs, rhs }
            }
            Self::Reduce {
                op,
                arg,
                reduced_vars,
            } => Self::Reduce {
                op: *op,
                arg: f(arg)?,
                reduced_vars: reduced_vars.clone(),
            },
            Self::Contraction {
                red_op,
                bin_op,
                reduced_vars,
                terms,
            } => Self::Contraction {
                red_op: *red_op,
                bin_op: *bin_op,
                reduced_vars: reduced_vars.clone(),
                terms: terms.iter().map(&mut f).collect::<Result<_, _>>()?,
            },
            Self::Subs { arg, subs } => {
                let arg = f(arg)?;
                let subs = subs
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), f(value)?)))
                    .collect::<Result<_, _>>()?;
                Self::Subs { arg, subs }
            }
            Self::Stack { name, parts } => Self::Stack {
                name: name.clone(),
                parts: parts.iter().map(&mut f).collect::<Result<_, _>>()?,
            },
            Self::Cat {
                name,
                parts,
                part_name,
            } => Self::Cat {
                name: name.clone(),
                parts: parts.iter().map(&mut f).collect::<Result<_, _>>()?,
                part_name: part_name.clone(),
            },
            Self::Align { arg, names } => Self::Align {
                arg: f(arg)?,
                names: names.clone(),
            },
            Self::Delta {
                name,
                point,
                log_density,
            } => {
                let point = f(point)?;
                let log_density = f(log_density)?;
                Self::Delta {
                    name: name.clone(),
                    point,
                    log_density,
                }
            }
            Self::MarkovProduct {
                sum_op,
                prod_op,
                trans,
                time,
                step,
                step_names,
            } => {
                let trans = f(trans)?;
                let time = f(time)?;
                Self::MarkovProduct {
                    sum_op: *sum_op,
                    prod_op: *prod_op,
                    trans,
                    time,
                    step: step.clone(),
                    step_names: step_names.clone(),
                }
            }
        })
    }

    /// Content digest used as the cons-hash key.
    #[must_use]
    pub fn digest(&self) -> TermDigest {
        let mut w = DigestWriter::new(self.tag());
        match self {
            Self::Variable { name, domain } => {
                w.str(name);
                w.domain(domain);
            }
            Self::Number { value, dtype } => {
                w.f64(*value);
                w.dtype(*dtype);
            }
            Self::Tensor {
                data,
                inputs,
                dtype,
            } => {
                w.u64(data.id().0);
                w.u64(inputs.len() as u64);
                for (name, domain) in inputs.iter() {
                    w.str(name);
                    w.domain(domain);
                }
                w.dtype(*dtype);
            }
            Self::Unary { op, arg } => {
                w.op(*op);
                w.term(arg);
            }
            Self::Binary { op, lhs, rhs } => {
                w.op(*op);
                w.term(lhs);
                w.term(rhs);
            }
            Self::Reduce {
                op,
                arg,
                reduced_vars,
            } => {
                w.op(*op);
                w.term(arg);
                w.names(reduced_vars.iter());
            }
            Self::Contraction {
                red_op,
                bin_op,
                reduced_vars,
                terms,
            } => {
                w.op(*red_op);
                w.op(*bin_op);
                w.names(reduced_vars.iter());
                w.u64(terms.len() as u64);
                for term in terms {
                    w.term(term);
                }
            }
            Self::Subs { arg, subs } => {
                w.term(arg);
                w.u64(subs.len() as u64);
                for (name, value) in subs {
                    w.str(name);
                    w.term(value);
                }
            }
            Self::Stack { name, parts } => {
                w.str(name);
                w.u64(parts.len() as u64);
                for part in parts {
                    w.term(part);
                }
            }
            Self::Cat {
                name,
                parts,
                part_name,
            } => {
                w.str(name);
                w.str(part_name);
                w.u64(parts.len() as u64);
                for part in parts {
                    w.term(part);
                }
            }
            Self::Slice {
                name,
                start,
                stop,
                step,
                dtype,
            } => {
                w.str(name);
                for value in [start, stop, step, dtype] {
                    w.u64(*value as u64);
                }
            }
            Self::Align { arg, names } => {
                w.term(arg);
                w.names(names.iter());
            }
            Self::Delta {
                name,
                point,
                log_density,
            } => {
                w.str(name);
                w.term(point);
                w.term(log_density);
            }
            Self::MarkovProduct {
                sum_op,
                prod_op,
                trans,
                time,
                step,
                step_names,
            } => {
                w.op(*sum_op);
                w.op(*prod_op);
                w.term(trans);
                w.term(time);
                w.pairs(step);
                w.pairs(step_names);
            }
        }
        w.finish()
    }

    /// Derives `(inputs, output)` from the arguments, rejecting ill-typed
    /// combinations.
    pub fn infer_type(&self) -> Result<(Inputs, Domain), TermError> {
        match self {
            Self::Variable { name, domain } => {
                Ok((Inputs::from_pairs([(name.clone(), domain.clone())])?, domain.clone()))
            }
            Self::Number { dtype, .. } => Ok((Inputs::new(), Domain::from_dtype(*dtype, &[]))),
            Self::Tensor {
                data,
                inputs,
                dtype,
            } => {
                let sizes = inputs.bint_sizes()?;
                let shape = data.shape();
                if shape.len() < sizes.len() || shape[..sizes.len()] != sizes[..] {
                    return Err(TermError::TensorShape {
                        detail: format!(
                            "array shape {shape:?} does not start with input sizes {sizes:?}"
                        ),
                    });
                }
                Ok((
                    inputs.clone(),
                    Domain::from_dtype(*dtype, &shape[sizes.len()..]),
                ))
            }
            Self::Unary { op, arg } => {
                if op.arity() != OpArity::Unary && !op.is_associative() {
                    return Err(TermError::Unsupported {
                        detail: format!("{op} is not a unary op"),
                    });
                }
                let output = find_domain(*op, &[arg.output().clone()])?;
                Ok((arg.inputs().clone(), output))
            }
            Self::Binary { op, lhs, rhs } => {
                if op.arity() != OpArity::Binary {
                    return Err(TermError::Unsupported {
                        detail: format!("{op} is not a binary op"),
                    });
                }
                let output = find_domain(*op, &[lhs.output().clone(), rhs.output().clone()])?;
                let mut inputs = lhs.inputs().clone();
                inputs.merge(rhs.inputs())?;
                Ok((inputs, output))
            }
            Self::Reduce {
                op,
                arg,
                reduced_vars,
            } => {
                if !op.is_associative() {
                    return Err(TermError::Unsupported {
                        detail: format!("cannot reduce over non-associative op {op}"),
                    });
                }
                check_subset(reduced_vars, arg.inputs())?;
                Ok((arg.inputs().without(reduced_vars), arg.output().clone()))
            }
            Self::Contraction {
                red_op,
                bin_op,
                reduced_vars,
                terms,
            } => {
                if !red_op.is_associative() || !bin_op.is_associative() {
                    return Err(TermError::Unsupported {
                        detail: format!(
                            "contraction requires associative ops, got {red_op}/{bin_op}"
                        ),
                    });
                }
                let mut inputs = Inputs::new();
                for term in terms {
                    inputs.merge(term.inputs())?;
                }
                check_subset(reduced_vars, &inputs)?;
                let output = match terms.split_first() {
                    None => Domain::real(),
                    Some((first, rest)) => {
                        if *bin_op == Op::Null && !rest.is_empty() {
                            return Err(TermError::Unsupported {
                                detail: "contraction of several terms needs a product op"
                                    .to_owned(),
                            });
                        }
                        let mut output = first.output().clone();
                        for term in rest {
                            output = find_domain(*bin_op, &[output, term.output().clone()])?;
                        }
                        output
                    }
                };
                Ok((inputs.without(reduced_vars), output))
            }
            Self::Subs { arg, subs } => {
                for (name, value) in subs {
                    let expected = arg
                        .inputs()
                        .get(name)
                        .ok_or_else(|| TermError::UnknownSubstitution { name: name.clone() })?;
                    if value.output() != expected {
                        return Err(TermError::SubstitutionType {
                            name: name.clone(),
                            expected: expected.clone(),
                            actual: value.output().clone(),
                        });
                    }
                }
                let mut inputs = Inputs::new();
                for (name, domain) in arg.inputs().iter() {
                    match subs.iter().find(|(key, _)| key == name) {
                        Some((_, value)) => inputs.merge(value.inputs())?,
                        None => inputs.insert(name, domain.clone())?,
                    }
                }
                Ok((inputs, arg.output().clone()))
            }
            Self::Stack { name, parts } => {
                let first = parts.first().ok_or_else(|| TermError::StackMismatch {
                    detail: format!("stack over {name} has no parts"),
                })?;
                let mut inputs = Inputs::from_pairs([(name.clone(), Domain::bint(parts.len()))])?;
                for part in parts {
                    if part.output() != first.output() {
                        return Err(TermError::StackMismatch {
                            detail: format!(
                                "parts have outputs {} and {}",
                                first.output(),
                                part.output()
                            ),
                        });
                    }
                    if part.inputs().contains(name) {
                        return Err(TermError::StackMismatch {
                            detail: format!("part already has input {name}"),
                        });
                    }
                    inputs.merge(part.inputs())?;
                }
                Ok((inputs, first.output().clone()))
            }
            Self::Cat {
                name,
                parts,
                part_name,
            } => {
                let first = parts.first().ok_or_else(|| TermError::StackMismatch {
                    detail: format!("cat over {name} has no parts"),
                })?;
                let mut total = 0_usize;
                let mut merged = Inputs::new();
                for part in parts {
                    let size = part
                        .inputs()
                        .get(part_name)
                        .and_then(Domain::size)
                        .ok_or_else(|| TermError::StackMismatch {
                            detail: format!("cat part lacks bounded input {part_name}"),
                        })?;
                    total += size;
                    if part.output() != first.output() {
                        return Err(TermError::StackMismatch {
                            detail: format!(
                                "parts have outputs {} and {}",
                                first.output(),
                                part.output()
                            ),
                        });
                    }
                    for (key, domain) in part.inputs().iter() {
                        if key != part_name {
                            merged.insert(key, domain.clone())?;
                        } else if !merged.contains(name) {
                            merged.insert(name.clone(), Domain::bint(0))?;
                        }
                    }
                }
                let mut inputs = Inputs::new();
                for (key, domain) in merged.iter() {
                    if key == name {
                        inputs.insert(name.clone(), Domain::bint(total))?;
                    } else {
                        inputs.insert(key, domain.clone())?;
                    }
                }
                Ok((inputs, first.output().clone()))
            }
            Self::Slice {
                name,
                start,
                stop,
                step,
                dtype,
            } => {
                if *step == 0 || start > stop || *stop > *dtype {
                    return Err(TermError::Unsupported {
                        detail: format!("invalid slice {start}..{stop} by {step} of {dtype}"),
                    });
                }
                let size = (stop - start).div_ceil(*step);
                Ok((
                    Inputs::from_pairs([(name.clone(), Domain::bint(size))])?,
                    Domain::bint(*dtype),
                ))
            }
            Self::Align { arg, names } => {
                let mut inputs = Inputs::new();
                for name in names {
                    let domain = arg
                        .inputs()
                        .get(name)
                        .ok_or_else(|| TermError::ReducedVarsNotSubset {
                            vars: vec![name.clone()],
                        })?;
                    inputs.insert(name.clone(), domain.clone())?;
                }
                inputs.merge(arg.inputs())?;
                Ok((inputs, arg.output().clone()))
            }
            Self::Delta {
                name,
                point,
                log_density,
            } => {
                if *log_density.output() != Domain::real() {
                    return Err(TermError::SubstitutionType {
                        name: format!("{name} log density"),
                        expected: Domain::real(),
                        actual: log_density.output().clone(),
                    });
                }
                let mut inputs = Inputs::from_pairs([(name.clone(), point.output().clone())])?;
                inputs.merge(point.inputs())?;
                inputs.merge(log_density.inputs())?;
                Ok((inputs, Domain::real()))
            }
            Self::MarkovProduct {
                sum_op,
                prod_op,
                trans,
                time,
                step,
                step_names,
            } => {
                if !sum_op.distributes_over(*prod_op) {
                    return Err(TermError::Unsupported {
                        detail: format!("{sum_op} does not distribute over {prod_op}"),
                    });
                }
                let TermKind::Variable { name: time_name, .. } = time.kind() else {
                    return Err(TermError::Unsupported {
                        detail: "markov product time must be a variable".to_owned(),
                    });
                };
                if !trans.inputs().contains(time_name) {
                    return Err(TermError::ReducedVarsNotSubset {
                        vars: vec![time_name.clone()],
                    });
                }
                let named: BTreeSet<&str> = step_names.iter().map(|(k, _)| k.as_str()).collect();
                let stepped: BTreeSet<&str> = step
                    .iter()
                    .flat_map(|(prev, curr)| [prev.as_str(), curr.as_str()])
                    .collect();
                if named != stepped {
                    return Err(TermError::Unsupported {
                        detail: "step names must cover exactly the stepped variables".to_owned(),
                    });
                }
                let mut inputs = Inputs::new();
                for (name, domain) in trans.inputs().iter() {
                    if name == time_name {
                        continue;
                    }
                    let renamed = step_names
                        .iter()
                        .find(|(key, _)| key == name)
                        .map_or(name, |(_, value)| value.as_str());
                    inputs.insert(renamed, domain.clone())?;
                }
                Ok((inputs, trans.output().clone()))
            }
        }
    }
}

fn check_subset(vars: &BTreeSet<String>, inputs: &Inputs) -> Result<(), TermError> {
    let missing: Vec<String> = vars
        .iter()
        .filter(|name| !inputs.contains(name))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TermError::ReducedVarsNotSubset { vars: missing })
    }
}

struct DigestWriter(Sha256);

impl DigestWriter {
    fn new(tag: TermTag) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([tag as u8]);
        Self(hasher)
    }

    fn u64(&mut self, value: u64) {
        self.0.update(value.to_le_bytes());
    }

    fn f64(&mut self, value: f64) {
        self.u64(value.to_bits());
    }

    fn str(&mut self, value: &str) {
        self.u64(value.len() as u64);
        self.0.update(value.as_bytes());
    }

    fn names<'a>(&mut self, names: impl ExactSizeIterator<Item = &'a String>) {
        self.u64(names.len() as u64);
        for name in names {
            self.str(name);
        }
    }

    fn pairs(&mut self, pairs: &[(String, String)]) {
        self.u64(pairs.len() as u64);
        for (a, b) in pairs {
            self.str(a);
            self.str(b);
        }
    }

    fn op(&mut self, op: Op) {
        self.str(op.as_str());
    }

    fn dtype(&mut self, dtype: Dtype) {
        match dtype {
            Dtype::Real => self.0.update([0_u8]),
            Dtype::Int(size) => {
                self.0.update([1_u8]);
                self.u64(size as u64);
            }
        }
    }

    fn domain(&mut self, domain: &Domain) {
        self.dtype(domain.dtype());
        self.u64(domain.shape().len() as u64);
        for dim in domain.shape() {
            self.u64(*dim as u64);
        }
    }

    fn term(&mut self, term: &Term) {
        self.0.update(term.digest());
    }

    fn finish(self) -> TermDigest {
        self.0.finalize().into()
    }
}

// ── Nodes ───────────────────────────────────────────────────────────

pub struct TermNode {
    kind: TermKind,
    inputs: Inputs,
    output: Domain,
    digest: TermDigest,
}

/// Shared handle to an interned term. Equality is node identity, which the
/// cons table makes equivalent to structural equality of arguments.
#[derive(Clone)]
pub struct Term(Rc<TermNode>);

impl Term {
    #[must_use]
    pub fn kind(&self) -> &TermKind {
        &self.0.kind
    }

    #[must_use]
    pub fn tag(&self) -> TermTag {
        self.0.kind.tag()
    }

    #[must_use]
    pub fn inputs(&self) -> &Inputs {
        &self.0.inputs
    }

    #[must_use]
    pub fn output(&self) -> &Domain {
        &self.0.output
    }

    #[must_use]
    pub fn digest(&self) -> TermDigest {
        self.0.digest
    }

    /// Short hex prefix of the digest, for logs.
    #[must_use]
    pub fn short_id(&self) -> String {
        self.0.digest[..6]
            .iter()
            .fold(String::with_capacity(12), |mut out, byte| {
                let _ = write!(out, "{byte:02x}");
                out
            })
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Term) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn is_ground(&self) -> bool {
        self.0.kind.is_leaf() && !matches!(self.0.kind, TermKind::Variable { .. })
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match &self.0.kind {
            TermKind::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<(&DenseArray, &Inputs, Dtype)> {
        match &self.0.kind {
            TermKind::Tensor {
                data,
                inputs,
                dtype,
            } => Some((data, inputs, *dtype)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_variable(&self) -> Option<(&str, &Domain)> {
        match &self.0.kind {
            TermKind::Variable { name, domain } => Some((name, domain)),
            _ => None,
        }
    }

    /// The single value of a closed scalar term.
    #[must_use]
    pub fn item(&self) -> Option<f64> {
        match &self.0.kind {
            TermKind::Number { value, .. } => Some(*value),
            TermKind::Tensor { data, inputs, .. } if inputs.is_empty() && data.len() == 1 => {
                data.elements().first().copied()
            }
            _ => None,
        }
    }

    /// Indented multi-line rendering of the term tree.
    #[must_use]
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(0, &mut out);
        out
    }

    fn write_pretty(&self, indent: usize, out: &mut String) {
        let pad = "  ".repeat(indent);
        let _ = writeln!(out, "{pad}{}", self.header());
        for child in self.kind().children() {
            child.write_pretty(indent + 1, out);
        }
    }

    fn header(&self) -> String {
        match self.kind() {
            TermKind::Variable { name, domain } => format!("Variable({name}, {domain})"),
            TermKind::Number { value, dtype } => match dtype {
                Dtype::Real => format!("Number({value})"),
                Dtype::Int(size) => format!("Number({value}, {size})"),
            },
            TermKind::Tensor { data, inputs, .. } => {
                format!("Tensor({:?}, {inputs}) -> {}", data.shape(), self.output())
            }
            TermKind::Unary { op, .. } => format!("Unary({op})"),
            TermKind::Binary { op, .. } => format!("Binary({op})"),
            TermKind::Reduce {
                op, reduced_vars, ..
            } => format!("Reduce({op}, {reduced_vars:?})"),
            TermKind::Contraction {
                red_op,
                bin_op,
                reduced_vars,
                ..
            } => format!("Contraction({red_op}, {bin_op}, {reduced_vars:?})"),
            TermKind::Subs { subs, .. } => {
                let names: Vec<&str> = subs.iter().map(|(name, _)| name.as_str()).collect();
                format!("Subs({names:?})")
            }
            TermKind::Stack { name, .. } => format!("Stack({name})"),
            TermKind::Cat {
                name, part_name, ..
            } => format!("Cat({name}, {part_name})"),
            TermKind::Slice {
                name,
                start,
                stop,
                step,
                dtype,
            } => format!("Slice({name}, {start}, {stop}, {step}, {dtype})"),
            TermKind::Align { names, .. } => format!("Align({names:?})"),
            TermKind::Delta { name, .. } => format!("Delta({name})"),
            TermKind::MarkovProduct {
                sum_op,
                prod_op,
                step,
                ..
            } => format!("MarkovProduct({sum_op}, {prod_op}, {step:?})"),
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Term {}

impl std::hash::Hash for Term {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.0.digest[..8]);
    }
}

/// Canonical operand order: by content digest.
impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.digest.cmp(&other.0.digest)
    }
}

impl std::fmt::Debug for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.header(), self.short_id())
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.header().as_str())?;
        let children = self.kind().children();
        if !children.is_empty() {
            f.write_str("[")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{child}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

// ── Cons table ──────────────────────────────────────────────────────

const MIN_SWEEP_THRESHOLD: usize = 1024;

struct ConsTable {
    entries: FxHashMap<TermDigest, Weak<TermNode>>,
    sweep_at: usize,
}

impl ConsTable {
    fn lookup(&self, digest: &TermDigest) -> Option<Term> {
        self.entries.get(digest).and_then(Weak::upgrade).map(Term)
    }

    fn insert(&mut self, digest: TermDigest, node: &Rc<TermNode>) {
        self.entries.insert(digest, Rc::downgrade(node));
        if self.entries.len() > self.sweep_at {
            self.entries.retain(|_, weak| weak.strong_count() > 0);
            self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP_THRESHOLD);
        }
    }
}

thread_local! {
    static CONS_TABLE: RefCell<ConsTable> = RefCell::new(ConsTable {
        entries: FxHashMap::default(),
        sweep_at: MIN_SWEEP_THRESHOLD,
    });
}

/// Builds the node for `kind` verbatim, or returns the live node already
/// built from the same arguments.
pub fn reflect(kind: TermKind) -> Result<Term, TermError> {
    let digest = kind.digest();
    if let Some(existing) = CONS_TABLE.with(|table| table.borrow().lookup(&digest)) {
        return Ok(existing);
    }
    let (inputs, output) = kind.infer_type()?;
    let node = Rc::new(TermNode {
        kind,
        inputs,
        output,
        digest,
    });
    CONS_TABLE.with(|table| table.borrow_mut().insert(digest, &node));
    Ok(Term(node))
}

/// Number of cons-table entries whose term is still alive on this thread.
#[must_use]
pub fn live_term_count() -> usize {
    CONS_TABLE.with(|table| {
        table
            .borrow()
            .entries
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    })
}
