//! Interned value domains.
//!
//! A [`Domain`] describes the shape and element kind of a term's value: either
//! a real array `Real[shape]` or a bounded integer `Bint[size]`. Domains are
//! interned process-wide, so two domains are the same allocation iff they are
//! structurally equal and equality is a pointer comparison.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::{Arc, Mutex, OnceLock};

use crate::ops::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dtype {
    Real,
    Int(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainSpec {
    pub dtype: Dtype,
    pub shape: SmallVec<[usize; 4]>,
}

#[derive(Clone)]
pub struct Domain(Arc<DomainSpec>);

fn interner() -> &'static Mutex<FxHashMap<DomainSpec, Arc<DomainSpec>>> {
    static DOMAINS: OnceLock<Mutex<FxHashMap<DomainSpec, Arc<DomainSpec>>>> = OnceLock::new();
    DOMAINS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

impl Domain {
    #[must_use]
    pub fn intern(spec: DomainSpec) -> Self {
        let mut table = interner()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = table.get(&spec) {
            return Self(Arc::clone(existing));
        }
        let shared = Arc::new(spec.clone());
        table.insert(spec, Arc::clone(&shared));
        Self(shared)
    }

    /// Scalar real domain, `Real`.
    #[must_use]
    pub fn real() -> Self {
        Self::reals(&[])
    }

    #[must_use]
    pub fn reals(shape: &[usize]) -> Self {
        Self::intern(DomainSpec {
            dtype: Dtype::Real,
            shape: SmallVec::from_slice(shape),
        })
    }

    #[must_use]
    pub fn bint(size: usize) -> Self {
        Self::intern(DomainSpec {
            dtype: Dtype::Int(size),
            shape: SmallVec::new(),
        })
    }

    #[must_use]
    pub fn from_dtype(dtype: Dtype, shape: &[usize]) -> Self {
        Self::intern(DomainSpec {
            dtype,
            shape: SmallVec::from_slice(shape),
        })
    }

    #[must_use]
    pub fn spec(&self) -> &DomainSpec {
        &self.0
    }

    #[must_use]
    pub fn dtype(&self) -> Dtype {
        self.0.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    #[must_use]
    pub fn is_real(&self) -> bool {
        self.0.dtype == Dtype::Real
    }

    /// Size of a scalar bounded-integer domain.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self.0.dtype {
            Dtype::Int(size) if self.0.shape.is_empty() => Some(size),
            _ => None,
        }
    }

    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.0.shape.iter().product()
    }

    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Domain {}

impl std::hash::Hash for Domain {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for Domain {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Domain {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.0.dtype, self.0.shape.is_empty()) {
            (Dtype::Real, true) => write!(f, "Real"),
            (Dtype::Real, false) => write!(f, "Reals{:?}", self.0.shape.as_slice()),
            (Dtype::Int(size), true) => write!(f, "Bint[{size}]"),
            (Dtype::Int(size), false) => {
                write!(f, "Bint[{size}]{:?}", self.0.shape.as_slice())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    Arity {
        op: Op,
        expected: usize,
        actual: usize,
    },
    ShapeMismatch {
        op: Op,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    DtypeMismatch {
        op: Op,
        lhs: Dtype,
        rhs: Dtype,
    },
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Arity {
                op,
                expected,
                actual,
            } => write!(
                f,
                "op {} expects {} domains, got {}",
                op.as_str(),
                expected,
                actual
            ),
            Self::ShapeMismatch { op, lhs, rhs } => write!(
                f,
                "op {} cannot broadcast shapes {:?} and {:?}",
                op.as_str(),
                lhs,
                rhs
            ),
            Self::DtypeMismatch { op, lhs, rhs } => write!(
                f,
                "op {} cannot combine dtypes {:?} and {:?}",
                op.as_str(),
                lhs,
                rhs
            ),
        }
    }
}

impl std::error::Error for DomainError {}

/// Right-aligned numpy-style broadcast of two shapes.
#[must_use]
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![1; rank];
    for (i, slot) in out.iter_mut().enumerate() {
        let l = lhs
            .len()
            .checked_sub(rank - i)
            .map_or(1, |offset| lhs[offset]);
        let r = rhs
            .len()
            .checked_sub(rank - i)
            .map_or(1, |offset| rhs[offset]);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

/// Infers the output domain of applying `op` to `domains`.
pub fn find_domain(op: Op, domains: &[Domain]) -> Result<Domain, DomainError> {
    match domains {
        [arg] => {
            let dtype = match op {
                Op::Exp | Op::Log | Op::Log1p | Op::Sqrt | Op::Reciprocal | Op::Sigmoid => {
                    Dtype::Real
                }
                _ => arg.dtype(),
            };
            if op.is_associative() {
                // Unary application of an associative op reduces the event shape.
                return Ok(Domain::from_dtype(dtype, &[]));
            }
            Ok(Domain::from_dtype(dtype, arg.shape()))
        }
        [lhs, rhs] => {
            let dtype = match (lhs.dtype(), rhs.dtype()) {
                (Dtype::Real, _) | (_, Dtype::Real) => match op {
                    Op::Eq | Op::And | Op::Or => Dtype::Int(2),
                    _ => Dtype::Real,
                },
                (Dtype::Int(l), Dtype::Int(r)) => match op {
                    Op::Add | Op::Mul | Op::Pow | Op::Max | Op::Min => {
                        let combined =
                            op.apply_binary(l.saturating_sub(1) as f64, r.saturating_sub(1) as f64);
                        Dtype::Int(combined.max(0.0) as usize + 1)
                    }
                    Op::And | Op::Or | Op::Eq => Dtype::Int(2),
                    _ if l == r => Dtype::Int(l),
                    _ => {
                        return Err(DomainError::DtypeMismatch {
                            op,
                            lhs: lhs.dtype(),
                            rhs: rhs.dtype(),
                        });
                    }
                },
            };
            let shape = if lhs.shape() == rhs.shape() {
                lhs.shape().to_vec()
            } else {
                broadcast_shape(lhs.shape(), rhs.shape()).ok_or_else(|| {
                    DomainError::ShapeMismatch {
                        op,
                        lhs: lhs.shape().to_vec(),
                        rhs: rhs.shape().to_vec(),
                    }
                })?
            };
            Ok(Domain::from_dtype(dtype, &shape))
        }
        _ => Err(DomainError::Arity {
            op,
            expected: 2,
            actual: domains.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_domains_share_one_allocation() {
        let a = Domain::reals(&[2, 3]);
        let b = Domain::reals(&[2, 3]);
        assert!(a.same_object(&b));
        assert_eq!(a, b);
        assert_ne!(a, Domain::reals(&[3, 2]));
        assert_eq!(Domain::bint(5), Domain::bint(5));
        assert_ne!(Domain::bint(5), Domain::bint(4));
    }

    #[test]
    fn display_matches_domain_kind() {
        assert_eq!(Domain::real().to_string(), "Real");
        assert_eq!(Domain::reals(&[2]).to_string(), "Reals[2]");
        assert_eq!(Domain::bint(3).to_string(), "Bint[3]");
        assert_eq!(Domain::bint(3).size(), Some(3));
        assert_eq!(Domain::real().size(), None);
    }

    #[test]
    fn find_domain_broadcasts_and_promotes() {
        let out = find_domain(Op::Add, &[Domain::reals(&[3, 1]), Domain::reals(&[4])])
            .expect("broadcast should succeed");
        assert_eq!(out, Domain::reals(&[3, 4]));

        let out = find_domain(Op::Add, &[Domain::bint(3), Domain::bint(4)])
            .expect("bint add should succeed");
        assert_eq!(out, Domain::bint(6));

        let out = find_domain(Op::Exp, &[Domain::bint(3)]).expect("exp should succeed");
        assert_eq!(out, Domain::real());

        let out = find_domain(Op::LogAddExp, &[Domain::reals(&[5])])
            .expect("unary associative reduces event shape");
        assert_eq!(out, Domain::real());
    }

    #[test]
    fn find_domain_rejects_incompatible_shapes() {
        let err = find_domain(Op::Mul, &[Domain::reals(&[2]), Domain::reals(&[3])])
            .expect_err("shapes 2 and 3 should not broadcast");
        assert!(matches!(err, DomainError::ShapeMismatch { .. }));
        assert!(err.to_string().contains("broadcast"));
    }
}
