use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of an array buffer. Cons-hashing and memoization
/// key arrays by this identity rather than by their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayId(pub u64);

fn next_array_id() -> ArrayId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ArrayId(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug)]
struct ArrayData {
    id: ArrayId,
    shape: Vec<usize>,
    elements: Vec<f64>,
}

/// Immutable row-major dense array of `f64`. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct DenseArray(Rc<ArrayData>);

impl DenseArray {
    pub fn new(shape: Vec<usize>, elements: Vec<f64>) -> Result<Self, ArrayError> {
        let expected = shape
            .iter()
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| ArrayError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        if expected != elements.len() {
            return Err(ArrayError::ElementCountMismatch {
                shape,
                expected,
                actual: elements.len(),
            });
        }
        Ok(Self(Rc::new(ArrayData {
            id: next_array_id(),
            shape,
            elements,
        })))
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self(Rc::new(ArrayData {
            id: next_array_id(),
            shape: Vec::new(),
            elements: vec![value],
        }))
    }

    pub fn full(shape: Vec<usize>, value: f64) -> Result<Self, ArrayError> {
        let count = shape
            .iter()
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| ArrayError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        Self::new(shape, vec![value; count])
    }

    #[must_use]
    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.shape.len()
    }

    #[must_use]
    pub fn elements(&self) -> &[f64] {
        &self.0.elements
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.elements.is_empty()
    }

    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Row-major strides of `shape`.
    #[must_use]
    pub fn strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for axis in (0..shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * shape[axis + 1];
        }
        strides
    }

    /// Elementwise comparison within `tol`, requiring identical shapes.
    #[must_use]
    pub fn allclose(&self, other: &Self, tol: f64) -> bool {
        self.shape() == other.shape()
            && self
                .elements()
                .iter()
                .zip(other.elements())
                .all(|(a, b)| close(*a, *b, tol))
    }
}

fn close(a: f64, b: f64, tol: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_nan() || b.is_nan() || a.is_infinite() || b.is_infinite() {
        return false;
    }
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    ShapeOverflow {
        shape: Vec<usize>,
    },
    ElementCountMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for ArrayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {shape:?}")
            }
            Self::ElementCountMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "array element count mismatch for shape {shape:?}: \
                 expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for ArrayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_element_count() {
        let err = DenseArray::new(vec![2, 2], vec![1.0; 3]).expect_err("3 != 4 should fail");
        assert_eq!(
            err,
            ArrayError::ElementCountMismatch {
                shape: vec![2, 2],
                expected: 4,
                actual: 3,
            }
        );
    }

    #[test]
    fn every_buffer_gets_a_fresh_identity() {
        let a = DenseArray::new(vec![2], vec![1.0, 2.0]).expect("array should build");
        let b = DenseArray::new(vec![2], vec![1.0, 2.0]).expect("array should build");
        assert_ne!(a.id(), b.id());
        assert!(a.allclose(&b, 0.0));
        let c = a.clone();
        assert_eq!(a.id(), c.id());
        assert!(a.same_buffer(&c));
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(DenseArray::strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(DenseArray::strides(&[]).is_empty());
    }
}
