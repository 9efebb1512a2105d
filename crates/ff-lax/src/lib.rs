#![forbid(unsafe_code)]

//! Dense kernels over arrays whose leading axes are named.
//!
//! A [`NamedArray`] pairs a [`DenseArray`] with the names of its leading
//! (batch) axes; the remaining trailing axes are the event shape. Binary ops
//! align batch axes by name and broadcast event axes right-aligned, so the
//! eager interpreter never has to reason about axis positions.

mod elementwise;
mod indexing;
mod layout;
mod reduction;
pub mod threefry;

use ff_core::{ArrayError, DenseArray, TermError};

pub use elementwise::{binary, unary};
pub use indexing::{arange, gather, scatter};
pub use layout::{align, concat, eye, permute, stack};
pub use reduction::{reduce_event, reduce_names};

#[derive(Debug, Clone, PartialEq)]
pub enum LaxError {
    Array(ArrayError),
    DuplicateName {
        name: String,
    },
    RankTooSmall {
        names: usize,
        rank: usize,
    },
    UnknownName {
        name: String,
    },
    SizeMismatch {
        name: String,
        lhs: usize,
        rhs: usize,
    },
    Broadcast {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    IndexOutOfRange {
        name: String,
        value: f64,
        size: usize,
    },
    EmptyParts,
}

impl std::fmt::Display for LaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array(err) => write!(f, "invalid array: {err}"),
            Self::DuplicateName { name } => write!(f, "axis name {name} appears twice"),
            Self::RankTooSmall { names, rank } => {
                write!(f, "{names} axis names for an array of rank {rank}")
            }
            Self::UnknownName { name } => write!(f, "no axis named {name}"),
            Self::SizeMismatch { name, lhs, rhs } => {
                write!(f, "axis {name} has sizes {lhs} and {rhs}")
            }
            Self::Broadcast { lhs, rhs } => {
                write!(f, "cannot broadcast event shapes {lhs:?} and {rhs:?}")
            }
            Self::IndexOutOfRange { name, value, size } => {
                write!(f, "index {value} out of range for axis {name} of size {size}")
            }
            Self::EmptyParts => write!(f, "no parts to combine"),
        }
    }
}

impl std::error::Error for LaxError {}

impl From<ArrayError> for LaxError {
    fn from(value: ArrayError) -> Self {
        Self::Array(value)
    }
}

impl From<LaxError> for TermError {
    fn from(value: LaxError) -> Self {
        TermError::Backend {
            detail: value.to_string(),
        }
    }
}

/// Dense array with named leading axes.
#[derive(Debug, Clone)]
pub struct NamedArray {
    data: DenseArray,
    names: Vec<String>,
}

impl NamedArray {
    pub fn new(data: DenseArray, names: Vec<String>) -> Result<Self, LaxError> {
        if names.len() > data.rank() {
            return Err(LaxError::RankTooSmall {
                names: names.len(),
                rank: data.rank(),
            });
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(LaxError::DuplicateName { name: name.clone() });
            }
        }
        Ok(Self { data, names })
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            data: DenseArray::scalar(value),
            names: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(&self) -> &DenseArray {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> DenseArray {
        self.data
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn elements(&self) -> &[f64] {
        self.data.elements()
    }

    #[must_use]
    pub fn batch_shape(&self) -> &[usize] {
        &self.data.shape()[..self.names.len()]
    }

    #[must_use]
    pub fn event_shape(&self) -> &[usize] {
        &self.data.shape()[self.names.len()..]
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    #[must_use]
    pub fn size_of(&self, name: &str) -> Option<usize> {
        self.position(name).map(|axis| self.data.shape()[axis])
    }
}
