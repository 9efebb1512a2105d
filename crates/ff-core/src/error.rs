use crate::array::ArrayError;
use crate::domain::{Domain, DomainError};
use crate::term::TermTag;

#[derive(Debug, Clone, PartialEq)]
pub enum TermError {
    Domain(DomainError),
    Array(ArrayError),
    InputConflict {
        name: String,
        existing: Domain,
        incoming: Domain,
    },
    ReducedVarsNotSubset {
        vars: Vec<String>,
    },
    SubstitutionType {
        name: String,
        expected: Domain,
        actual: Domain,
    },
    UnknownSubstitution {
        name: String,
    },
    TensorShape {
        detail: String,
    },
    StackMismatch {
        detail: String,
    },
    MissingPattern {
        interpretation: String,
        term: TermTag,
    },
    Backend {
        detail: String,
    },
    Unsupported {
        detail: String,
    },
}

impl std::fmt::Display for TermError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(err) => write!(f, "domain error: {err}"),
            Self::Array(err) => write!(f, "array error: {err}"),
            Self::InputConflict {
                name,
                existing,
                incoming,
            } => write!(
                f,
                "input {name} has conflicting domains {existing} and {incoming}"
            ),
            Self::ReducedVarsNotSubset { vars } => {
                write!(f, "reduced vars {vars:?} are not inputs of the term")
            }
            Self::SubstitutionType {
                name,
                expected,
                actual,
            } => write!(
                f,
                "expected substitution of {name} to have type {expected}, but got {actual}"
            ),
            Self::UnknownSubstitution { name } => {
                write!(f, "cannot substitute {name}: not an input of the term")
            }
            Self::TensorShape { detail } => write!(f, "tensor shape error: {detail}"),
            Self::StackMismatch { detail } => write!(f, "stack mismatch: {detail}"),
            Self::MissingPattern {
                interpretation,
                term,
            } => write!(
                f,
                "{interpretation} has no rule for {}\n\
                 This is most likely due to a missing pattern.",
                term.as_str()
            ),
            Self::Backend { detail } => write!(f, "backend evaluation failed: {detail}"),
            Self::Unsupported { detail } => write!(f, "unsupported: {detail}"),
        }
    }
}

impl std::error::Error for TermError {}

impl From<DomainError> for TermError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<ArrayError> for TermError {
    fn from(value: ArrayError) -> Self {
        Self::Array(value)
    }
}
