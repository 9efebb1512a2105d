use ff_core::TermError;
use ff_sum_product::SumProductError;

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    InvalidEquation { equation: String, detail: String },
    OperandCount { expected: usize, actual: usize },
    UnknownBackend { name: String },
    Unsupported { detail: String },
    Term(TermError),
    SumProduct(SumProductError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEquation { equation, detail } => {
                write!(f, "invalid einsum equation {equation:?}: {detail}")
            }
            Self::OperandCount { expected, actual } => {
                write!(f, "equation names {expected} operands, got {actual}")
            }
            Self::UnknownBackend { name } => write!(f, "unknown einsum backend: {name}"),
            Self::Unsupported { detail } => write!(f, "unsupported: {detail}"),
            Self::Term(err) => write!(f, "term error: {err}"),
            Self::SumProduct(err) => write!(f, "sum-product error: {err}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<TermError> for ApiError {
    fn from(value: TermError) -> Self {
        Self::Term(value)
    }
}

impl From<SumProductError> for ApiError {
    fn from(value: SumProductError) -> Self {
        Self::SumProduct(value)
    }
}
