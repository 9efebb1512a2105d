use serde::{Deserialize, Serialize};

/// Named operations the term model treats as opaque unary or binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Op {
    // Associative binary
    Add,
    Mul,
    LogAddExp,
    Max,
    Min,
    And,
    Or,
    /// Placeholder for an absent reduction or product in a `Contraction`.
    Null,
    // General binary
    Sub,
    Div,
    Pow,
    Eq,
    // Unary
    Neg,
    Exp,
    Log,
    Log1p,
    Abs,
    Sqrt,
    Reciprocal,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArity {
    Unary,
    Binary,
}

/// Pairs `(sum, product)` where the sum distributes over the product.
pub const DISTRIBUTIVE_OPS: [(Op, Op); 6] = [
    (Op::LogAddExp, Op::Add),
    (Op::Add, Op::Mul),
    (Op::Max, Op::Mul),
    (Op::Min, Op::Mul),
    (Op::Max, Op::Add),
    (Op::Min, Op::Add),
];

impl Op {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::LogAddExp => "logaddexp",
            Self::Max => "max",
            Self::Min => "min",
            Self::And => "and",
            Self::Or => "or",
            Self::Null => "nullop",
            Self::Sub => "sub",
            Self::Div => "truediv",
            Self::Pow => "pow",
            Self::Eq => "eq",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log1p => "log1p",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Reciprocal => "reciprocal",
            Self::Sigmoid => "sigmoid",
        }
    }

    #[must_use]
    pub fn arity(self) -> OpArity {
        match self {
            Self::Neg
            | Self::Exp
            | Self::Log
            | Self::Log1p
            | Self::Abs
            | Self::Sqrt
            | Self::Reciprocal
            | Self::Sigmoid => OpArity::Unary,
            _ => OpArity::Binary,
        }
    }

    #[must_use]
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Mul
                | Self::LogAddExp
                | Self::Max
                | Self::Min
                | Self::And
                | Self::Or
                | Self::Null
        )
    }

    /// Identity element used to seed empty folds and reductions.
    #[must_use]
    pub fn unit(self) -> Option<f64> {
        match self {
            Self::Add | Self::Or => Some(0.0),
            Self::Mul | Self::And => Some(1.0),
            Self::LogAddExp | Self::Max => Some(f64::NEG_INFINITY),
            Self::Min => Some(f64::INFINITY),
            _ => None,
        }
    }

    #[must_use]
    pub fn distributes_over(self, product: Op) -> bool {
        DISTRIBUTIVE_OPS.contains(&(self, product))
    }

    /// The `(associative op, unary inverse)` pattern a non-associative op
    /// rewrites to: `a - b == a + neg(b)` and `a / b == a * reciprocal(b)`.
    #[must_use]
    pub fn inverse_pattern(self) -> Option<(Op, Op)> {
        match self {
            Self::Sub => Some((Self::Add, Self::Neg)),
            Self::Div => Some((Self::Mul, Self::Reciprocal)),
            _ => None,
        }
    }

    /// Inverse of a binary associative op, used when solving `x op c == y` for `x`.
    #[must_use]
    pub fn binary_inverse(self) -> Option<Op> {
        match self {
            Self::Add => Some(Self::Sub),
            Self::Mul => Some(Self::Div),
            _ => None,
        }
    }

    /// Repeated application of the op `n` times to the same operand, where
    /// that has a closed form.
    #[must_use]
    pub fn power_op(self) -> Option<Op> {
        match self {
            Self::Add => Some(Self::Mul),
            Self::Mul => Some(Self::Pow),
            _ => None,
        }
    }

    #[must_use]
    pub fn apply_unary(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Log1p => x.ln_1p(),
            Self::Abs => x.abs(),
            Self::Sqrt => x.sqrt(),
            Self::Reciprocal => x.recip(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            _ => x,
        }
    }

    #[must_use]
    pub fn apply_binary(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Mul => a * b,
            Self::LogAddExp => logaddexp(a, b),
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::And => f64::from(a != 0.0 && b != 0.0),
            Self::Or => f64::from(a != 0.0 || b != 0.0),
            Self::Null => b,
            Self::Sub => a - b,
            Self::Div => a / b,
            Self::Pow => a.powf(b),
            Self::Eq => f64::from(a == b),
            Self::Neg
            | Self::Exp
            | Self::Log
            | Self::Log1p
            | Self::Abs
            | Self::Sqrt
            | Self::Reciprocal
            | Self::Sigmoid => f64::NAN,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numerically stable `log(exp(a) + exp(b))`.
#[must_use]
pub fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let hi = a.max(b);
    let lo = a.min(b);
    hi + (lo - hi).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_are_identities() {
        for op in [Op::Add, Op::Mul, Op::LogAddExp, Op::Max, Op::Min] {
            let unit = op.unit().expect("associative op should have a unit");
            for x in [-2.5, 0.0, 1.0, 7.25] {
                let y = op.apply_binary(unit, x);
                assert!((y - x).abs() < 1e-12, "{op} unit failed for {x}: {y}");
            }
        }
    }

    #[test]
    fn logaddexp_is_stable_for_large_inputs() {
        let y = logaddexp(1000.0, 1000.0);
        assert!((y - (1000.0 + std::f64::consts::LN_2)).abs() < 1e-9);
        assert_eq!(logaddexp(f64::NEG_INFINITY, 3.0), 3.0);
    }

    #[test]
    fn distributivity_table_covers_semirings() {
        assert!(Op::LogAddExp.distributes_over(Op::Add));
        assert!(Op::Add.distributes_over(Op::Mul));
        assert!(!Op::Mul.distributes_over(Op::Add));
        assert_eq!(Op::Sub.inverse_pattern(), Some((Op::Add, Op::Neg)));
        assert_eq!(Op::Div.inverse_pattern(), Some((Op::Mul, Op::Reciprocal)));
        assert_eq!(Op::Add.arity(), OpArity::Binary);
        assert_eq!(Op::Exp.arity(), OpArity::Unary);
    }
}
