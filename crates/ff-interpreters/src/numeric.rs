//! Conversions between ground terms and named arrays.

use ff_core::{DenseArray, Domain, Dtype, Inputs, Term, TermError, TermKind};
use ff_lax::{NamedArray, arange};

/// Dense view of a ground term, or of a term that materializes cheaply: a
/// bounded-integer `Variable` or a `Slice` becomes its index range.
pub(crate) fn to_named(term: &Term) -> Result<Option<NamedArray>, TermError> {
    Ok(match term.kind() {
        TermKind::Number { value, .. } => Some(NamedArray::scalar(*value)),
        TermKind::Tensor { data, inputs, .. } => Some(NamedArray::new(
            data.clone(),
            inputs.names().map(str::to_owned).collect(),
        )?),
        TermKind::Variable { name, domain } => match domain.size() {
            Some(size) => Some(index_range(name, 0, size, 1)?),
            None => None,
        },
        TermKind::Slice {
            name,
            start,
            stop,
            step,
            ..
        } => Some(index_range(name, *start, *stop, *step)?),
        _ => None,
    })
}

pub(crate) fn index_range(
    name: &str,
    start: usize,
    stop: usize,
    step: usize,
) -> Result<NamedArray, TermError> {
    let values = arange(start, stop, step);
    let data = DenseArray::new(vec![values.len()], values)?;
    Ok(NamedArray::new(data, vec![name.to_owned()])?)
}

/// True when [`to_named`] succeeds without evaluating anything.
pub(crate) fn is_materializable(term: &Term) -> bool {
    match term.kind() {
        TermKind::Number { .. } | TermKind::Tensor { .. } | TermKind::Slice { .. } => true,
        TermKind::Variable { domain, .. } => domain.size().is_some(),
        _ => false,
    }
}

/// Builds the term holding `array`. Batch names become bounded inputs.
pub(crate) fn from_named(array: NamedArray, dtype: Dtype) -> Result<Term, TermError> {
    let sizes = array.batch_shape().to_vec();
    let inputs = Inputs::from_pairs(
        array
            .names()
            .iter()
            .cloned()
            .zip(sizes.into_iter().map(Domain::bint)),
    )?;
    Term::tensor_with_dtype(array.into_data(), inputs, dtype)
}

/// Like [`from_named`], but yields a `Number` for a closed scalar.
pub(crate) fn from_named_or_number(array: NamedArray, dtype: Dtype) -> Result<Term, TermError> {
    if array.names().is_empty() && array.data().shape().is_empty() {
        let value = array.elements().first().copied().unwrap_or(f64::NAN);
        return match dtype {
            Dtype::Real => Term::number(value),
            Dtype::Int(_) => ff_core::construct(TermKind::Number { value, dtype }),
        };
    }
    from_named(array, dtype)
}
