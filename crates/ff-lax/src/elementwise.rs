use ff_core::{Op, broadcast_shape};

use crate::layout::{StridedWalk, build, source_strides};
use crate::{LaxError, NamedArray};

/// Applies a binary op. Output batch axes are those of `lhs` followed by the
/// names only `rhs` has; event shapes broadcast right-aligned.
pub fn binary(op: Op, lhs: &NamedArray, rhs: &NamedArray) -> Result<NamedArray, LaxError> {
    let mut names = lhs.names().to_vec();
    let mut shape = lhs.batch_shape().to_vec();
    for (name, size) in rhs.names().iter().zip(rhs.batch_shape()) {
        match lhs.size_of(name) {
            Some(existing) if existing == *size => {}
            Some(existing) => {
                return Err(LaxError::SizeMismatch {
                    name: name.clone(),
                    lhs: existing,
                    rhs: *size,
                });
            }
            None => {
                names.push(name.clone());
                shape.push(*size);
            }
        }
    }
    let event =
        broadcast_shape(lhs.event_shape(), rhs.event_shape()).ok_or_else(|| LaxError::Broadcast {
            lhs: lhs.event_shape().to_vec(),
            rhs: rhs.event_shape().to_vec(),
        })?;
    shape.extend_from_slice(&event);

    let lhs_walk = StridedWalk::new(&shape, source_strides(lhs, &names, &event));
    let rhs_walk = StridedWalk::new(&shape, source_strides(rhs, &names, &event));
    let (a, b) = (lhs.elements(), rhs.elements());
    let elements = lhs_walk
        .zip(rhs_walk)
        .map(|(i, j)| op.apply_binary(a[i], b[j]))
        .collect();
    build(names, shape, elements)
}

/// Applies a unary op elementwise.
pub fn unary(op: Op, x: &NamedArray) -> Result<NamedArray, LaxError> {
    let elements = x.elements().iter().map(|v| op.apply_unary(*v)).collect();
    build(x.names().to_vec(), x.data().shape().to_vec(), elements)
}
