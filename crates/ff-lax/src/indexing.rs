use ff_core::DenseArray;

use crate::layout::{StridedWalk, build, source_strides, union_layout};
use crate::{LaxError, NamedArray};

fn checked_index(value: f64, name: &str, size: usize) -> Result<usize, LaxError> {
    if value.fract() != 0.0 || value < 0.0 || value >= size as f64 {
        return Err(LaxError::IndexOutOfRange {
            name: name.to_owned(),
            value,
            size,
        });
    }
    Ok(value as usize)
}

/// Replaces the batch axis `name` of `x` by the integer values of `index`.
///
/// The result's batch axes are those of `x` other than `name`, followed by
/// the names only `index` has. A name shared by `x` and `index` is read along
/// the diagonal.
pub fn gather(x: &NamedArray, name: &str, index: &NamedArray) -> Result<NamedArray, LaxError> {
    let axis = x.position(name).ok_or_else(|| LaxError::UnknownName {
        name: name.to_owned(),
    })?;
    let size = x.data().shape()[axis];
    let axis_stride = DenseArray::strides(x.data().shape())[axis];
    if !index.event_shape().is_empty() {
        return Err(LaxError::Broadcast {
            lhs: index.event_shape().to_vec(),
            rhs: Vec::new(),
        });
    }

    let mut names: Vec<String> = Vec::new();
    let mut shape: Vec<usize> = Vec::new();
    for (n, s) in x.names().iter().zip(x.batch_shape()) {
        if n != name {
            names.push(n.clone());
            shape.push(*s);
        }
    }
    for (n, s) in index.names().iter().zip(index.batch_shape()) {
        match names.iter().position(|m| m == n) {
            Some(k) if shape[k] != *s => {
                return Err(LaxError::SizeMismatch {
                    name: n.clone(),
                    lhs: shape[k],
                    rhs: *s,
                });
            }
            Some(_) => {}
            None => {
                names.push(n.clone());
                shape.push(*s);
            }
        }
    }
    let event = x.event_shape().to_vec();
    shape.extend_from_slice(&event);

    let base = StridedWalk::new(&shape, source_strides(x, &names, &event));
    let picks = StridedWalk::new(&shape, source_strides(index, &names, &event));
    let (values, positions) = (x.elements(), index.elements());
    let mut elements = Vec::with_capacity(shape.iter().product());
    for (offset, pick) in base.zip(picks) {
        let i = checked_index(positions[pick], name, size)?;
        elements.push(values[offset + i * axis_stride]);
    }
    build(names, shape, elements)
}

/// Writes `src` into `dst` at `positions` along the batch axis `name`.
///
/// `src` has `positions.len()` entries along `name`; other batch axes are
/// aligned by name and broadcast.
pub fn scatter(
    dst: &NamedArray,
    src: &NamedArray,
    name: &str,
    positions: &[usize],
) -> Result<NamedArray, LaxError> {
    let size = dst.size_of(name).ok_or_else(|| LaxError::UnknownName {
        name: name.to_owned(),
    })?;
    let src_size = src.size_of(name).unwrap_or(1);
    if src_size != positions.len() {
        return Err(LaxError::SizeMismatch {
            name: name.to_owned(),
            lhs: positions.len(),
            rhs: src_size,
        });
    }
    let mut slot = vec![None; size];
    for (i, p) in positions.iter().enumerate() {
        checked_index(*p as f64, name, size)?;
        slot[*p] = Some(i);
    }

    let both = [dst.clone(), src.clone()];
    let (mut names, mut sizes, event) = union_layout(&both, Some(name))?;
    names.insert(0, name.to_owned());
    sizes.insert(0, size);
    let mut shape = sizes;
    shape.extend_from_slice(&event);
    let dst_walk = StridedWalk::new(&shape, source_strides(dst, &names, &event));
    let mut src_strides = source_strides(src, &names, &event);
    let src_axis_stride = src_strides[0];
    src_strides[0] = 0;
    let src_walk = StridedWalk::new(&shape, src_strides);

    let block: usize = shape[1..].iter().product();
    let (d, s) = (dst.elements(), src.elements());
    let elements = dst_walk
        .zip(src_walk)
        .enumerate()
        .map(|(flat, (di, si))| match slot[flat / block.max(1)] {
            Some(i) => s[si + i * src_axis_stride],
            None => d[di],
        })
        .collect();
    build(names, shape, elements)
}

/// Values `start, start + step, ...` below `stop`.
#[must_use]
pub fn arange(start: usize, stop: usize, step: usize) -> Vec<f64> {
    (start..stop).step_by(step.max(1)).map(|v| v as f64).collect()
}
