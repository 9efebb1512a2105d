use ff_core::{DenseArray, broadcast_shape};

use crate::{LaxError, NamedArray};

/// Walks an output shape in row-major order, yielding the matching offset
/// into a source buffer. `strides[k]` is the source stride of output axis
/// `k`, or zero where the source is broadcast.
pub(crate) struct StridedWalk {
    shape: Vec<usize>,
    strides: Vec<usize>,
    index: Vec<usize>,
    offset: usize,
    remaining: usize,
}

impl StridedWalk {
    pub(crate) fn new(shape: &[usize], strides: Vec<usize>) -> Self {
        debug_assert_eq!(shape.len(), strides.len());
        Self {
            shape: shape.to_vec(),
            index: vec![0; shape.len()],
            strides,
            offset: 0,
            remaining: shape.iter().product(),
        }
    }
}

impl Iterator for StridedWalk {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.offset;
        for axis in (0..self.shape.len()).rev() {
            self.index[axis] += 1;
            self.offset += self.strides[axis];
            if self.index[axis] < self.shape[axis] {
                break;
            }
            self.offset -= self.strides[axis] * self.shape[axis];
            self.index[axis] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Strides of `src` laid over an output with batch names `out_names` and
/// event shape `out_event`. Missing names and size-1 axes broadcast.
pub(crate) fn source_strides(
    src: &NamedArray,
    out_names: &[String],
    out_event: &[usize],
) -> Vec<usize> {
    let shape = src.data().shape();
    let strides = DenseArray::strides(shape);
    let stride_of = |axis: usize| if shape[axis] == 1 { 0 } else { strides[axis] };
    let mut out = Vec::with_capacity(out_names.len() + out_event.len());
    for name in out_names {
        out.push(src.position(name).map_or(0, stride_of));
    }
    let src_event = src.event_shape();
    let pad = out_event.len().saturating_sub(src_event.len());
    for k in 0..out_event.len() {
        if k < pad {
            out.push(0);
        } else {
            out.push(stride_of(src.names().len() + k - pad));
        }
    }
    out
}

pub(crate) fn gather_elements(
    src: &NamedArray,
    out_shape: &[usize],
    strides: Vec<usize>,
) -> Vec<f64> {
    let elements = src.elements();
    StridedWalk::new(out_shape, strides)
        .map(|offset| elements[offset])
        .collect()
}

pub(crate) fn build(
    names: Vec<String>,
    shape: Vec<usize>,
    elements: Vec<f64>,
) -> Result<NamedArray, LaxError> {
    NamedArray::new(DenseArray::new(shape, elements)?, names)
}

/// Lays `x` out over batch axes `names` (with `sizes`) and event shape
/// `event`, broadcasting missing axes.
pub fn align(
    x: &NamedArray,
    names: &[String],
    sizes: &[usize],
    event: &[usize],
) -> Result<NamedArray, LaxError> {
    for (name, size) in x.names().iter().zip(x.batch_shape()) {
        match names.iter().position(|n| n == name) {
            None => return Err(LaxError::UnknownName { name: name.clone() }),
            Some(k) if sizes[k] != *size && *size != 1 => {
                return Err(LaxError::SizeMismatch {
                    name: name.clone(),
                    lhs: sizes[k],
                    rhs: *size,
                });
            }
            Some(_) => {}
        }
    }
    if broadcast_shape(x.event_shape(), event).as_deref() != Some(event) {
        return Err(LaxError::Broadcast {
            lhs: x.event_shape().to_vec(),
            rhs: event.to_vec(),
        });
    }
    let mut shape = sizes.to_vec();
    shape.extend_from_slice(event);
    let strides = source_strides(x, names, event);
    let elements = gather_elements(x, &shape, strides);
    build(names.to_vec(), shape, elements)
}

/// Reorders the batch axes of `x` to `order`, a permutation of its names.
pub fn permute(x: &NamedArray, order: &[String]) -> Result<NamedArray, LaxError> {
    if order.len() != x.names().len() {
        return Err(LaxError::RankTooSmall {
            names: order.len(),
            rank: x.names().len(),
        });
    }
    let sizes = order
        .iter()
        .map(|name| {
            x.size_of(name)
                .ok_or_else(|| LaxError::UnknownName { name: name.clone() })
        })
        .collect::<Result<Vec<_>, _>>()?;
    align(x, order, &sizes, x.event_shape())
}

/// Union of batch names and sizes over `parts`, in first-seen order, plus
/// the broadcast event shape.
pub(crate) fn union_layout(
    parts: &[NamedArray],
    skip: Option<&str>,
) -> Result<(Vec<String>, Vec<usize>, Vec<usize>), LaxError> {
    let mut names: Vec<String> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();
    let mut event: Vec<usize> = Vec::new();
    for part in parts {
        for (name, size) in part.names().iter().zip(part.batch_shape()) {
            if Some(name.as_str()) == skip {
                continue;
            }
            match names.iter().position(|n| n == name) {
                Some(k) if sizes[k] == 1 => sizes[k] = *size,
                Some(k) if sizes[k] != *size && *size != 1 => {
                    return Err(LaxError::SizeMismatch {
                        name: name.clone(),
                        lhs: sizes[k],
                        rhs: *size,
                    });
                }
                Some(_) => {}
                None => {
                    names.push(name.clone());
                    sizes.push(*size);
                }
            }
        }
        event = broadcast_shape(&event, part.event_shape()).ok_or_else(|| {
            LaxError::Broadcast {
                lhs: event.clone(),
                rhs: part.event_shape().to_vec(),
            }
        })?;
    }
    Ok((names, sizes, event))
}

/// Concatenates `parts` along their `part_name` axis into a leading axis
/// called `name`.
pub fn concat(parts: &[NamedArray], part_name: &str, name: &str) -> Result<NamedArray, LaxError> {
    if parts.is_empty() {
        return Err(LaxError::EmptyParts);
    }
    let (others, other_sizes, event) = union_layout(parts, Some(part_name))?;
    let mut total = 0;
    let mut elements = Vec::new();
    for part in parts {
        let size = part.size_of(part_name).ok_or_else(|| LaxError::UnknownName {
            name: part_name.to_owned(),
        })?;
        let mut names = vec![part_name.to_owned()];
        names.extend(others.iter().cloned());
        let mut sizes = vec![size];
        sizes.extend_from_slice(&other_sizes);
        let aligned = align(part, &names, &sizes, &event)?;
        elements.extend_from_slice(aligned.elements());
        total += size;
    }
    let mut names = vec![name.to_owned()];
    names.extend(others);
    let mut shape = vec![total];
    shape.extend(other_sizes);
    shape.extend(event);
    build(names, shape, elements)
}

/// Stacks `parts` along a new leading axis `name`.
pub fn stack(parts: &[NamedArray], name: &str) -> Result<NamedArray, LaxError> {
    if parts.is_empty() {
        return Err(LaxError::EmptyParts);
    }
    let (others, other_sizes, event) = union_layout(parts, None)?;
    let mut elements = Vec::new();
    for part in parts {
        let aligned = align(part, &others, &other_sizes, &event)?;
        elements.extend_from_slice(aligned.elements());
    }
    let mut names = vec![name.to_owned()];
    names.extend(others);
    let mut shape = vec![parts.len()];
    shape.extend(other_sizes);
    shape.extend(event);
    build(names, shape, elements)
}

/// `n x n` identity matrix.
pub fn eye(n: usize) -> Result<DenseArray, LaxError> {
    let mut elements = vec![0.0; n * n];
    for i in 0..n {
        elements[i * n + i] = 1.0;
    }
    Ok(DenseArray::new(vec![n, n], elements)?)
}
