use std::collections::BTreeSet;

use ff_core::{DenseArray, Op};

use crate::layout::{StridedWalk, build};
use crate::{LaxError, NamedArray};

fn unit_of(op: Op) -> f64 {
    op.unit().unwrap_or(f64::NAN)
}

/// Reduces `values` grouped by `targets` into `len` slots. `LogAddExp` uses
/// a max-shifted two-pass sum.
fn grouped_reduce(op: Op, values: &[f64], targets: &[usize], len: usize) -> Vec<f64> {
    if op == Op::LogAddExp {
        let mut max = vec![f64::NEG_INFINITY; len];
        for (v, t) in values.iter().zip(targets) {
            if *v > max[*t] {
                max[*t] = *v;
            }
        }
        let mut sum = vec![0.0; len];
        for (v, t) in values.iter().zip(targets) {
            if max[*t].is_finite() {
                sum[*t] += (v - max[*t]).exp();
            }
        }
        return max
            .iter()
            .zip(&sum)
            .map(|(m, s)| if m.is_finite() { m + s.ln() } else { *m })
            .collect();
    }
    let mut acc = vec![unit_of(op); len];
    for (v, t) in values.iter().zip(targets) {
        acc[*t] = op.apply_binary(acc[*t], *v);
    }
    acc
}

/// Reduces the named batch axes in `vars` with the associative `op`.
pub fn reduce_names(
    op: Op,
    x: &NamedArray,
    vars: &BTreeSet<String>,
) -> Result<NamedArray, LaxError> {
    for var in vars {
        if x.position(var).is_none() {
            return Err(LaxError::UnknownName { name: var.clone() });
        }
    }
    let in_shape = x.data().shape();
    let mut out_names = Vec::new();
    let mut out_shape = Vec::new();
    let mut kept = vec![true; in_shape.len()];
    for (axis, name) in x.names().iter().enumerate() {
        if vars.contains(name) {
            kept[axis] = false;
        } else {
            out_names.push(name.clone());
            out_shape.push(in_shape[axis]);
        }
    }
    out_shape.extend_from_slice(x.event_shape());

    // Output stride of every input axis, zero for reduced ones.
    let out_strides = DenseArray::strides(&out_shape);
    let mut walk_strides = Vec::with_capacity(in_shape.len());
    let mut k = 0;
    for keep in &kept {
        if *keep {
            walk_strides.push(out_strides[k]);
            k += 1;
        } else {
            walk_strides.push(0);
        }
    }
    let targets: Vec<usize> = StridedWalk::new(in_shape, walk_strides).collect();
    let len = out_shape.iter().product();
    let elements = grouped_reduce(op, x.elements(), &targets, len);
    build(out_names, out_shape, elements)
}

/// Reduces every event axis, leaving batch axes untouched.
pub fn reduce_event(op: Op, x: &NamedArray) -> Result<NamedArray, LaxError> {
    let batch = x.batch_shape().to_vec();
    let event_len: usize = x.event_shape().iter().product();
    let targets: Vec<usize> = (0..x.elements().len())
        .map(|i| i / event_len.max(1))
        .collect();
    let len = batch.iter().product();
    let elements = grouped_reduce(op, x.elements(), &targets, len);
    build(x.names().to_vec(), batch, elements)
}
