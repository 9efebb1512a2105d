//! Categorical sampling of tensor inputs and the Monte Carlo interpretation.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use ff_core::{
    DenseArray, Dtype, Interpretation, Op, Prioritized, Term, TermError, TermKind, TermTag,
};
use ff_lax::NamedArray;
use ff_lax::threefry::{SampleKey, categorical};

use crate::dispatch::{OpPattern, Pattern, StatefulInterpretation};
use crate::numeric::{from_named_or_number, to_named};

/// Draws the bounded inputs `vars` of the log-weight tensor `term`.
///
/// The result is `Delta(v, sample_v) + ... + logsumexp(term, vars)`: each
/// sampled name is bound to its draw, one draw per batch element, and the
/// total mass of `term` over `vars` is kept. Names that are not bounded
/// inputs of `term` are ignored.
pub fn sample(term: &Term, vars: &BTreeSet<String>, key: SampleKey) -> Result<Term, TermError> {
    let Some((points, total)) = draw(term, vars, key)? else {
        return Ok(term.clone());
    };
    let mut terms = Vec::with_capacity(points.len() + 1);
    for (name, point) in points {
        terms.push(Term::delta(name, &point, &Term::number(0.0)?)?);
    }
    terms.push(total);
    Term::fold(Op::Add, &terms)
}

/// Sampled point per drawn name, plus the log total mass over those names.
type Draw = (Vec<(String, Term)>, Term);

fn draw(term: &Term, vars: &BTreeSet<String>, key: SampleKey) -> Result<Option<Draw>, TermError> {
    let Some((_, inputs, dtype)) = term.as_tensor() else {
        return Err(TermError::Unsupported {
            detail: format!("cannot sample from {}", term.tag().as_str()),
        });
    };
    if dtype != Dtype::Real || !term.output().shape().is_empty() {
        return Err(TermError::Unsupported {
            detail: format!("sampling needs real scalar log weights, got {}", term.output()),
        });
    }
    let mut sampled: Vec<(String, usize)> = Vec::new();
    let mut batch: Vec<(String, usize)> = Vec::new();
    for (name, domain) in inputs.iter() {
        match domain.size() {
            Some(size) if vars.contains(name) => sampled.push((name.to_owned(), size)),
            Some(size) => batch.push((name.to_owned(), size)),
            None => {
                return Err(TermError::Unsupported {
                    detail: format!("tensor input {name} is not bounded"),
                });
            }
        }
    }
    if sampled.is_empty() {
        return Ok(None);
    }

    let x = to_named(term)?.ok_or_else(|| TermError::Unsupported {
        detail: "tensor has no dense view".to_owned(),
    })?;
    let order: Vec<String> = batch
        .iter()
        .chain(&sampled)
        .map(|(name, _)| name.clone())
        .collect();
    let laid_out = ff_lax::permute(&x, &order)?;
    let categories: usize = sampled.iter().map(|(_, size)| size).product();
    let draws = categorical(key, laid_out.elements(), categories)?;
    tracing::debug!(
        sampled = sampled.len(),
        batch = draws.len(),
        "drew categorical samples"
    );

    let batch_names: Vec<String> = batch.iter().map(|(name, _)| name.clone()).collect();
    let batch_shape: Vec<usize> = batch.iter().map(|(_, size)| *size).collect();
    let mut points = Vec::with_capacity(sampled.len());
    let mut stride = categories;
    for (name, size) in &sampled {
        stride /= size;
        let values: Vec<f64> = draws
            .iter()
            .map(|draw| ((draw / stride) % size) as f64)
            .collect();
        let data = DenseArray::new(batch_shape.clone(), values)?;
        let array = NamedArray::new(data, batch_names.clone())?;
        points.push((name.clone(), from_named_or_number(array, Dtype::Int(*size))?));
    }
    let reduced: BTreeSet<String> = sampled.into_iter().map(|(name, _)| name).collect();
    let total = ff_lax::reduce_names(Op::LogAddExp, &x, &reduced)?;
    Ok(Some((points, from_named_or_number(total, Dtype::Real)?)))
}

// ── Monte Carlo ─────────────────────────────────────────────────────

/// Parameters of [`monte_carlo`]: the base key and how many draws it has
/// made so far.
#[derive(Debug)]
pub struct MonteCarloState {
    key: SampleKey,
    draws: Cell<u32>,
}

impl MonteCarloState {
    #[must_use]
    pub fn new(key: SampleKey) -> Self {
        Self {
            key,
            draws: Cell::new(0),
        }
    }

    #[must_use]
    pub fn draws(&self) -> u32 {
        self.draws.get()
    }

    fn next_key(&self) -> SampleKey {
        let draw = self.draws.get();
        self.draws.set(draw.wrapping_add(1));
        self.key.fold_in(draw)
    }
}

/// Replaces a log-space integral `logsumexp_vars(measure + f)` by a single
/// draw from `measure`, so the contraction evaluates `f` at the sample.
fn monte_carlo_contraction(
    state: &MonteCarloState,
    kind: &TermKind,
) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op: Op::LogAddExp,
        bin_op: Op::Add,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    let bounded: BTreeSet<String> = terms
        .iter()
        .flat_map(|term| {
            term.inputs()
                .iter()
                .filter(|(name, domain)| reduced_vars.contains(*name) && domain.size().is_some())
                .map(|(name, _)| name.to_owned())
                .collect::<Vec<_>>()
        })
        .collect();
    if bounded.is_empty() {
        return Ok(None);
    }
    let Some(pos) = terms.iter().position(|term| {
        term.as_tensor().is_some() && bounded.iter().all(|var| term.inputs().contains(var))
    }) else {
        return Ok(None);
    };
    let Some((points, total)) = draw(&terms[pos], &bounded, state.next_key())? else {
        return Ok(None);
    };
    let mut rebuilt = vec![total];
    for (other, term) in terms.iter().enumerate() {
        if other != pos {
            rebuilt.push(term.subs(points.iter().cloned())?);
        }
    }
    let remaining: BTreeSet<String> = reduced_vars
        .difference(&bounded)
        .filter(|var| rebuilt.iter().any(|term| term.inputs().contains(var)))
        .cloned()
        .collect();
    let red_op = if remaining.is_empty() {
        Op::Null
    } else {
        Op::LogAddExp
    };
    Term::contraction(red_op, Op::Add, remaining, rebuilt).map(Some)
}

/// Single-sample Monte Carlo estimates of log-space integrals over bounded
/// names, then eager evaluation. Draws are a pure function of `seed` and
/// their order.
#[must_use]
pub fn monte_carlo(seed: u64) -> Rc<dyn Interpretation> {
    let state = MonteCarloState::new(SampleKey::from_seed(seed));
    let sampler = StatefulInterpretation::new("monte_carlo", state);
    sampler.register(
        Pattern::new(TermTag::Contraction).op(OpPattern::Exactly(Op::Add)),
        monte_carlo_contraction,
    );
    Rc::new(Prioritized::new([
        Rc::new(sampler) as Rc<dyn Interpretation>,
        crate::eager(),
    ]))
}
