//! Rebuilding a term graph under the active interpretation.
//!
//! Both strategies visit every distinct subterm once, children before
//! parents, and rebuild each node from its already-rebuilt children.
//! The recursive walk uses the call stack; the worklist walk keeps an
//! explicit stack and is safe for arbitrarily deep graphs.

use std::cell::Cell;
use std::sync::OnceLock;

use ff_core::{Term, TermDigest, TermError, construct};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinterpretStrategy {
    Recursive,
    Worklist,
}

static DEFAULT_STRATEGY: OnceLock<ReinterpretStrategy> = OnceLock::new();

thread_local! {
    static STRATEGY_OVERRIDE: Cell<Option<ReinterpretStrategy>> = const { Cell::new(None) };
}

fn default_strategy() -> ReinterpretStrategy {
    *DEFAULT_STRATEGY.get_or_init(|| match std::env::var("FF_USE_WORKLIST") {
        Ok(value) if value.trim() != "0" => ReinterpretStrategy::Worklist,
        _ => ReinterpretStrategy::Recursive,
    })
}

/// The strategy [`reinterpret`] uses on this thread.
#[must_use]
pub fn reinterpret_strategy() -> ReinterpretStrategy {
    STRATEGY_OVERRIDE
        .with(Cell::get)
        .unwrap_or_else(default_strategy)
}

/// Overrides the strategy for this thread; `None` restores the default.
pub fn set_reinterpret_strategy(strategy: Option<ReinterpretStrategy>) {
    STRATEGY_OVERRIDE.with(|slot| slot.set(strategy));
}

struct StrategyGuard(Option<ReinterpretStrategy>);

impl Drop for StrategyGuard {
    fn drop(&mut self) {
        let previous = self.0;
        let _ = STRATEGY_OVERRIDE.try_with(|slot| slot.set(previous));
    }
}

pub fn with_reinterpret_strategy<R>(strategy: ReinterpretStrategy, f: impl FnOnce() -> R) -> R {
    let _guard = StrategyGuard(STRATEGY_OVERRIDE.with(|slot| slot.replace(Some(strategy))));
    f()
}

/// Rebuilds `term` under the active interpretation.
pub fn reinterpret(term: &Term) -> Result<Term, TermError> {
    match reinterpret_strategy() {
        ReinterpretStrategy::Recursive => reinterpret_recursive(term),
        ReinterpretStrategy::Worklist => reinterpret_worklist(term),
    }
}

pub fn reinterpret_recursive(term: &Term) -> Result<Term, TermError> {
    let mut memo = FxHashMap::default();
    recurse(term, &mut memo)
}

fn recurse(term: &Term, memo: &mut FxHashMap<TermDigest, Term>) -> Result<Term, TermError> {
    if let Some(done) = memo.get(&term.digest()) {
        return Ok(done.clone());
    }
    let kind = term.kind().map_children(|child| recurse(child, memo))?;
    let rebuilt = construct(kind)?;
    tracing::trace!(term = term.tag().as_str(), "reinterpreted");
    memo.insert(term.digest(), rebuilt.clone());
    Ok(rebuilt)
}

/// Children-first order of the distinct subterms of `root`.
fn postorder(root: &Term) -> Vec<Term> {
    let mut order = Vec::new();
    let mut expanded: FxHashSet<TermDigest> = FxHashSet::default();
    let mut stack = vec![(root.clone(), false)];
    while let Some((term, children_done)) = stack.pop() {
        if children_done {
            order.push(term);
            continue;
        }
        if !expanded.insert(term.digest()) {
            continue;
        }
        let children: Vec<Term> = term.kind().children().into_iter().cloned().collect();
        stack.push((term, true));
        for child in children.into_iter().rev() {
            if !expanded.contains(&child.digest()) {
                stack.push((child, false));
            }
        }
    }
    order
}

pub fn reinterpret_worklist(term: &Term) -> Result<Term, TermError> {
    let mut rebuilt: FxHashMap<TermDigest, Term> = FxHashMap::default();
    for node in postorder(term) {
        let kind = node.kind().map_children(|child| {
            rebuilt
                .get(&child.digest())
                .cloned()
                .ok_or_else(|| TermError::Unsupported {
                    detail: format!("child {} visited after its parent", child.short_id()),
                })
        })?;
        let result = construct(kind)?;
        tracing::trace!(term = node.tag().as_str(), "reinterpreted");
        rebuilt.insert(node.digest(), result);
    }
    rebuilt
        .remove(&term.digest())
        .ok_or_else(|| TermError::Unsupported {
            detail: "worklist never reached the root".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{eager, lazy};
    use ff_core::{DenseArray, Domain, Inputs, Op, TermTag, with_interpretation};
    use ff_test_utils::property_test_case_count;
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};

    fn lazy_expression(values: &[f64]) -> Term {
        with_interpretation(lazy(), || {
            let data = DenseArray::new(vec![values.len()], values.to_vec())?;
            let inputs = Inputs::from_pairs([("i", Domain::bint(values.len()))])?;
            let x = Term::tensor(data, inputs)?;
            let shifted = x.add(&Term::number(1.0)?)?;
            shifted.mul(&x)?.exp()?.reduce(Op::LogAddExp, ["i"])
        })
        .expect("lazy expression should build")
    }

    #[test]
    fn lazy_graph_stays_symbolic_until_reinterpreted() {
        let expr = lazy_expression(&[0.0, 1.0, 2.0]);
        assert_eq!(expr.tag(), TermTag::Reduce);
        let value = with_interpretation(eager(), || reinterpret(&expr))
            .expect("eager reinterpretation should evaluate");
        let expected = [0.0_f64, 2.0, 6.0]
            .iter()
            .map(|v| v.exp().exp())
            .sum::<f64>()
            .ln();
        let got = value.item().expect("closed scalar");
        assert!((got - expected).abs() < 1e-9, "{got} vs {expected}");
    }

    #[test]
    fn reinterpretation_is_idempotent_under_reflect() {
        let expr = lazy_expression(&[0.5, -0.5]);
        let once = reinterpret(&expr).expect("reflect rebuild");
        assert!(once.ptr_eq(&expr));
        let twice = reinterpret(&once).expect("reflect rebuild");
        assert!(twice.ptr_eq(&once));
    }

    #[test]
    fn reinterpretation_is_idempotent_under_eager() {
        let partial = with_interpretation(eager(), || {
            let data = DenseArray::new(vec![3], vec![0.5, 1.0, 1.5])?;
            let x = Term::tensor(data, Inputs::from_pairs([("i", Domain::bint(3))])?)?;
            let v = Term::variable("v", Domain::real())?;
            x.add(&v)?.exp()?.reduce(Op::Add, ["i"])
        })
        .expect("partial expression should build");
        assert!(partial.inputs().contains("v"));
        let once = with_interpretation(eager(), || reinterpret(&partial)).expect("eager rebuild");
        assert!(once.ptr_eq(&partial));
        let twice = with_interpretation(eager(), || reinterpret(&once)).expect("eager rebuild");
        assert!(twice.ptr_eq(&once));
    }

    #[test]
    fn strategy_override_is_scoped() {
        let before = reinterpret_strategy();
        let inside = with_reinterpret_strategy(ReinterpretStrategy::Worklist, reinterpret_strategy);
        assert_eq!(inside, ReinterpretStrategy::Worklist);
        assert_eq!(reinterpret_strategy(), before);
    }

    #[test]
    fn deep_chains_reinterpret_without_recursion() {
        let expr = with_interpretation(lazy(), || {
            let x = Term::variable("x", Domain::real())?;
            let mut acc = x.clone();
            for _ in 0..2_000 {
                acc = acc.neg()?;
            }
            Ok::<_, TermError>(acc)
        })
        .expect("chain should build");
        let rebuilt = reinterpret_worklist(&expr).expect("worklist handles deep graphs");
        assert!(rebuilt.ptr_eq(&expr));
    }

    #[test]
    fn deep_symbolic_chains_build_under_eager() {
        let chain = |depth: usize| -> Result<Term, TermError> {
            let mut acc = Term::variable("x", Domain::real())?;
            for _ in 0..depth {
                acc = acc.exp()?.neg()?;
            }
            Ok(acc)
        };
        let direct = with_interpretation(eager(), || chain(1_000)).expect("eager chain");
        let deferred = with_interpretation(lazy(), || chain(1_000)).expect("lazy chain");
        let rebuilt = with_interpretation(eager(), || reinterpret_worklist(&deferred))
            .expect("worklist rebuild under eager");
        assert!(rebuilt.ptr_eq(&direct));
    }

    #[test]
    fn strategies_agree_on_eager_results() {
        let mut runner = TestRunner::new(ProptestConfig::with_cases(property_test_case_count()));
        runner
            .run(&proptest::collection::vec(-3.0_f64..3.0, 1..6), |values| {
                let expr = lazy_expression(&values);
                let recursive = with_interpretation(eager(), || reinterpret_recursive(&expr))
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                let worklist = with_interpretation(eager(), || reinterpret_worklist(&expr))
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                let (a, b) = (recursive.item(), worklist.item());
                prop_assert!(a.is_some() && b.is_some());
                prop_assert!((a.unwrap_or_default() - b.unwrap_or_default()).abs() < 1e-12);
                Ok(())
            })
            .expect("strategies should agree");
    }
}
