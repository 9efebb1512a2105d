#![forbid(unsafe_code)]

//! Interpretations for frankenfunsor terms.
//!
//! The named interpretations are built once per thread from a handful of
//! rule tables and handed out as shared `Rc`s:
//!
//! | name              | rules tried first                    | then       |
//! |-------------------|--------------------------------------|------------|
//! | `lazy`            | substitution                         | reflect    |
//! | `eager`           | numeric, substitution, point masses  | normalized retry, reflect |
//! | `sequential`      | looped reductions, then `eager` rules | normalized retry, reflect |
//! | `moment_matching` | mixture collapse, then `eager` rules | normalized retry, reflect |
//! | `normalize`       | associative-commutative normal form  | reflect    |
//! | `simplify`        | constant folding                     | `normalize` |
//! | `optimize`        | contraction ordering                 | `eager`    |
//! | `die`             | none                                 | error      |
//! | `eager_or_die`    | `eager` rules                        | `die`      |

pub mod delta;
pub mod dispatch;
pub mod eager;
pub mod moment_matching;
pub mod normalize;
mod numeric;
pub mod optimizer;
pub mod reinterpret;
pub mod sample;
pub mod sequential;
pub mod subs;
pub mod wrappers;

use std::rc::Rc;

use ff_core::{Interpretation, Prioritized, Reflect};

pub use delta::solve;
pub use dispatch::{
    ArgPattern, Dispatched, Handler, OpPattern, Pattern, RuleTable, StatefulHandler,
    StatefulInterpretation,
};
pub use optimizer::{REAL_SIZE, apply_optimizer, greedy_path};
pub use reinterpret::{
    ReinterpretStrategy, reinterpret, reinterpret_recursive, reinterpret_strategy,
    reinterpret_worklist, set_reinterpret_strategy, with_reinterpret_strategy,
};
pub use sample::{MonteCarloState, monte_carlo, sample};
pub use wrappers::{Die, Memoize, Normalized, Simplify, memoize};

struct Registry {
    eager_rules: Rc<Dispatched>,
    optimize_rules: Rc<Dispatched>,
    eager: Rc<dyn Interpretation>,
    lazy: Rc<dyn Interpretation>,
    sequential: Rc<dyn Interpretation>,
    moment_matching: Rc<dyn Interpretation>,
    normalize: Rc<dyn Interpretation>,
    simplify: Rc<dyn Interpretation>,
    optimize: Rc<dyn Interpretation>,
    die: Rc<dyn Interpretation>,
    eager_or_die: Rc<dyn Interpretation>,
}

fn prioritized(members: Vec<Rc<dyn Interpretation>>) -> Rc<dyn Interpretation> {
    Rc::new(Prioritized::new(members))
}

impl Registry {
    fn build() -> Self {
        let reflect: Rc<dyn Interpretation> = Rc::new(Reflect);

        let normalize_rules = Dispatched::new("normalize");
        normalize::register(&normalize_rules);
        let normalize = prioritized(vec![
            Rc::new(normalize_rules) as Rc<dyn Interpretation>,
            reflect.clone(),
        ]);

        let simplify_rules = Dispatched::new("simplify");
        normalize::register_simplify(&simplify_rules);
        let simplify: Rc<dyn Interpretation> =
            Rc::new(Simplify::new(Rc::new(simplify_rules), normalize.clone()));

        let lazy_rules = Dispatched::new("lazy");
        subs::register(&lazy_rules);
        let lazy = prioritized(vec![
            Rc::new(lazy_rules) as Rc<dyn Interpretation>,
            reflect.clone(),
        ]);

        let eager_rules = Rc::new(Dispatched::new("eager"));
        eager::register(&eager_rules);
        subs::register(&eager_rules);
        delta::register(&eager_rules);

        // Rule sets that retry on the normal form before reflecting.
        let normalized = |rules: Rc<dyn Interpretation>| {
            let retry: Rc<dyn Interpretation> =
                Rc::new(Normalized::new(rules, normalize.clone(), simplify.clone()));
            prioritized(vec![retry, reflect.clone()])
        };
        let eager = normalized(eager_rules.clone() as Rc<dyn Interpretation>);

        let sequential_rules = Dispatched::new("sequential");
        sequential::register(&sequential_rules);
        let sequential = normalized(prioritized(vec![
            Rc::new(sequential_rules) as Rc<dyn Interpretation>,
            eager_rules.clone(),
        ]));

        let moment_rules = Dispatched::new("moment_matching");
        moment_matching::register(&moment_rules);
        let moment_matching = normalized(prioritized(vec![
            Rc::new(moment_rules) as Rc<dyn Interpretation>,
            eager_rules.clone(),
        ]));

        let optimize_rules = Rc::new(Dispatched::new("optimize"));
        optimizer::register(&optimize_rules);
        let optimize = prioritized(vec![
            optimize_rules.clone() as Rc<dyn Interpretation>,
            eager.clone(),
        ]);

        let die: Rc<dyn Interpretation> = Rc::new(Die);
        let eager_or_die = prioritized(vec![
            eager_rules.clone() as Rc<dyn Interpretation>,
            die.clone(),
        ]);

        Self {
            eager_rules,
            optimize_rules,
            eager,
            lazy,
            sequential,
            moment_matching,
            normalize,
            simplify,
            optimize,
            die,
            eager_or_die,
        }
    }
}

thread_local! {
    static REGISTRY: Registry = Registry::build();
}

fn registered<T>(pick: impl FnOnce(&Registry) -> T) -> T {
    REGISTRY.with(pick)
}

/// Numeric evaluation wherever a rule applies; lazy terms otherwise.
#[must_use]
pub fn eager() -> Rc<dyn Interpretation> {
    registered(|r| r.eager.clone())
}

/// Substitutes eagerly and builds everything else verbatim.
#[must_use]
pub fn lazy() -> Rc<dyn Interpretation> {
    registered(|r| r.lazy.clone())
}

/// `eager`, plus reductions of non-tensor terms by looping over values.
#[must_use]
pub fn sequential() -> Rc<dyn Interpretation> {
    registered(|r| r.sequential.clone())
}

/// `eager`, plus collapse of point-mass mixtures to their mean.
#[must_use]
pub fn moment_matching() -> Rc<dyn Interpretation> {
    registered(|r| r.moment_matching.clone())
}

#[must_use]
pub fn normalize() -> Rc<dyn Interpretation> {
    registered(|r| r.normalize.clone())
}

#[must_use]
pub fn simplify() -> Rc<dyn Interpretation> {
    registered(|r| r.simplify.clone())
}

/// Reorders n-ary contractions, then evaluates eagerly.
#[must_use]
pub fn optimize() -> Rc<dyn Interpretation> {
    registered(|r| r.optimize.clone())
}

#[must_use]
pub fn die() -> Rc<dyn Interpretation> {
    registered(|r| r.die.clone())
}

/// The eager rules, with any construction they miss reported as an error.
#[must_use]
pub fn eager_or_die() -> Rc<dyn Interpretation> {
    registered(|r| r.eager_or_die.clone())
}

/// The eager rule table of this thread. Rules registered here apply to every
/// interpretation built on it.
#[must_use]
pub fn eager_rules() -> Rc<Dispatched> {
    registered(|r| r.eager_rules.clone())
}

pub(crate) fn optimize_rules() -> Rc<Dispatched> {
    registered(|r| r.optimize_rules.clone())
}
