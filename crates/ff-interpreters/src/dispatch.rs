//! Pattern-matched rule tables.
//!
//! A rule pairs a [`Pattern`] over a construction request with a handler.
//! Rules are tried most-specific first; registration order breaks ties. A
//! handler that answers `Ok(None)` passes the request on to the next matching
//! rule, and a table with no answering rule defers.

use std::cell::RefCell;

use ff_core::{Interpretation, Op, Term, TermError, TermKind, TermTag};
use smallvec::SmallVec;

/// Constraint on the operator of a request. For a `Contraction` this is the
/// product op; for a `MarkovProduct` it is `prod_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPattern {
    Any,
    Associative,
    Exactly(Op),
}

/// Constraint on one child term, in [`TermKind::children`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPattern {
    Any,
    /// A `Number` or `Tensor`.
    Ground,
    Is(TermTag),
    Not(TermTag),
}

impl ArgPattern {
    fn matches(self, term: &Term) -> bool {
        match self {
            Self::Any => true,
            Self::Ground => term.is_ground() && term.tag() != TermTag::Slice,
            Self::Is(tag) => term.tag() == tag,
            Self::Not(tag) => term.tag() != tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tag: TermTag,
    op: OpPattern,
    args: SmallVec<[ArgPattern; 4]>,
}

impl Pattern {
    #[must_use]
    pub fn new(tag: TermTag) -> Self {
        Self {
            tag,
            op: OpPattern::Any,
            args: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn op(mut self, op: OpPattern) -> Self {
        self.op = op;
        self
    }

    #[must_use]
    pub fn args(mut self, args: &[ArgPattern]) -> Self {
        self.args = SmallVec::from_slice(args);
        self
    }

    #[must_use]
    pub fn tag(&self) -> TermTag {
        self.tag
    }

    #[must_use]
    pub fn matches(&self, kind: &TermKind) -> bool {
        if kind.tag() != self.tag {
            return false;
        }
        let op_ok = match (self.op, kind_op(kind)) {
            (OpPattern::Any, _) => true,
            (OpPattern::Associative, Some(op)) => op.is_associative(),
            (OpPattern::Exactly(expected), Some(op)) => op == expected,
            (_, None) => false,
        };
        if !op_ok {
            return false;
        }
        let children = kind.children();
        self.args.len() <= children.len()
            && self
                .args
                .iter()
                .zip(children.iter())
                .all(|(pattern, child)| pattern.matches(child))
    }

    /// Number of constrained positions. Exact ops count double.
    #[must_use]
    pub fn specificity(&self) -> usize {
        let op = match self.op {
            OpPattern::Any => 0,
            OpPattern::Associative => 1,
            OpPattern::Exactly(_) => 2,
        };
        op + self
            .args
            .iter()
            .map(|arg| match arg {
                ArgPattern::Any => 0,
                ArgPattern::Not(_) => 1,
                ArgPattern::Ground => 2,
                ArgPattern::Is(_) => 3,
            })
            .sum::<usize>()
    }
}

fn kind_op(kind: &TermKind) -> Option<Op> {
    match kind {
        TermKind::Unary { op, .. } | TermKind::Binary { op, .. } | TermKind::Reduce { op, .. } => {
            Some(*op)
        }
        TermKind::Contraction { bin_op, .. } => Some(*bin_op),
        TermKind::MarkovProduct { prod_op, .. } => Some(*prod_op),
        _ => None,
    }
}

/// Ordered rule storage shared by [`Dispatched`] and [`StatefulInterpretation`].
pub struct RuleTable<H: Copy> {
    rules: RefCell<Vec<(Pattern, H)>>,
}

impl<H: Copy> Default for RuleTable<H> {
    fn default() -> Self {
        Self {
            rules: RefCell::new(Vec::new()),
        }
    }
}

impl<H: Copy> RuleTable<H> {
    pub fn register(&self, pattern: Pattern, handler: H) {
        let mut rules = self.rules.borrow_mut();
        let specificity = pattern.specificity();
        let at = rules
            .iter()
            .position(|(existing, _)| existing.specificity() < specificity)
            .unwrap_or(rules.len());
        rules.insert(at, (pattern, handler));
    }

    /// Handlers whose pattern matches `kind`, most specific first.
    #[must_use]
    pub fn candidates(&self, kind: &TermKind) -> SmallVec<[H; 4]> {
        self.rules
            .borrow()
            .iter()
            .filter(|(pattern, _)| pattern.matches(kind))
            .map(|(_, handler)| *handler)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has_rules_for(&self, tag: TermTag) -> bool {
        self.rules
            .borrow()
            .iter()
            .any(|(pattern, _)| pattern.tag() == tag)
    }
}

pub type Handler = fn(&TermKind) -> Result<Option<Term>, TermError>;

// ── Dispatched ──────────────────────────────────────────────────────

/// Interpretation backed by a table of pattern-matched rules.
pub struct Dispatched {
    name: String,
    rules: RuleTable<Handler>,
}

impl Dispatched {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: RuleTable::default(),
        }
    }

    pub fn register(&self, pattern: Pattern, handler: Handler) {
        self.rules.register(pattern, handler);
    }

    #[must_use]
    pub fn rules(&self) -> &RuleTable<Handler> {
        &self.rules
    }
}

impl Interpretation for Dispatched {
    fn name(&self) -> &str {
        &self.name
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        for handler in self.rules.candidates(kind) {
            if let Some(term) = handler(kind)? {
                tracing::trace!(
                    interpretation = self.name.as_str(),
                    term = kind.tag().as_str(),
                    "rule fired"
                );
                return Ok(Some(term));
            }
        }
        Ok(None)
    }
}

// ── Stateful ────────────────────────────────────────────────────────

pub type StatefulHandler<S> = fn(&S, &TermKind) -> Result<Option<Term>, TermError>;

/// Like [`Dispatched`], but every handler also sees the interpretation's
/// parameter bundle `S`.
pub struct StatefulInterpretation<S> {
    name: String,
    state: S,
    rules: RuleTable<StatefulHandler<S>>,
}

impl<S> StatefulInterpretation<S> {
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self {
            name: name.into(),
            state,
            rules: RuleTable::default(),
        }
    }

    pub fn register(&self, pattern: Pattern, handler: StatefulHandler<S>) {
        self.rules.register(pattern, handler);
    }

    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S> Interpretation for StatefulInterpretation<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        for handler in self.rules.candidates(kind) {
            if let Some(term) = handler(&self.state, kind)? {
                return Ok(Some(term));
            }
        }
        Ok(None)
    }
}
