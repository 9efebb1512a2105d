//! Interpretations that wrap other interpretations.

use std::rc::Rc;

use ff_cache::{MemoCache, build_cache_key};
use ff_core::{
    Interpretation, Prioritized, Term, TermError, TermKind, active_interpretation, construct,
    reflect, with_interpretation,
};

// ── Normalized ──────────────────────────────────────────────────────

/// Retries a rule set on the associative-commutative normal form of a
/// request when the request itself matches nothing.
///
/// Only the requested node is normalized; its children are taken to be
/// results of this interpretation already. Nodes the normalizer creates are
/// rebuilt under the rule set followed by `fallback`, and the normal form
/// is the answer when nothing fires.
pub struct Normalized {
    name: String,
    rules: Rc<dyn Interpretation>,
    normalize: Rc<dyn Interpretation>,
    rebuild: Rc<dyn Interpretation>,
}

impl Normalized {
    pub fn new(
        rules: Rc<dyn Interpretation>,
        normalize: Rc<dyn Interpretation>,
        fallback: Rc<dyn Interpretation>,
    ) -> Self {
        let rebuild: Rc<dyn Interpretation> =
            Rc::new(Prioritized::new([rules.clone(), fallback]));
        Self {
            name: format!("normalized({})", rules.name()),
            rules,
            normalize,
            rebuild,
        }
    }
}

impl Interpretation for Normalized {
    fn name(&self) -> &str {
        &self.name
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        if let Some(term) = self.rules.interpret(kind)? {
            return Ok(Some(term));
        }
        if kind.is_leaf() {
            return Ok(None);
        }
        let normal = with_interpretation(self.normalize.clone(), || construct(kind.clone()))?;
        let mut known: Vec<&Term> = Vec::new();
        for child in kind.children() {
            known.push(child);
            known.extend(child.kind().children());
        }
        with_interpretation(self.rebuild.clone(), || rebuild_fresh(&normal, &known)).map(Some)
    }
}

/// Rebuilds the nodes of `term` that are not in `known`, stopping at known
/// subterms so the walk stays proportional to what normalization added.
fn rebuild_fresh(term: &Term, known: &[&Term]) -> Result<Term, TermError> {
    if term.kind().is_leaf() || known.iter().any(|old| old.ptr_eq(term)) {
        return Ok(term.clone());
    }
    let kind = term.kind().map_children(|child| rebuild_fresh(child, known))?;
    construct(kind)
}

// ── Memoize ─────────────────────────────────────────────────────────

/// Caches the answers of `base` under keys naming both `base` and the
/// request. Deferrals are not cached.
pub struct Memoize {
    name: String,
    base: Rc<dyn Interpretation>,
    cache: MemoCache,
}

impl Memoize {
    pub fn new(base: Rc<dyn Interpretation>, cache: MemoCache) -> Self {
        Self {
            name: format!("memoize({})", base.name()),
            base,
            cache,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &MemoCache {
        &self.cache
    }
}

impl Interpretation for Memoize {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_total(&self) -> bool {
        self.base.is_total()
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        let key = build_cache_key(self.base.name(), kind);
        if let Some(hit) = self.cache.lookup(&key) {
            return Ok(Some(hit));
        }
        let result = self.base.interpret(kind)?;
        if let Some(term) = &result {
            self.cache.insert(key, term.clone());
        }
        Ok(result)
    }
}

/// Runs `f` with the active interpretation memoized into `cache`. The cache
/// keeps its entries afterwards, so passing it to a later call shares them.
pub fn memoize<R>(cache: &MemoCache, f: impl FnOnce() -> R) -> R {
    let memoized = Memoize::new(active_interpretation(), cache.clone());
    with_interpretation(Rc::new(memoized), f)
}

// ── Simplify ────────────────────────────────────────────────────────

/// Total: local algebraic simplifications, else the normal form.
pub struct Simplify {
    rules: Rc<dyn Interpretation>,
    normalize: Rc<dyn Interpretation>,
}

impl Simplify {
    pub fn new(rules: Rc<dyn Interpretation>, normalize: Rc<dyn Interpretation>) -> Self {
        Self { rules, normalize }
    }
}

impl Interpretation for Simplify {
    fn name(&self) -> &str {
        "simplify"
    }

    fn is_total(&self) -> bool {
        true
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        if let Some(term) = self.rules.interpret(kind)? {
            return Ok(Some(term));
        }
        with_interpretation(self.normalize.clone(), || construct(kind.clone())).map(Some)
    }
}

// ── Die ─────────────────────────────────────────────────────────────

/// Total: builds leaves and rejects everything else, so any construction
/// that reaches it names a missing rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct Die;

impl Interpretation for Die {
    fn name(&self) -> &str {
        "die"
    }

    fn is_total(&self) -> bool {
        true
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        if kind.is_leaf() {
            return reflect(kind.clone()).map(Some);
        }
        Err(TermError::MissingPattern {
            interpretation: "die".to_owned(),
            term: kind.tag(),
        })
    }
}
