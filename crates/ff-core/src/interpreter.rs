//! The interpretation protocol and the per-thread active-interpretation stack.
//!
//! Every term constructor hands its arguments to [`interpret`], which asks the
//! active interpretation for a result. An interpretation may answer with a
//! term or defer with `Ok(None)`; a deferred construction falls through to
//! [`reflect`]. Entering a non-total interpretation composes it in front of
//! the previously active one, so misses keep falling back to outer contexts.
//!
//! The stack is thread-local and `Rc`-based. Terms and interpretations are not
//! shared across threads.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::TermError;
use crate::term::{Term, TermKind, reflect};

pub trait Interpretation {
    fn name(&self) -> &str;

    /// A total interpretation never defers.
    fn is_total(&self) -> bool {
        false
    }

    /// Returns `Ok(None)` to defer to the next interpretation.
    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError>;

    /// Members of a prioritized composite, so nested composites flatten.
    fn members(&self) -> Option<&[Rc<dyn Interpretation>]> {
        None
    }
}

// ── Reflect ─────────────────────────────────────────────────────────

/// Builds nodes verbatim. The universal fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reflect;

impl Interpretation for Reflect {
    fn name(&self) -> &str {
        "reflect"
    }

    fn is_total(&self) -> bool {
        true
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        reflect(kind.clone()).map(Some)
    }
}

// ── Prioritized ─────────────────────────────────────────────────────

/// Tries each member in order and returns the first non-deferred result.
pub struct Prioritized {
    name: String,
    members: Vec<Rc<dyn Interpretation>>,
}

impl Prioritized {
    pub fn new(members: impl IntoIterator<Item = Rc<dyn Interpretation>>) -> Self {
        let mut flat: Vec<Rc<dyn Interpretation>> = Vec::new();
        for member in members {
            match member.members() {
                Some(inner) => flat.extend(inner.iter().cloned()),
                None => flat.push(member),
            }
        }
        // Nothing after a total member is reachable.
        if let Some(pos) = flat.iter().position(|member| member.is_total()) {
            flat.truncate(pos + 1);
        }
        let names: Vec<&str> = flat.iter().map(|member| member.name()).collect();
        Self {
            name: format!("prioritized({})", names.join(", ")),
            members: flat,
        }
    }
}

impl Interpretation for Prioritized {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_total(&self) -> bool {
        self.members.iter().any(|member| member.is_total())
    }

    fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
        for member in &self.members {
            if let Some(term) = member.interpret(kind)? {
                return Ok(Some(term));
            }
        }
        Ok(None)
    }

    fn members(&self) -> Option<&[Rc<dyn Interpretation>]> {
        Some(&self.members)
    }
}

// ── Active stack ────────────────────────────────────────────────────

thread_local! {
    static ACTIVE: RefCell<Vec<Rc<dyn Interpretation>>> =
        RefCell::new(vec![Rc::new(Reflect) as Rc<dyn Interpretation>]);
}

#[must_use]
pub fn active_interpretation() -> Rc<dyn Interpretation> {
    ACTIVE
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| Rc::new(Reflect))
}

#[must_use]
pub fn interpretation_depth() -> usize {
    ACTIVE.with(|stack| stack.borrow().len())
}

/// Pops the interpretation it was created for when dropped, including
/// during unwinding.
#[must_use = "the interpretation is popped as soon as the guard is dropped"]
pub struct InterpretationGuard {
    depth: usize,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for InterpretationGuard {
    fn drop(&mut self) {
        let keep = self.depth.saturating_sub(1).max(1);
        let popped = ACTIVE.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            let keep = keep.min(stack.len());
            stack.split_off(keep)
        });
        drop(popped);
    }
}

/// Makes `interpretation` active until the returned guard drops. A
/// non-total interpretation falls back to the one it replaces.
pub fn push_interpretation(interpretation: Rc<dyn Interpretation>) -> InterpretationGuard {
    let effective: Rc<dyn Interpretation> = if interpretation.is_total() {
        interpretation
    } else {
        Rc::new(Prioritized::new([interpretation, active_interpretation()]))
    };
    tracing::trace!(interpretation = effective.name(), "entering interpretation");
    let depth = ACTIVE.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(effective);
        stack.len()
    });
    InterpretationGuard {
        depth,
        _not_send: PhantomData,
    }
}

pub fn with_interpretation<R>(interpretation: Rc<dyn Interpretation>, f: impl FnOnce() -> R) -> R {
    let _guard = push_interpretation(interpretation);
    f()
}

/// Constructs a term under the active interpretation.
pub fn interpret(kind: TermKind) -> Result<Term, TermError> {
    let active = active_interpretation();
    tracing::trace!(
        interpretation = active.name(),
        term = kind.tag().as_str(),
        "interpret"
    );
    match active.interpret(&kind)? {
        Some(term) => Ok(term),
        None => reflect(kind),
    }
}
