//! Associative-commutative normal form and local simplifications.
//!
//! Under `normalize`, every associative binary op and every reduction
//! becomes a [`TermKind::Contraction`]. Contractions flatten nested
//! contractions with the same product op, absorb nested reductions with
//! the same sum op, drop unit constants and sort their operands by digest,
//! so equal sums and products reach the same interned node however they
//! were parenthesized.

use std::collections::BTreeSet;

use ff_core::{Dtype, Op, Term, TermError, TermKind, TermTag, construct, find_domain};

use crate::dispatch::{ArgPattern, Dispatched, OpPattern, Pattern};

pub(crate) fn register(normalize: &Dispatched) {
    normalize.register(
        Pattern::new(TermTag::Binary).op(OpPattern::Associative),
        binary_to_contraction,
    );
    normalize.register(
        Pattern::new(TermTag::Binary).op(OpPattern::Exactly(Op::Sub)),
        binary_inverse_pattern,
    );
    normalize.register(
        Pattern::new(TermTag::Binary).op(OpPattern::Exactly(Op::Div)),
        binary_inverse_pattern,
    );
    normalize.register(Pattern::new(TermTag::Reduce), reduce_to_contraction);
    normalize.register(Pattern::new(TermTag::Contraction), normalize_contraction);
}

pub(crate) fn register_simplify(simplify: &Dispatched) {
    use ArgPattern::Is;
    simplify.register(
        Pattern::new(TermTag::Unary).args(&[Is(TermTag::Number)]),
        fold_unary_constant,
    );
    simplify.register(
        Pattern::new(TermTag::Binary).args(&[Is(TermTag::Number), Is(TermTag::Number)]),
        fold_binary_constant,
    );
    simplify.register(
        Pattern::new(TermTag::Unary)
            .op(OpPattern::Exactly(Op::Neg))
            .args(&[Is(TermTag::Unary)]),
        double_negation,
    );
    simplify.register(Pattern::new(TermTag::Binary), drop_binary_unit);
}

fn binary_to_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    if *op == Op::Null {
        return Ok(None);
    }
    Term::contraction(Op::Null, *op, BTreeSet::new(), vec![lhs.clone(), rhs.clone()]).map(Some)
}

fn binary_inverse_pattern(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let Some((assoc, inverse)) = op.inverse_pattern() else {
        return Ok(None);
    };
    // Integer division has no reciprocal in its own dtype.
    if *op == Op::Div && rhs.output().dtype() != Dtype::Real {
        return Ok(None);
    }
    let inverted = Term::unary(inverse, rhs)?;
    Term::binary(assoc, lhs, &inverted).map(Some)
}

fn reduce_to_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Reduce {
        op,
        arg,
        reduced_vars,
    } = kind
    else {
        return Ok(None);
    };
    Term::contraction(*op, Op::Null, reduced_vars.clone(), vec![arg.clone()]).map(Some)
}

/// Contraction payload after flattening.
struct Flat {
    red_op: Op,
    bin_op: Op,
    reduced_vars: BTreeSet<String>,
    terms: Vec<Term>,
}

fn flatten(red_op: Op, bin_op: Op, reduced_vars: &BTreeSet<String>, terms: &[Term]) -> Flat {
    let single = terms.len() == 1;
    let mut flat = Flat {
        red_op,
        bin_op,
        reduced_vars: reduced_vars.clone(),
        terms: Vec::with_capacity(terms.len()),
    };
    for (pos, term) in terms.iter().enumerate() {
        let TermKind::Contraction {
            red_op: inner_red,
            bin_op: inner_bin,
            reduced_vars: inner_vars,
            terms: inner_terms,
        } = term.kind()
        else {
            flat.terms.push(term.clone());
            continue;
        };
        let same_product = inner_terms.len() == 1 || *inner_bin == bin_op;
        let splice = if inner_vars.is_empty() {
            single || same_product
        } else {
            // A nested reduction joins the outer one unless one of its bound
            // names is free elsewhere in the product.
            let captured = inner_vars.iter().any(|var| {
                flat.reduced_vars.contains(var)
                    || terms
                        .iter()
                        .enumerate()
                        .any(|(other, t)| other != pos && t.inputs().contains(var))
            });
            *inner_red == red_op
                && !captured
                && (single || (same_product && red_op.distributes_over(bin_op)))
        };
        if !splice {
            flat.terms.push(term.clone());
            continue;
        }
        if single && inner_terms.len() > 1 {
            flat.bin_op = *inner_bin;
        }
        flat.reduced_vars.extend(inner_vars.iter().cloned());
        flat.terms.extend(inner_terms.iter().cloned());
    }
    flat
}

fn normalize_contraction(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Contraction {
        red_op,
        bin_op,
        reduced_vars,
        terms,
    } = kind
    else {
        return Ok(None);
    };
    let mut flat = flatten(*red_op, *bin_op, reduced_vars, terms);

    if let Some(unit) = flat.bin_op.unit() {
        let is_unit = |t: &Term| t.as_number() == Some(unit);
        // Real units may only go when a real operand keeps the dtype.
        if flat
            .terms
            .iter()
            .any(|t| !is_unit(t) && t.output().dtype() == Dtype::Real)
        {
            flat.terms.retain(|t| !is_unit(t));
        }
    }
    flat.terms.sort_by_key(Term::digest);
    if flat.terms.len() == 1 {
        flat.bin_op = Op::Null;
    }
    if flat.reduced_vars.is_empty() {
        flat.red_op = Op::Null;
    }

    match flat.terms.as_slice() {
        [] => return Term::unit(flat.bin_op).map(Some),
        [only] if flat.red_op == Op::Null => return Ok(Some(only.clone())),
        _ => {}
    }
    let canonical = TermKind::Contraction {
        red_op: flat.red_op,
        bin_op: flat.bin_op,
        reduced_vars: flat.reduced_vars,
        terms: flat.terms,
    };
    if canonical.digest() == kind.digest() {
        return Ok(None);
    }
    construct(canonical).map(Some)
}

// ── Simplify ────────────────────────────────────────────────────────

fn number_term(value: f64, dtype: Dtype) -> Result<Term, TermError> {
    match dtype {
        Dtype::Real => Term::number(value),
        Dtype::Int(size) if value >= 0.0 && (value as usize) < size => {
            construct(TermKind::Number { value, dtype })
        }
        Dtype::Int(_) => Term::number(value),
    }
}

fn fold_unary_constant(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Unary { op, arg } = kind else {
        return Ok(None);
    };
    let Some(value) = arg.as_number() else {
        return Ok(None);
    };
    if op.is_associative() {
        return Ok(Some(arg.clone()));
    }
    let dtype = find_domain(*op, &[arg.output().clone()])?.dtype();
    number_term(op.apply_unary(value), dtype).map(Some)
}

fn fold_binary_constant(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
        return Ok(None);
    };
    let dtype = find_domain(*op, &[lhs.output().clone(), rhs.output().clone()])?.dtype();
    number_term(op.apply_binary(a, b), dtype).map(Some)
}

fn double_negation(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Unary { op: Op::Neg, arg } = kind else {
        return Ok(None);
    };
    match arg.kind() {
        TermKind::Unary {
            op: Op::Neg,
            arg: inner,
        } => Ok(Some(inner.clone())),
        _ => Ok(None),
    }
}

/// `x + 0`, `x * 1` and friends, when dropping the constant keeps the type.
fn drop_binary_unit(kind: &TermKind) -> Result<Option<Term>, TermError> {
    let TermKind::Binary { op, lhs, rhs } = kind else {
        return Ok(None);
    };
    let Some(unit) = op.unit() else {
        return Ok(None);
    };
    let output = find_domain(*op, &[lhs.output().clone(), rhs.output().clone()])?;
    let keep = if rhs.as_number() == Some(unit) {
        lhs
    } else if lhs.as_number() == Some(unit) {
        rhs
    } else {
        return Ok(None);
    };
    if *keep.output() == output {
        Ok(Some(keep.clone()))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::{normalize, simplify};
    use ff_core::{Domain, Op, Term, TermError, TermKind, TermTag, with_interpretation};

    fn vars() -> (Term, Term, Term) {
        let v = |name: &str| Term::variable(name, Domain::real()).expect("variable");
        (v("a"), v("b"), v("c"))
    }

    #[test]
    fn associativity_reaches_one_canonical_term() {
        let (a, b, c) = vars();
        with_interpretation(normalize(), || {
            let left = a.add(&b).and_then(|ab| ab.add(&c)).expect("(a+b)+c");
            let right = b.add(&c).and_then(|bc| a.add(&bc)).expect("a+(b+c)");
            let swapped = c.add(&a).and_then(|ca| ca.add(&b)).expect("(c+a)+b");
            assert!(left.ptr_eq(&right));
            assert!(left.ptr_eq(&swapped));
            let TermKind::Contraction { bin_op, terms, .. } = left.kind() else {
                panic!("expected a contraction, got {}", left.pretty());
            };
            assert_eq!(*bin_op, Op::Add);
            assert_eq!(terms.len(), 3);
        });
    }

    #[test]
    fn nested_reductions_merge() {
        let x = Term::variable("x", Domain::bint(2)).expect("variable");
        let y = Term::variable("y", Domain::bint(3)).expect("variable");
        with_interpretation(normalize(), || {
            let sum = x.add(&y)?;
            let inner = sum.reduce(Op::Add, ["x"])?;
            let outer = inner.reduce(Op::Add, ["y"])?;
            let at_once = sum.reduce(Op::Add, ["x", "y"])?;
            assert!(outer.ptr_eq(&at_once));
            assert!(outer.inputs().is_empty());
            Ok::<_, TermError>(())
        })
        .expect("reductions should normalize");
    }

    #[test]
    fn subtraction_uses_the_inverse_pattern() {
        let (a, b, _) = vars();
        with_interpretation(normalize(), || {
            let diff = a.sub(&b).expect("a - b");
            let sum = b.neg().and_then(|nb| a.add(&nb)).expect("a + -b");
            assert!(diff.ptr_eq(&sum));
        });
    }

    #[test]
    fn simplify_folds_constants_and_units() {
        let (a, _, _) = vars();
        with_interpretation(simplify(), || {
            let three = Term::number(1.0)
                .and_then(|one| one.add(&Term::number(2.0)?))
                .expect("constant fold");
            assert_eq!(three.as_number(), Some(3.0));
            let same = a.add(&Term::number(0.0).expect("zero")).expect("a + 0");
            assert!(same.ptr_eq(&a));
            let twice = a.neg().and_then(|n| n.neg()).expect("--a");
            assert!(twice.ptr_eq(&a));
            let scaled = a.mul(&Term::number(2.0).expect("two")).expect("a * 2");
            assert_eq!(scaled.tag(), TermTag::Contraction);
        });
    }
}
