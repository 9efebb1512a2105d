#![forbid(unsafe_code)]

//! Term model for the frankenfunsor engine: interned domains, the op table,
//! dense leaves, cons-hashed term nodes and the interpretation protocol.

pub mod array;
pub mod construct;
pub mod domain;
pub mod error;
pub mod interpreter;
pub mod ops;
pub mod term;

pub use array::{ArrayError, ArrayId, DenseArray};
pub use construct::construct;
pub use domain::{Domain, DomainError, DomainSpec, Dtype, broadcast_shape, find_domain};
pub use error::TermError;
pub use interpreter::{
    Interpretation, InterpretationGuard, Prioritized, Reflect, active_interpretation, interpret,
    interpretation_depth, push_interpretation, with_interpretation,
};
pub use ops::{DISTRIBUTIVE_OPS, Op, OpArity, logaddexp};
pub use term::{Inputs, Term, TermDigest, TermKind, TermNode, TermTag, live_term_count, reflect};

#[cfg(test)]
mod tests {
    use super::*;
    use ff_test_utils::{Suite, TestMode, run_logged_test};
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    const SUITE: Suite = Suite {
        suite_id: "ff-core",
        package: "ff-core",
        manifest_dir: env!("CARGO_MANIFEST_DIR"),
    };

    fn logged<F>(test_name: &str, fixture: &impl serde::Serialize, body: F)
    where
        F: FnOnce() -> Result<Vec<String>, String>,
    {
        run_logged_test(SUITE, module_path!(), test_name, fixture, TestMode::Unit, body);
    }

    fn var(name: &str, domain: Domain) -> Term {
        Term::variable(name, domain).expect("variable should build")
    }

    /// Rewrites the constant 1.0 to 2.0 and defers on everything else.
    struct OneIsTwo;

    impl Interpretation for OneIsTwo {
        fn name(&self) -> &str {
            "one_is_two"
        }

        fn interpret(&self, kind: &TermKind) -> Result<Option<Term>, TermError> {
            match kind {
                TermKind::Number { value, dtype } if *value == 1.0 => reflect(TermKind::Number {
                    value: 2.0,
                    dtype: *dtype,
                })
                .map(Some),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn equal_arguments_yield_the_same_node() {
        logged("equal_arguments_yield_the_same_node", &("cons", 1_u32), || {
            let x = var("x", Domain::real());
            let x_again = var("x", Domain::real());
            assert!(x.ptr_eq(&x_again));

            let one = Term::number(1.0).map_err(|e| e.to_string())?;
            let a = x.add(&one).map_err(|e| e.to_string())?;
            let b = x_again.add(&one).map_err(|e| e.to_string())?;
            assert!(a.ptr_eq(&b));
            assert_ne!(a, x.mul(&one).map_err(|e| e.to_string())?);

            let data = DenseArray::new(vec![2], vec![0.5, 1.5]).map_err(|e| e.to_string())?;
            let inputs = Inputs::from_pairs([("i", Domain::bint(2))]).map_err(|e| e.to_string())?;
            let t1 = Term::tensor(data.clone(), inputs.clone()).map_err(|e| e.to_string())?;
            let t2 = Term::tensor(data, inputs.clone()).map_err(|e| e.to_string())?;
            assert!(t1.ptr_eq(&t2));
            let other = DenseArray::new(vec![2], vec![0.5, 1.5]).map_err(|e| e.to_string())?;
            let t3 = Term::tensor(other, inputs).map_err(|e| e.to_string())?;
            assert!(!t1.ptr_eq(&t3), "distinct buffers are distinct leaves");
            Ok(Vec::new())
        });
    }

    #[test]
    fn cons_table_does_not_own_terms() {
        let before = live_term_count();
        let term = var("only_here", Domain::reals(&[7]));
        assert_eq!(live_term_count(), before + 1);
        drop(term);
        assert_eq!(live_term_count(), before);
    }

    #[test]
    fn binary_merges_inputs_and_infers_output() {
        let x = var("x", Domain::reals(&[3]));
        let y = var("y", Domain::real());
        let z = x.mul(&y).expect("broadcast mul should build");
        let names: Vec<&str> = z.inputs().names().collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(*z.output(), Domain::reals(&[3]));
    }

    #[test]
    fn construction_rejects_domain_mismatch() {
        let a = var("a", Domain::reals(&[2]));
        let b = var("b", Domain::reals(&[3]));
        let err = a.add(&b).expect_err("shapes 2 and 3 should not combine");
        assert!(matches!(err, TermError::Domain(DomainError::ShapeMismatch { .. })));

        let clash = var("a", Domain::real());
        let err = a.add(&clash).expect_err("input a with two domains");
        assert!(matches!(err, TermError::InputConflict { .. }));
    }

    #[test]
    fn reduce_checks_reduced_vars() {
        let x = var("x", Domain::bint(3));
        assert!(x.reduce(Op::Add, Vec::<String>::new()).expect("empty").ptr_eq(&x));
        let err = x
            .reduce(Op::Add, ["y"])
            .expect_err("y is not an input");
        assert_eq!(
            err,
            TermError::ReducedVarsNotSubset {
                vars: vec!["y".to_owned()]
            }
        );
        let r = x.reduce(Op::Add, ["x"]).expect("reduce x should build");
        assert!(r.inputs().is_empty());
        assert_eq!(r.tag(), TermTag::Reduce);
    }

    #[test]
    fn subs_ignores_unknown_names_and_checks_types() {
        let x = var("x", Domain::real());
        let same = x
            .subs([("unrelated", Term::number(3.0).expect("number"))])
            .expect("unknown names are dropped");
        assert!(same.ptr_eq(&x));

        let err = x
            .subs([("x", Term::int(1, 2).expect("int"))])
            .expect_err("Bint value for a real input");
        assert!(matches!(err, TermError::SubstitutionType { .. }));

        let y = var("y", Domain::bint(4));
        let s = x.subs([("x", y.apply(Op::Exp).expect("exp"))]).expect("subs");
        assert_eq!(s.inputs().names().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn stack_and_cat_introduce_bounded_inputs() {
        let a = var("a", Domain::real());
        let b = var("b", Domain::real());
        let stacked = Term::stack("i", vec![a.clone(), b.clone()]).expect("stack");
        assert_eq!(stacked.inputs().get("i"), Some(&Domain::bint(2)));
        assert_eq!(stacked.inputs().len(), 3);

        let err = Term::stack("i", vec![a.clone(), var("v", Domain::reals(&[2]))])
            .expect_err("outputs differ");
        assert!(matches!(err, TermError::StackMismatch { .. }));

        let p = var("p", Domain::bint(2)).apply(Op::Exp).expect("exp");
        let q = var("p", Domain::bint(3)).apply(Op::Exp).expect("exp");
        let joined = Term::cat("t", vec![p, q], "p").expect("cat");
        assert_eq!(joined.inputs().get("t"), Some(&Domain::bint(5)));
        assert!(!joined.inputs().contains("p"));

        let slice = Term::slice("s", 1, 7, 2, 8).expect("slice");
        assert_eq!(slice.inputs().get("s"), Some(&Domain::bint(3)));
        assert_eq!(*slice.output(), Domain::bint(8));
    }

    #[test]
    fn delta_and_markov_product_types() {
        let point = var("loc", Domain::reals(&[2]));
        let log_density = Term::number(0.0).expect("number");
        let delta = Term::delta("x", &point, &log_density).expect("delta");
        assert_eq!(delta.inputs().names().collect::<Vec<_>>(), vec!["x", "loc"]);
        assert_eq!(*delta.output(), Domain::real());

        let trans = var("time", Domain::bint(4))
            .add(&var("prev", Domain::bint(2)))
            .and_then(|t| t.add(&var("curr", Domain::bint(2))))
            .and_then(|t| t.apply(Op::Exp))
            .expect("trans should build");
        let step = vec![("prev".to_owned(), "curr".to_owned())];
        let chain =
            Term::markov_product(Op::LogAddExp, Op::Add, &trans, "time", &step).expect("markov");
        let mut names: Vec<&str> = chain.inputs().names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["curr", "prev"]);

        let renamed = Term::markov_product_named(
            Op::LogAddExp,
            Op::Add,
            &trans,
            "time",
            &step,
            vec![
                ("curr".to_owned(), "x_curr".to_owned()),
                ("prev".to_owned(), "x_prev".to_owned()),
            ],
        )
        .expect("named markov");
        assert!(renamed.inputs().contains("x_prev"));
        assert!(renamed.inputs().contains("x_curr"));
    }

    #[test]
    fn align_moves_names_to_front() {
        let t = var("a", Domain::real()).add(&var("b", Domain::real())).expect("add");
        assert!(t.align(&["a"]).expect("noop").ptr_eq(&t));
        let aligned = t.align(&["b", "a"]).expect("align");
        assert_eq!(aligned.inputs().names().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn entering_an_interpretation_falls_back_to_the_outer_one() {
        let one = Term::number(1.0).expect("number");
        assert_eq!(one.as_number(), Some(1.0));
        let depth = interpretation_depth();
        with_interpretation(Rc::new(OneIsTwo), || {
            assert_eq!(interpretation_depth(), depth + 1);
            assert!(active_interpretation().name().contains("one_is_two"));
            assert!(active_interpretation().is_total());
            let two = Term::number(1.0).expect("number");
            assert_eq!(two.as_number(), Some(2.0));
            let other = Term::number(5.0).expect("number");
            assert_eq!(other.as_number(), Some(5.0));
        });
        assert_eq!(interpretation_depth(), depth);
    }

    #[test]
    fn guard_pops_on_panic() {
        let depth = interpretation_depth();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _guard = push_interpretation(Rc::new(OneIsTwo));
            assert_eq!(interpretation_depth(), depth + 1);
            panic!("rule failure");
        }));
        assert!(outcome.is_err());
        assert_eq!(interpretation_depth(), depth);
        assert_eq!(active_interpretation().name(), "reflect");
    }

    #[test]
    fn prioritized_flattens_and_drops_unreachable_members() {
        let inner = Prioritized::new([
            Rc::new(OneIsTwo) as Rc<dyn Interpretation>,
            Rc::new(Reflect) as Rc<dyn Interpretation>,
        ]);
        let outer = Prioritized::new([
            Rc::new(inner) as Rc<dyn Interpretation>,
            Rc::new(OneIsTwo) as Rc<dyn Interpretation>,
        ]);
        assert_eq!(outer.members().map(<[_]>::len), Some(2));
        assert_eq!(outer.name(), "prioritized(one_is_two, reflect)");
    }

    #[test]
    fn pretty_lists_children_indented() {
        let t = var("x", Domain::real()).add(&Term::number(2.0).expect("number")).expect("add");
        let text = t.pretty();
        assert!(text.starts_with("Binary(add)\n  Variable(x, Real)\n  Number(2)"));
        assert!(format!("{t:?}").starts_with("Binary(add)#"));
    }

    #[test]
    fn prop_cons_hash_identity() {
        let mut runner = TestRunner::new(ProptestConfig::with_cases(
            ff_test_utils::property_test_case_count(),
        ));
        let strategy = ("[a-e]{1,3}", -100.0_f64..100.0, 1_usize..6);
        runner
            .run(&strategy, |(name, value, size)| {
                let x = Term::variable(name.clone(), Domain::bint(size))
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let c = Term::number(value).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let build = || -> Result<Term, TermError> {
                    let v = Term::variable(name.clone(), Domain::bint(size))?;
                    let sum = v.apply(Op::Exp)?.add(&Term::number(value)?)?;
                    sum.reduce(Op::LogAddExp, [name.as_str()])
                };
                let first = build().map_err(|e| TestCaseError::fail(e.to_string()))?;
                let second = build().map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(first.ptr_eq(&second));
                prop_assert!(first.inputs().is_empty());
                prop_assert_eq!(x.inputs().len(), 1);
                prop_assert_eq!(c.as_number(), Some(value));
                Ok(())
            })
            .expect("cons hashing should be stable");
    }
}
