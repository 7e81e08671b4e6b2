//! Property tests for the representation algebra and the mangling scheme.

use proptest::prelude::*;

use osprey::zencode::zencode;
use osprey_core::ast::{Dir, Id, NExp, Typ, TypArg};
use osprey_core::diagnostics::Span;
use osprey_core::{lower_type, CTyp, ConstProver, Ctx, TypeEnv};

fn arb_dir() -> impl Strategy<Value = Dir> {
    prop_oneof![Just(Dir::Dec), Just(Dir::Inc)]
}

fn arb_ctyp() -> impl Strategy<Value = CTyp> {
    let leaf = prop_oneof![
        Just(CTyp::Unit),
        Just(CTyp::Bit),
        Just(CTyp::Bool),
        Just(CTyp::String),
        Just(CTyp::Real),
        Just(CTyp::LInt),
        (1u32..=64).prop_map(CTyp::FInt),
        ((1u32..=64), arb_dir()).prop_map(|(n, d)| CTyp::FBits(n, d)),
        ((1u32..=64), arb_dir()).prop_map(|(n, d)| CTyp::SBits(n, d)),
        arb_dir().prop_map(CTyp::LBits),
        Just(CTyp::Poly(Id::new("'a"))),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(CTyp::Tup),
            inner.clone().prop_map(|t| CTyp::List(Box::new(t))),
            (arb_dir(), inner.clone()).prop_map(|(d, t)| CTyp::Vector(d, Box::new(t))),
            inner.clone().prop_map(|t| CTyp::Ref(Box::new(t))),
            prop::collection::vec(inner, 1..3).prop_map(|fields| {
                CTyp::Struct(
                    Id::new("s"),
                    fields
                        .into_iter()
                        .enumerate()
                        .map(|(i, t)| (Id::new(format!("f{i}")), t))
                        .collect(),
                )
            }),
        ]
    })
}

/// Hand-computed restatement of the stack predicate, kept deliberately
/// independent of the implementation's structure.
fn reference_is_stack(ctyp: &CTyp) -> bool {
    match ctyp {
        CTyp::LInt | CTyp::LBits(_) | CTyp::String | CTyp::Real => false,
        CTyp::List(_) | CTyp::Vector(_, _) | CTyp::Variant(_, _) => false,
        CTyp::Tup(items) => items.iter().all(reference_is_stack),
        CTyp::Struct(_, fields) => fields.iter().all(|(_, t)| reference_is_stack(t)),
        _ => true,
    }
}

fn arb_typ() -> impl Strategy<Value = Typ> {
    let leaf = prop_oneof![
        Just(Typ::id("unit")),
        Just(Typ::id("bool")),
        Just(Typ::id("bit")),
        Just(Typ::id("int")),
        Just(Typ::id("nat")),
        Just(Typ::id("string")),
        (0i64..=128).prop_map(Typ::bits),
        (-1000i64..=1000, 0i64..=1000)
            .prop_map(|(lo, len)| Typ::range(NExp::constant(lo), NExp::constant(lo + len))),
        (0i64..=100).prop_map(|n| Typ::atom(NExp::constant(n))),
    ];
    leaf.prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Typ::Tuple),
            inner.clone().prop_map(Typ::list),
            (0i64..=16, arb_dir(), inner).prop_map(|(n, d, t)| Typ::App(
                Id::new("vector"),
                vec![
                    TypArg::NExp(NExp::constant(n)),
                    TypArg::Dir(d),
                    TypArg::Typ(t),
                ],
            )),
        ]
    })
}

proptest! {
    #[test]
    fn stack_predicate_matches_the_reference(ctyp in arb_ctyp()) {
        prop_assert_eq!(ctyp.is_stack(), reference_is_stack(&ctyp));
    }

    #[test]
    fn supremum_is_idempotent_and_never_stack_shrinking(ctyp in arb_ctyp()) {
        let sup = ctyp.sup();
        prop_assert_eq!(sup.sup(), sup.clone());
        // Widening never turns a heap representation back into a stack one.
        if !ctyp.is_stack() {
            prop_assert!(!sup.is_stack());
        }
    }

    #[test]
    fn lowering_is_deterministic(typ in arb_typ()) {
        let env = TypeEnv::default();
        let ctx = Ctx::new(&env, &ConstProver);
        let first = lower_type(&typ, &ctx, Span::unknown());
        let second = lower_type(&typ, &ctx, Span::unknown());
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(_), Err(_)) => {}
            (a, b) => prop_assert!(false, "diverged: {a:?} vs {b:?}"),
        }
    }

    #[test]
    fn well_formed_types_always_lower(typ in arb_typ()) {
        let env = TypeEnv::default();
        let ctx = Ctx::new(&env, &ConstProver);
        let lowered = lower_type(&typ, &ctx, Span::unknown());
        prop_assert!(lowered.is_ok(), "no representation for {typ:?}");
        prop_assert!(!lowered.is_ok_and(|ctyp| ctyp.has_poly()));
    }

    #[test]
    fn zencode_is_injective(a in "[ -~]{0,12}", b in "[ -~]{0,12}") {
        if a != b {
            prop_assert_ne!(zencode(&a), zencode(&b));
        }
    }
}
