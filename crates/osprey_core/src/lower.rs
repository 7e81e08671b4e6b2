//! Type lowering: map a source type under a local kind environment to the
//! most efficient concrete representation.
//!
//! Numeric types only get a fixed-width representation when their bounds are
//! literal constants or the prover can show they fit in 64 bits; bit-vectors
//! similarly degrade from fixed through small to arbitrary-length. Everything
//! else is structural.

use std::collections::HashSet;

use num_bigint::BigInt;

use crate::ast::{Id, KindedId, NConstraint, NExp, Typ, TypArg};
use crate::ctype::CTyp;
use crate::diagnostics::Span;
use crate::env::Ctx;
use crate::error::{Error, Result};

pub fn lower_type(typ: &Typ, ctx: &Ctx, span: Span) -> Result<CTyp> {
    Lowerer {
        in_progress: HashSet::new(),
    }
    .lower(typ, ctx, span)
}

struct Lowerer {
    /// Named types currently being expanded; hitting one again yields its
    /// nominal shallow form so recursive definitions stay finite.
    in_progress: HashSet<Id>,
}

impl Lowerer {
    fn lower(&mut self, typ: &Typ, ctx: &Ctx, span: Span) -> Result<CTyp> {
        match typ {
            Typ::Id(id) => match id.as_str() {
                "bit" => Ok(CTyp::Bit),
                "bool" => Ok(CTyp::Bool),
                "int" | "nat" => Ok(CTyp::LInt),
                "unit" => Ok(CTyp::Unit),
                "string" => Ok(CTyp::String),
                "real" => Ok(CTyp::Real),
                _ => self.lower_named(id, ctx, span),
            },
            Typ::App(id, args) => match id.as_str() {
                "atom_bool" => Ok(CTyp::Bool),
                "atom" | "range" | "implicit" | "itself" => {
                    self.lower_numeric(typ, ctx, span)
                }
                "list" => match args.as_slice() {
                    [TypArg::Typ(elem)] => {
                        Ok(CTyp::List(Box::new(self.lower(elem, ctx, span)?)))
                    }
                    _ => Err(lowering_error(typ, span)),
                },
                "vector" => self.lower_vector(typ, args, ctx, span),
                "register" => match args.as_slice() {
                    [TypArg::Typ(inner)] => {
                        Ok(CTyp::Ref(Box::new(self.lower(inner, ctx, span)?)))
                    }
                    _ => Err(lowering_error(typ, span)),
                },
                _ => self.lower_named(id, ctx, span),
            },
            Typ::Tuple(items) => {
                let mut reps = Vec::with_capacity(items.len());
                for item in items {
                    reps.push(self.lower(item, ctx, span)?);
                }
                Ok(CTyp::Tup(reps))
            }
            Typ::Exist(kids, constraint, body) => {
                let ctx = ctx.bind_kinds(kids, constraint);
                self.lower(body, &ctx, span)
            }
            Typ::Var(id) => Ok(CTyp::Poly(id.clone())),
            Typ::Fn(_, _) => Err(lowering_error(typ, span)),
        }
    }

    /// Rules for `range`, `atom`, `implicit`, and `itself` (`itself` behaves
    /// as `atom`): fixed 64-bit when the bounds provably fit, arbitrary
    /// precision otherwise.
    fn lower_numeric(&mut self, typ: &Typ, ctx: &Ctx, span: Span) -> Result<CTyp> {
        let Some((kids, constraint, lo, hi)) = destruct_range(typ) else {
            return Err(lowering_error(typ, span));
        };
        let min = BigInt::from(i64::MIN);
        let max = BigInt::from(i64::MAX);
        if let (Some(lo), Some(hi)) = (lo.as_constant(), hi.as_constant()) {
            if *lo >= min && *hi <= max {
                return Ok(CTyp::FInt(64));
            }
            return Ok(CTyp::LInt);
        }
        let ctx = ctx.bind_kinds(&kids, &constraint);
        let lo_fits = ctx.prove(&NConstraint::Le(NExp::Constant(min), lo.clone()));
        let hi_fits = ctx.prove(&NConstraint::Le(hi.clone(), NExp::Constant(max)));
        if lo_fits && hi_fits {
            Ok(CTyp::FInt(64))
        } else {
            Ok(CTyp::LInt)
        }
    }

    fn lower_vector(
        &mut self,
        typ: &Typ,
        args: &[TypArg],
        ctx: &Ctx,
        span: Span,
    ) -> Result<CTyp> {
        let [TypArg::NExp(len), TypArg::Dir(dir), TypArg::Typ(elem)] = args else {
            return Err(lowering_error(typ, span));
        };
        if *elem == Typ::id("bit") {
            if let Some(n) = len.as_constant() {
                if *n >= BigInt::from(0) && *n <= BigInt::from(64) {
                    // Constant widths are exact; u32 cannot fail after the
                    // range check above.
                    let n = u32::try_from(n).map_err(|_| lowering_error(typ, span))?;
                    return Ok(CTyp::FBits(n, *dir));
                }
                return Ok(CTyp::LBits(*dir));
            }
            let bounded = ctx.prove(&NConstraint::Le(len.clone(), NExp::constant(64)));
            if bounded {
                Ok(CTyp::SBits(64, *dir))
            } else {
                Ok(CTyp::LBits(*dir))
            }
        } else {
            Ok(CTyp::Vector(*dir, Box::new(self.lower(elem, ctx, span)?)))
        }
    }

    fn lower_named(&mut self, id: &Id, ctx: &Ctx, span: Span) -> Result<CTyp> {
        if self.in_progress.contains(id) {
            // Nominal equality makes the shallow form equal to the deep one.
            if ctx.env.record(id).is_some() {
                return Ok(CTyp::Struct(id.clone(), Vec::new()));
            }
            return Ok(CTyp::Variant(id.clone(), Vec::new()));
        }
        if let Some(members) = ctx.env.enumeration(id) {
            return Ok(CTyp::Enum(id.clone(), members.to_vec()));
        }
        if let Some(fields) = ctx.env.record(id).map(<[_]>::to_vec) {
            self.in_progress.insert(id.clone());
            let mut lowered = Vec::with_capacity(fields.len());
            for (typ, field) in &fields {
                lowered.push((field.clone(), self.lower(typ, ctx, span)?));
            }
            self.in_progress.remove(id);
            return Ok(CTyp::Struct(id.clone(), lowered));
        }
        if let Some(ctors) = ctx.env.variant(id).map(<[_]>::to_vec) {
            self.in_progress.insert(id.clone());
            let mut lowered = Vec::with_capacity(ctors.len());
            for (typ, ctor) in &ctors {
                lowered.push((ctor.clone(), self.lower(typ, ctx, span)?));
            }
            self.in_progress.remove(id);
            return Ok(CTyp::Variant(id.clone(), lowered));
        }
        if let Some(expansion) = ctx.env.synonym(id).cloned() {
            return self.lower(&expansion, ctx, span);
        }
        Err(Error::TypeLowering {
            span,
            detail: format!("unknown type `{id}`"),
        })
    }
}

/// Destructure a numeric type into `(bound kinds, constraint, lo, hi)`.
fn destruct_range(typ: &Typ) -> Option<(Vec<KindedId>, NConstraint, NExp, NExp)> {
    match typ {
        Typ::App(id, args) => match (id.as_str(), args.as_slice()) {
            ("atom" | "implicit" | "itself", [TypArg::NExp(n)]) => {
                Some((Vec::new(), NConstraint::True, n.clone(), n.clone()))
            }
            ("range", [TypArg::NExp(lo), TypArg::NExp(hi)]) => {
                Some((Vec::new(), NConstraint::True, lo.clone(), hi.clone()))
            }
            _ => None,
        },
        Typ::Exist(kids, constraint, body) => {
            let (inner_kids, _, lo, hi) = destruct_range(body)?;
            let mut kids = kids.clone();
            kids.extend(inner_kids);
            Some((kids, constraint.clone(), lo, hi))
        }
        _ => None,
    }
}

fn lowering_error(typ: &Typ, span: Span) -> Error {
    Error::TypeLowering {
        span,
        detail: format!("{typ:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Dir, Kind, TypeDef};
    use crate::env::{ConstProver, KindEnv, Prover, TypeEnv};

    fn lower(typ: &Typ, env: &TypeEnv) -> Result<CTyp> {
        let ctx = Ctx::new(env, &ConstProver);
        lower_type(typ, &ctx, Span::unknown())
    }

    #[test]
    fn primitive_ids() {
        let env = TypeEnv::default();
        assert_eq!(lower(&Typ::id("bit"), &env).ok(), Some(CTyp::Bit));
        assert_eq!(lower(&Typ::id("bool"), &env).ok(), Some(CTyp::Bool));
        assert_eq!(lower(&Typ::id("int"), &env).ok(), Some(CTyp::LInt));
        assert_eq!(lower(&Typ::id("nat"), &env).ok(), Some(CTyp::LInt));
        assert_eq!(lower(&Typ::id("unit"), &env).ok(), Some(CTyp::Unit));
        assert_eq!(lower(&Typ::id("string"), &env).ok(), Some(CTyp::String));
    }

    #[test]
    fn constant_ranges_fit_in_fint64() {
        let env = TypeEnv::default();
        let typ = Typ::range(NExp::constant(0), NExp::constant(31));
        assert_eq!(lower(&typ, &env).ok(), Some(CTyp::FInt(64)));
    }

    #[test]
    fn oversized_constant_range_falls_back_to_lint() {
        let env = TypeEnv::default();
        let huge = BigInt::from(i64::MAX) + 1;
        let typ = Typ::range(NExp::constant(0), NExp::Constant(huge));
        assert_eq!(lower(&typ, &env).ok(), Some(CTyp::LInt));
    }

    #[test]
    fn symbolic_atom_consults_the_prover() {
        struct AlwaysFits;
        impl Prover for AlwaysFits {
            fn prove(&self, _: &KindEnv, _: &NConstraint) -> bool {
                true
            }
        }
        let env = TypeEnv::default();
        let typ = Typ::Exist(
            vec![KindedId {
                kind: Kind::Int,
                id: Id::new("'n"),
            }],
            NConstraint::True,
            Box::new(Typ::atom(NExp::Var(Id::new("'n")))),
        );
        let ctx = Ctx::new(&env, &AlwaysFits);
        assert_eq!(
            lower_type(&typ, &ctx, Span::unknown()).ok(),
            Some(CTyp::FInt(64))
        );
        let ctx = Ctx::new(&env, &ConstProver);
        assert_eq!(
            lower_type(&typ, &ctx, Span::unknown()).ok(),
            Some(CTyp::LInt)
        );
    }

    #[test]
    fn bit_vectors_degrade_by_width() {
        let env = TypeEnv::default();
        assert_eq!(
            lower(&Typ::bits(32), &env).ok(),
            Some(CTyp::FBits(32, Dir::Dec))
        );
        assert_eq!(
            lower(&Typ::bits(80), &env).ok(),
            Some(CTyp::LBits(Dir::Dec))
        );
        let symbolic = Typ::App(
            Id::new("vector"),
            vec![
                TypArg::NExp(NExp::Var(Id::new("'n"))),
                TypArg::Dir(Dir::Dec),
                TypArg::Typ(Typ::id("bit")),
            ],
        );
        // ConstProver cannot bound a free variable.
        assert_eq!(lower(&symbolic, &env).ok(), Some(CTyp::LBits(Dir::Dec)));
    }

    #[test]
    fn nonbit_vectors_and_lists_are_structural() {
        let env = TypeEnv::default();
        let vec_typ = Typ::App(
            Id::new("vector"),
            vec![
                TypArg::NExp(NExp::constant(4)),
                TypArg::Dir(Dir::Dec),
                TypArg::Typ(Typ::id("bool")),
            ],
        );
        assert_eq!(
            lower(&vec_typ, &env).ok(),
            Some(CTyp::Vector(Dir::Dec, Box::new(CTyp::Bool)))
        );
        assert_eq!(
            lower(&Typ::list(Typ::id("int")), &env).ok(),
            Some(CTyp::List(Box::new(CTyp::LInt)))
        );
    }

    #[test]
    fn recursive_variant_lowers_finitely() {
        let mut env = TypeEnv::default();
        env.add_type_def(&TypeDef::Variant {
            id: Id::new("tree"),
            ctors: vec![
                (Typ::id("int"), Id::new("Leaf")),
                (Typ::list(Typ::id("tree")), Id::new("Node")),
            ],
        });
        let lowered = lower(&Typ::id("tree"), &env).expect("lowers");
        let CTyp::Variant(id, ctors) = &lowered else {
            panic!("expected variant, got {lowered:?}");
        };
        assert_eq!(id.as_str(), "tree");
        assert_eq!(ctors[0].1, CTyp::LInt);
        // The recursive occurrence appears nominally inside the list.
        assert_eq!(
            ctors[1].1,
            CTyp::List(Box::new(CTyp::Variant(Id::new("tree"), vec![])))
        );
    }

    #[test]
    fn type_variables_defer_to_poly() {
        let env = TypeEnv::default();
        assert_eq!(
            lower(&Typ::Var(Id::new("'a")), &env).ok(),
            Some(CTyp::Poly(Id::new("'a")))
        );
    }

    #[test]
    fn unknown_types_are_fatal() {
        let env = TypeEnv::default();
        assert!(matches!(
            lower(&Typ::id("mystery"), &env),
            Err(Error::TypeLowering { .. })
        ));
    }

    #[test]
    fn lowering_is_deterministic() {
        let env = TypeEnv::default();
        let typ = Typ::Tuple(vec![Typ::bits(12), Typ::int(), Typ::bool()]);
        assert_eq!(lower(&typ, &env).ok(), lower(&typ, &env).ok());
    }
}
