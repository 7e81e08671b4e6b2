//! Expression normalization: rewrite nested source expressions into a form
//! where every operand of a call, branch condition, or field access is
//! atomic — a literal, an identifier, a tuple of atomics, or an inline
//! fragment left behind by the primitive analyzer.
//!
//! Leaves carry both the source type and its lowered representation, so later
//! stages never have to re-run inference, only re-lower under the local kind
//! environment.

use serde::{Deserialize, Serialize};

use osprey_core::ast::{Dir, Exp, Id, LExp, Lit, LoopKind, Pat, TExp, TPat, Typ};
use osprey_core::diagnostics::Span;
use osprey_core::{lower_type, CTyp, Ctx, Result};

use crate::cir::{CVal, NameGen, VLit};

/// Atomic values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AVal {
    Lit(Lit, Typ, CTyp),
    Id(Id, Typ, CTyp),
    /// A register reference; the representation is `Ref` of the register's.
    Ref(Id, Typ, CTyp),
    Tuple(Vec<AVal>),
    /// An already-inline fragment produced by the primitive analyzer.
    CVal(CVal, CTyp),
}

impl AVal {
    pub fn ctyp(&self) -> CTyp {
        match self {
            AVal::Lit(_, _, ctyp) | AVal::Id(_, _, ctyp) | AVal::Ref(_, _, ctyp) => ctyp.clone(),
            AVal::Tuple(items) => CTyp::Tup(items.iter().map(AVal::ctyp).collect()),
            AVal::CVal(_, ctyp) => ctyp.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AExp {
    pub kind: AExpKind,
    pub typ: Typ,
    pub span: Span,
}

impl AExp {
    pub fn new(kind: AExpKind, typ: Typ, span: Span) -> Self {
        AExp { kind, typ, span }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AExpKind {
    Val(AVal),
    /// Application of a function, primitive, or constructor to atomics.
    App(Id, Vec<AVal>),
    Let(Id, Typ, Box<AExp>, Box<AExp>),
    Block(Vec<AExp>, Box<AExp>),
    If(AVal, Box<AExp>, Box<AExp>),
    Case(AVal, Vec<AArm>),
    Try(Box<AExp>, Vec<AArm>),
    Assign(ALExp, Box<AExp>),
    Return(AVal),
    Throw(AVal),
    Field(AVal, Id),
    Struct(Id, Vec<(Id, AVal)>),
    List(Vec<AVal>),
    For(Id, AVal, AVal, AVal, Dir, Box<AExp>),
    Loop(LoopKind, Box<AExp>, Box<AExp>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AArm {
    pub pat: TPat,
    pub guard: Option<AExp>,
    pub body: AExp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ALExp {
    Id(Id, Typ),
    Field(Box<ALExp>, Id, Typ),
}

/// Normalize one function body. `params` seeds the local representation
/// environment with the function's lowered parameters.
pub fn normalize(
    exp: &TExp,
    params: &[(Id, CTyp)],
    ctx: &Ctx,
    names: &mut NameGen,
) -> Result<AExp> {
    let mut locals = im::HashMap::new();
    for (id, ctyp) in params {
        locals.insert(id.clone(), ctyp.clone());
    }
    Normalizer { ctx, locals, names }.normalize(exp)
}

struct Normalizer<'a, 'b> {
    ctx: &'a Ctx<'a>,
    locals: im::HashMap<Id, CTyp>,
    names: &'b mut NameGen,
}

impl Normalizer<'_, '_> {
    fn lower(&self, typ: &Typ, span: Span) -> Result<CTyp> {
        lower_type(typ, self.ctx, span)
    }

    fn normalize(&mut self, exp: &TExp) -> Result<AExp> {
        let span = exp.span;
        let typ = exp.typ.clone();
        match &exp.exp {
            Exp::Lit(_) | Exp::Id(_) | Exp::Ref(_) | Exp::Tuple(_) => {
                let mut binds = Vec::new();
                let aval = self.atomize(exp, &mut binds)?;
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::Val(aval), typ, span)))
            }
            // Short-circuit booleans become branches before any argument is
            // forced.
            Exp::Call(id, args) if id.as_str() == "and_bool" && args.len() == 2 => {
                let mut binds = Vec::new();
                let lhs = self.atomize(&args[0], &mut binds)?;
                let rhs = self.normalize(&args[1])?;
                let false_exp = AExp::new(
                    AExpKind::Val(AVal::Lit(Lit::Bool(false), Typ::bool(), CTyp::Bool)),
                    Typ::bool(),
                    span,
                );
                let body = AExp::new(
                    AExpKind::If(lhs, Box::new(rhs), Box::new(false_exp)),
                    typ,
                    span,
                );
                Ok(self.wrap_binds(binds, body))
            }
            Exp::Call(id, args) if id.as_str() == "or_bool" && args.len() == 2 => {
                let mut binds = Vec::new();
                let lhs = self.atomize(&args[0], &mut binds)?;
                let rhs = self.normalize(&args[1])?;
                let true_exp = AExp::new(
                    AExpKind::Val(AVal::Lit(Lit::Bool(true), Typ::bool(), CTyp::Bool)),
                    Typ::bool(),
                    span,
                );
                let body = AExp::new(
                    AExpKind::If(lhs, Box::new(true_exp), Box::new(rhs)),
                    typ,
                    span,
                );
                Ok(self.wrap_binds(binds, body))
            }
            Exp::Call(id, args) => {
                let mut binds = Vec::new();
                let mut avals = Vec::with_capacity(args.len());
                for arg in args {
                    avals.push(self.atomize(arg, &mut binds)?);
                }
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::App(id.clone(), avals), typ, span)))
            }
            Exp::Struct(id, fields) => {
                let mut binds = Vec::new();
                let mut lowered = Vec::with_capacity(fields.len());
                for (field, value) in fields {
                    lowered.push((field.clone(), self.atomize(value, &mut binds)?));
                }
                Ok(self.wrap_binds(
                    binds,
                    AExp::new(AExpKind::Struct(id.clone(), lowered), typ, span),
                ))
            }
            Exp::Field(base, field) => {
                let mut binds = Vec::new();
                let base = self.atomize(base, &mut binds)?;
                Ok(self.wrap_binds(
                    binds,
                    AExp::new(AExpKind::Field(base, field.clone()), typ, span),
                ))
            }
            Exp::List(items) => {
                let mut binds = Vec::new();
                let mut avals = Vec::with_capacity(items.len());
                for item in items {
                    avals.push(self.atomize(item, &mut binds)?);
                }
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::List(avals), typ, span)))
            }
            Exp::If(cond, then_exp, else_exp) => {
                let mut binds = Vec::new();
                let cond = self.atomize(cond, &mut binds)?;
                let then_exp = self.normalize(then_exp)?;
                let else_exp = self.normalize(else_exp)?;
                Ok(self.wrap_binds(
                    binds,
                    AExp::new(
                        AExpKind::If(cond, Box::new(then_exp), Box::new(else_exp)),
                        typ,
                        span,
                    ),
                ))
            }
            Exp::Match(scrutinee, arms) => {
                let mut binds = Vec::new();
                let scrutinee = self.atomize(scrutinee, &mut binds)?;
                let arms = arms
                    .iter()
                    .map(|arm| self.normalize_arm(arm))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::Case(scrutinee, arms), typ, span)))
            }
            Exp::Try(body, arms) => {
                let body = self.normalize(body)?;
                let arms = arms
                    .iter()
                    .map(|arm| self.normalize_arm(arm))
                    .collect::<Result<Vec<_>>>()?;
                Ok(AExp::new(AExpKind::Try(Box::new(body), arms), typ, span))
            }
            Exp::Let(pat, bound, body) => {
                let bound = self.normalize(bound)?;
                match &pat.pat {
                    Pat::Id(id) => {
                        let ctyp = self.lower(&pat.typ, pat.span)?;
                        let saved = self.locals.clone();
                        self.locals.insert(id.clone(), ctyp);
                        let body = self.normalize(body)?;
                        self.locals = saved;
                        Ok(AExp::new(
                            AExpKind::Let(
                                id.clone(),
                                pat.typ.clone(),
                                Box::new(bound),
                                Box::new(body),
                            ),
                            typ,
                            span,
                        ))
                    }
                    Pat::Wild => {
                        let scratch = self.gensym();
                        let body = self.normalize(body)?;
                        Ok(AExp::new(
                            AExpKind::Let(scratch, pat.typ.clone(), Box::new(bound), Box::new(body)),
                            typ,
                            span,
                        ))
                    }
                    // A destructuring let is a one-armed match.
                    _ => {
                        let scratch = self.gensym();
                        let scratch_ctyp = self.lower(&pat.typ, pat.span)?;
                        let saved = self.locals.clone();
                        self.bind_pattern(pat)?;
                        let body = self.normalize(body)?;
                        self.locals = saved;
                        let case = AExp::new(
                            AExpKind::Case(
                                AVal::Id(scratch.clone(), pat.typ.clone(), scratch_ctyp),
                                vec![AArm {
                                    pat: pat.clone(),
                                    guard: None,
                                    body,
                                }],
                            ),
                            typ.clone(),
                            span,
                        );
                        Ok(AExp::new(
                            AExpKind::Let(scratch, pat.typ.clone(), Box::new(bound), Box::new(case)),
                            typ,
                            span,
                        ))
                    }
                }
            }
            Exp::Var(id, bound, body) => {
                let bound = self.normalize(bound)?;
                let bound_typ = bound.typ.clone();
                let ctyp = self.lower(&bound_typ, span)?;
                let saved = self.locals.clone();
                self.locals.insert(id.clone(), ctyp);
                let body = self.normalize(body)?;
                self.locals = saved;
                Ok(AExp::new(
                    AExpKind::Let(id.clone(), bound_typ, Box::new(bound), Box::new(body)),
                    typ,
                    span,
                ))
            }
            Exp::Assign(lexp, value) => {
                let value = self.normalize(value)?;
                let alexp = lower_lexp(lexp);
                Ok(AExp::new(
                    AExpKind::Assign(alexp, Box::new(value)),
                    typ,
                    span,
                ))
            }
            Exp::Block(exps) => {
                let Some((last, init)) = exps.split_last() else {
                    return Ok(AExp::new(
                        AExpKind::Val(AVal::Lit(Lit::Unit, Typ::unit(), CTyp::Unit)),
                        typ,
                        span,
                    ));
                };
                let init = init
                    .iter()
                    .map(|exp| self.normalize(exp))
                    .collect::<Result<Vec<_>>>()?;
                let last = self.normalize(last)?;
                Ok(AExp::new(AExpKind::Block(init, Box::new(last)), typ, span))
            }
            Exp::Return(value) => {
                let mut binds = Vec::new();
                let value = self.atomize(value, &mut binds)?;
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::Return(value), typ, span)))
            }
            Exp::Throw(value) => {
                let mut binds = Vec::new();
                let value = self.atomize(value, &mut binds)?;
                Ok(self.wrap_binds(binds, AExp::new(AExpKind::Throw(value), typ, span)))
            }
            Exp::For(index, from, to, step, dir, body) => {
                let mut binds = Vec::new();
                let from = self.atomize(from, &mut binds)?;
                let to = self.atomize(to, &mut binds)?;
                let step = self.atomize(step, &mut binds)?;
                // Loop indices always fit in a machine word.
                let saved = self.locals.clone();
                self.locals.insert(index.clone(), CTyp::FInt(64));
                let body = self.normalize(body)?;
                self.locals = saved;
                Ok(self.wrap_binds(
                    binds,
                    AExp::new(
                        AExpKind::For(index.clone(), from, to, step, *dir, Box::new(body)),
                        typ,
                        span,
                    ),
                ))
            }
            Exp::Loop(kind, cond, body) => {
                let cond = self.normalize(cond)?;
                let body = self.normalize(body)?;
                Ok(AExp::new(
                    AExpKind::Loop(*kind, Box::new(cond), Box::new(body)),
                    typ,
                    span,
                ))
            }
        }
    }

    /// Force an expression into atomic position, accumulating the bindings
    /// needed to name its non-atomic parts.
    fn atomize(&mut self, exp: &TExp, binds: &mut Vec<(Id, Typ, AExp)>) -> Result<AVal> {
        match &exp.exp {
            Exp::Lit(lit) => {
                let ctyp = self.lower(&exp.typ, exp.span)?;
                Ok(AVal::Lit(lit.clone(), exp.typ.clone(), ctyp))
            }
            Exp::Id(id) => {
                // Enumeration members are inline fragments from the start.
                if let Some(enum_id) = self.ctx.env.enum_member(id) {
                    let members = self.ctx.env.enumeration(enum_id).unwrap_or(&[]).to_vec();
                    let ctyp = CTyp::Enum(enum_id.clone(), members);
                    return Ok(AVal::CVal(
                        CVal::Lit(VLit::Member(id.clone()), ctyp.clone()),
                        ctyp,
                    ));
                }
                let ctyp = match self.locals.get(id) {
                    Some(ctyp) => ctyp.clone(),
                    None => self.lower(&exp.typ, exp.span)?,
                };
                Ok(AVal::Id(id.clone(), exp.typ.clone(), ctyp))
            }
            Exp::Ref(id) => {
                let ctyp = self.lower(&exp.typ, exp.span)?;
                Ok(AVal::Ref(id.clone(), exp.typ.clone(), ctyp))
            }
            Exp::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.atomize(item, binds))
                    .collect::<Result<Vec<_>>>()?;
                Ok(AVal::Tuple(items))
            }
            _ => {
                let id = self.gensym();
                let aexp = self.normalize(exp)?;
                let ctyp = self.lower(&exp.typ, exp.span)?;
                self.locals.insert(id.clone(), ctyp.clone());
                binds.push((id.clone(), exp.typ.clone(), aexp));
                Ok(AVal::Id(id, exp.typ.clone(), ctyp))
            }
        }
    }

    fn normalize_arm(&mut self, arm: &osprey_core::ast::Arm) -> Result<AArm> {
        let saved = self.locals.clone();
        self.bind_pattern(&arm.pat)?;
        let guard = arm
            .guard
            .as_ref()
            .map(|guard| self.normalize(guard))
            .transpose()?;
        let body = self.normalize(&arm.body)?;
        self.locals = saved;
        Ok(AArm {
            pat: arm.pat.clone(),
            guard,
            body,
        })
    }

    /// Record the lowered representation of every name a pattern binds.
    fn bind_pattern(&mut self, pat: &TPat) -> Result<()> {
        match &pat.pat {
            Pat::Id(id) => {
                let ctyp = self.lower(&pat.typ, pat.span)?;
                self.locals.insert(id.clone(), ctyp);
            }
            Pat::Tuple(items) | Pat::Ctor(_, items) => {
                for item in items {
                    self.bind_pattern(item)?;
                }
            }
            Pat::Wild | Pat::Lit(_) => {}
        }
        Ok(())
    }

    fn wrap_binds(&mut self, binds: Vec<(Id, Typ, AExp)>, body: AExp) -> AExp {
        let mut out = body;
        for (id, typ, bound) in binds.into_iter().rev() {
            let out_typ = out.typ.clone();
            let span = out.span;
            out = AExp::new(
                AExpKind::Let(id, typ, Box::new(bound), Box::new(out)),
                out_typ,
                span,
            );
        }
        out
    }

    fn gensym(&mut self) -> Id {
        match self.names.fresh() {
            crate::cir::Name::Id(id, _) => id,
            _ => unreachable!("fresh names are always locals"),
        }
    }
}

fn lower_lexp(lexp: &LExp) -> ALExp {
    match lexp {
        LExp::Id(id, typ) => ALExp::Id(id.clone(), typ.clone()),
        LExp::Field(base, field, typ) => {
            ALExp::Field(Box::new(lower_lexp(base)), field.clone(), typ.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_core::{ConstProver, TypeEnv};

    fn texp(exp: Exp, typ: Typ) -> TExp {
        TExp::new(exp, typ, Span::unknown())
    }

    #[test]
    fn nested_calls_are_let_bound() {
        let env = TypeEnv::default();
        let ctx = Ctx::new(&env, &ConstProver);
        let mut names = NameGen::new();
        // f(g(x)) — the inner call must be named.
        let inner = texp(
            Exp::Call(
                Id::new("g"),
                vec![texp(Exp::Id(Id::new("x")), Typ::bits(8))],
            ),
            Typ::bits(8),
        );
        let outer = texp(Exp::Call(Id::new("f"), vec![inner]), Typ::bits(8));
        let normalized = normalize(
            &outer,
            &[(Id::new("x"), CTyp::FBits(8, Dir::Dec))],
            &ctx,
            &mut names,
        )
        .expect("normalizes");
        let AExpKind::Let(_, _, bound, body) = &normalized.kind else {
            panic!("expected let, got {normalized:?}");
        };
        assert!(matches!(bound.kind, AExpKind::App(_, _)));
        assert!(matches!(body.kind, AExpKind::App(_, _)));
    }

    #[test]
    fn and_bool_short_circuits() {
        let env = TypeEnv::default();
        let ctx = Ctx::new(&env, &ConstProver);
        let mut names = NameGen::new();
        let call = texp(
            Exp::Call(
                Id::new("and_bool"),
                vec![
                    texp(Exp::Id(Id::new("a")), Typ::bool()),
                    texp(
                        Exp::Call(
                            Id::new("expensive"),
                            vec![texp(Exp::Id(Id::new("b")), Typ::bool())],
                        ),
                        Typ::bool(),
                    ),
                ],
            ),
            Typ::bool(),
        );
        let params = [
            (Id::new("a"), CTyp::Bool),
            (Id::new("b"), CTyp::Bool),
        ];
        let normalized = normalize(&call, &params, &ctx, &mut names).expect("normalizes");
        // The right operand must live under the branch, not before it.
        let AExpKind::If(_, then_exp, else_exp) = &normalized.kind else {
            panic!("expected if, got {normalized:?}");
        };
        assert!(matches!(then_exp.kind, AExpKind::App(_, _)));
        assert!(matches!(else_exp.kind, AExpKind::Val(AVal::Lit(Lit::Bool(false), _, _))));
    }

    #[test]
    fn loop_indices_are_machine_words() {
        let env = TypeEnv::default();
        let ctx = Ctx::new(&env, &ConstProver);
        let mut names = NameGen::new();
        let body = texp(Exp::Id(Id::new("i")), Typ::int());
        let loop_exp = texp(
            Exp::For(
                Id::new("i"),
                Box::new(texp(Exp::Lit(Lit::Num(0.into())), Typ::int())),
                Box::new(texp(Exp::Lit(Lit::Num(7.into())), Typ::int())),
                Box::new(texp(Exp::Lit(Lit::Num(1.into())), Typ::int())),
                Dir::Inc,
                Box::new(body),
            ),
            Typ::unit(),
        );
        let normalized = normalize(&loop_exp, &[], &ctx, &mut names).expect("normalizes");
        let AExpKind::For(_, _, _, _, _, body) = &normalized.kind else {
            panic!("expected for, got {normalized:?}");
        };
        let AExpKind::Val(AVal::Id(_, _, ctyp)) = &body.kind else {
            panic!("expected value body");
        };
        assert_eq!(*ctyp, CTyp::FInt(64));
    }
}
