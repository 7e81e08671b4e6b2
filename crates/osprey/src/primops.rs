//! The primitive analyzer: recognize built-in operations over atomic values
//! of known representation and rewrite them into inline machine-level
//! fragments.
//!
//! Every rewrite is optional. An unrecognized operation, an operand whose
//! representation is too wide, or any internal failure leaves the call
//! untouched for the IR compiler to lower as an ordinary runtime call.

use osprey_core::ast::{Id, Lit, Typ};
use osprey_core::diagnostics::Span;
use osprey_core::{lower_type, CTyp, Ctx, Dir};

use crate::anf::{AArm, AExp, AExpKind, AVal};
use crate::cir::{CVal, Name, Op, VLit};

/// Rewrite recognized primitive applications throughout a normalized body.
pub fn analyze(aexp: AExp, ctx: &Ctx) -> AExp {
    let span = aexp.span;
    let typ = aexp.typ.clone();
    let kind = match aexp.kind {
        AExpKind::App(id, args) => match analyze_app(&id, &args, &typ, ctx, span) {
            Some(fragment) => {
                let ctyp = fragment.ctyp();
                AExpKind::Val(AVal::CVal(fragment, ctyp))
            }
            None => AExpKind::App(id, args),
        },
        AExpKind::Let(id, btyp, bound, body) => AExpKind::Let(
            id,
            btyp,
            Box::new(analyze(*bound, ctx)),
            Box::new(analyze(*body, ctx)),
        ),
        AExpKind::Block(exps, last) => AExpKind::Block(
            exps.into_iter().map(|exp| analyze(exp, ctx)).collect(),
            Box::new(analyze(*last, ctx)),
        ),
        AExpKind::If(cond, then_exp, else_exp) => AExpKind::If(
            cond,
            Box::new(analyze(*then_exp, ctx)),
            Box::new(analyze(*else_exp, ctx)),
        ),
        AExpKind::Case(scrutinee, arms) => AExpKind::Case(
            scrutinee,
            arms.into_iter()
                .map(|arm| AArm {
                    pat: arm.pat,
                    guard: arm.guard.map(|guard| analyze(guard, ctx)),
                    body: analyze(arm.body, ctx),
                })
                .collect(),
        ),
        AExpKind::Try(body, arms) => AExpKind::Try(
            Box::new(analyze(*body, ctx)),
            arms.into_iter()
                .map(|arm| AArm {
                    pat: arm.pat,
                    guard: arm.guard.map(|guard| analyze(guard, ctx)),
                    body: analyze(arm.body, ctx),
                })
                .collect(),
        ),
        AExpKind::Assign(alexp, value) => AExpKind::Assign(alexp, Box::new(analyze(*value, ctx))),
        AExpKind::For(index, from, to, step, dir, body) => {
            AExpKind::For(index, from, to, step, dir, Box::new(analyze(*body, ctx)))
        }
        AExpKind::Loop(kind, cond, body) => AExpKind::Loop(
            kind,
            Box::new(analyze(*cond, ctx)),
            Box::new(analyze(*body, ctx)),
        ),
        other => other,
    };
    AExp::new(kind, typ, span)
}

/// Try to specialize a single application. `None` means decline.
fn analyze_app(id: &Id, args: &[AVal], ret_typ: &Typ, ctx: &Ctx, span: Span) -> Option<CVal> {
    let ret_ctyp = lower_type(ret_typ, ctx, span).ok()?;
    let name = ctx.env.extern_binding(id).unwrap_or(id.as_str());

    if name.starts_with("undefined_") {
        return undefined_value(&ret_ctyp);
    }

    match (name, args) {
        ("eq_int" | "eq_bits" | "eq_bool" | "eq_bit" | "eq_unit", [a, b]) => {
            comparison(Op::Eq, "eq_sbits", a, b)
        }
        ("neq_int" | "neq_bits" | "neq_bool" | "neq_bit", [a, b]) => {
            comparison(Op::Neq, "neq_sbits", a, b)
        }
        ("lt_int", [a, b]) => int_comparison(Op::Ilt, a, b),
        ("lteq_int", [a, b]) => int_comparison(Op::Ilteq, a, b),
        ("gt_int", [a, b]) => int_comparison(Op::Igt, a, b),
        ("gteq_int", [a, b]) => int_comparison(Op::Igteq, a, b),

        ("zero_extend", [v, ..]) => {
            let x = fragment(v)?;
            let CTyp::FBits(m, dir) = ret_ctyp else {
                return None;
            };
            match x.ctyp() {
                // The stored word is already zero-padded; only the width
                // annotation changes.
                CTyp::FBits(n, _) if n <= m => Some(retyped(x, CTyp::FBits(m, dir))),
                CTyp::SBits(_, _) => Some(CVal::Call(
                    Op::Helper("fast_zero_extend".to_string()),
                    vec![x, int_lit(m as i64)],
                    CTyp::FBits(m, dir),
                )),
                _ => None,
            }
        }
        ("sign_extend", [v, ..]) => {
            let x = fragment(v)?;
            let CTyp::FBits(m, dir) = ret_ctyp else {
                return None;
            };
            match x.ctyp() {
                CTyp::FBits(n, _) if n <= m => Some(CVal::Call(
                    Op::Helper("fast_sign_extend".to_string()),
                    vec![x, int_lit(n as i64), int_lit(m as i64)],
                    CTyp::FBits(m, dir),
                )),
                CTyp::SBits(_, _) => Some(CVal::Call(
                    Op::Helper("fast_sign_extend2".to_string()),
                    vec![x, int_lit(m as i64)],
                    CTyp::FBits(m, dir),
                )),
                _ => None,
            }
        }

        ("add_bits", [a, b]) => {
            let (x, y, n, dir) = fbits_pair(a, b)?;
            if n > 63 {
                return None;
            }
            Some(CVal::Call(
                Op::Mask(n),
                vec![CVal::Call(
                    Op::Badd,
                    vec![x, y],
                    CTyp::FBits(n, dir),
                )],
                CTyp::FBits(n, dir),
            ))
        }
        ("xor_bits", [a, b]) => fbits_bitwise(Op::Bxor, a, b),
        ("or_bits", [a, b]) => fbits_bitwise(Op::Bor, a, b),
        ("and_bits", [a, b]) => fbits_bitwise(Op::Band, a, b),
        ("not_bits", [a]) => {
            let x = fragment(a)?;
            let CTyp::FBits(n, dir) = x.ctyp() else {
                return None;
            };
            Some(CVal::Call(
                Op::Mask(n),
                vec![CVal::Call(Op::Bnot, vec![x], CTyp::FBits(n, dir))],
                CTyp::FBits(n, dir),
            ))
        }

        ("vector_access", [v, i]) => {
            let x = fragment(v)?;
            let i = fragment(i)?;
            let CTyp::FBits(_, _) = x.ctyp() else {
                return None;
            };
            if !matches!(i.ctyp(), CTyp::FInt(_)) {
                return None;
            }
            let shifted = CVal::Call(Op::Shr, vec![x, i], CTyp::FBits(64, Dir::Dec));
            Some(CVal::Call(Op::Mask(1), vec![shifted], CTyp::Bit))
        }
        ("vector_subrange", [v, hi, lo]) => {
            let x = fragment(v)?;
            let CTyp::FBits(_, dir) = x.ctyp() else {
                return None;
            };
            let hi = const_int(hi)?;
            let lo = const_int(lo)?;
            let len = hi.checked_sub(lo)?.checked_add(1)?;
            if !(1..=64).contains(&len) {
                return None;
            }
            let shifted = CVal::Call(
                Op::Shr,
                vec![x, int_lit(lo)],
                CTyp::FBits(64, dir),
            );
            Some(CVal::Call(
                Op::Mask(len as u32),
                vec![shifted],
                CTyp::FBits(len as u32, dir),
            ))
        }
        ("slice", [v, lo, len]) => {
            let x = fragment(v)?;
            let CTyp::FBits(_, dir) = x.ctyp() else {
                return None;
            };
            let lo = fragment(lo)?;
            let len = const_int(len)?;
            if !(1..=64).contains(&len) {
                return None;
            }
            let shifted = CVal::Call(Op::Shr, vec![x, lo], CTyp::FBits(64, dir));
            Some(CVal::Call(
                Op::Mask(len as u32),
                vec![shifted],
                CTyp::FBits(len as u32, dir),
            ))
        }

        ("append", [a, b]) => {
            let x = fragment(a)?;
            let y = fragment(b)?;
            match (x.ctyp(), y.ctyp(), &ret_ctyp) {
                (CTyp::FBits(n, dir), CTyp::FBits(m, _), _) if n + m <= 64 => {
                    let shifted = CVal::Call(
                        Op::Shl,
                        vec![x, int_lit(m as i64)],
                        CTyp::FBits(n + m, dir),
                    );
                    Some(CVal::Call(
                        Op::Bor,
                        vec![shifted, y],
                        CTyp::FBits(n + m, dir),
                    ))
                }
                (CTyp::SBits(_, _), CTyp::SBits(_, _), CTyp::SBits(cap, dir)) => Some(CVal::Call(
                    Op::Helper("append_ss".to_string()),
                    vec![x, y],
                    CTyp::SBits(*cap, *dir),
                )),
                (CTyp::SBits(_, _), CTyp::FBits(m, _), CTyp::SBits(cap, dir)) => Some(CVal::Call(
                    Op::Helper("append_sf".to_string()),
                    vec![x, y, int_lit(m as i64)],
                    CTyp::SBits(*cap, *dir),
                )),
                (CTyp::FBits(n, _), CTyp::SBits(_, _), CTyp::SBits(cap, dir)) => Some(CVal::Call(
                    Op::Helper("append_fs".to_string()),
                    vec![x, int_lit(n as i64), y],
                    CTyp::SBits(*cap, *dir),
                )),
                _ => None,
            }
        }

        ("unsigned", [a]) => {
            let x = fragment(a)?;
            let CTyp::FBits(n, _) = x.ctyp() else {
                return None;
            };
            if !matches!(ret_ctyp, CTyp::FInt(_)) || n > 63 {
                return None;
            }
            Some(CVal::Call(
                Op::Helper("fast_unsigned".to_string()),
                vec![x],
                CTyp::FInt(64),
            ))
        }
        ("signed", [a]) => {
            let x = fragment(a)?;
            let CTyp::FBits(n, _) = x.ctyp() else {
                return None;
            };
            if !matches!(ret_ctyp, CTyp::FInt(_)) {
                return None;
            }
            Some(CVal::Call(
                Op::Helper("fast_signed".to_string()),
                vec![x, int_lit(n as i64)],
                CTyp::FInt(64),
            ))
        }

        ("replicate_bits", [v, times]) => {
            let x = fragment(v)?;
            let CTyp::FBits(n, _) = x.ctyp() else {
                return None;
            };
            let times = const_int(times)?;
            let CTyp::FBits(m, dir) = ret_ctyp else {
                return None;
            };
            if (n as i64).checked_mul(times)? != m as i64 {
                return None;
            }
            Some(CVal::Call(
                Op::Helper("fast_replicate_bits".to_string()),
                vec![int_lit(n as i64), x, int_lit(times)],
                CTyp::FBits(m, dir),
            ))
        }
        ("update_subrange", [v, hi, lo, value]) => {
            let x = fragment(v)?;
            let CTyp::FBits(n, dir) = x.ctyp() else {
                return None;
            };
            let hi = fragment(hi)?;
            let lo = fragment(lo)?;
            let value = fragment(value)?;
            if !matches!(value.ctyp(), CTyp::FBits(_, _)) {
                return None;
            }
            Some(CVal::Call(
                Op::Helper("fast_update_subrange".to_string()),
                vec![x, hi, lo, value],
                CTyp::FBits(n, dir),
            ))
        }

        ("add_int", [a, b]) => {
            if !matches!(ret_ctyp, CTyp::FInt(_)) {
                return None;
            }
            let x = int_fragment(a)?;
            let y = int_fragment(b)?;
            Some(CVal::Call(Op::Iadd, vec![x, y], CTyp::FInt(64)))
        }
        ("sub_int", [a, b]) => {
            if !matches!(ret_ctyp, CTyp::FInt(_)) {
                return None;
            }
            let x = int_fragment(a)?;
            let y = int_fragment(b)?;
            Some(CVal::Call(Op::Isub, vec![x, y], CTyp::FInt(64)))
        }
        ("neg_int", [a]) => {
            if !matches!(ret_ctyp, CTyp::FInt(_)) {
                return None;
            }
            let x = int_fragment(a)?;
            Some(CVal::Call(Op::Ineg, vec![x], CTyp::FInt(64)))
        }

        _ => None,
    }
}

// ── Fragment construction ────────────────────────────────────────────────────

/// Convert an atomic value into an inline fragment, when it has one.
fn fragment(aval: &AVal) -> Option<CVal> {
    match aval {
        AVal::CVal(cval, _) => Some(cval.clone()),
        AVal::Id(id, _, ctyp) if ctyp.is_stack() => {
            Some(CVal::Id(Name::Id(id.clone(), 0), ctyp.clone()))
        }
        AVal::Lit(lit, _, ctyp) if ctyp.is_stack() => {
            Some(CVal::Lit(lit_to_vlit(lit, ctyp)?, ctyp.clone()))
        }
        _ => None,
    }
}

fn int_fragment(aval: &AVal) -> Option<CVal> {
    let cval = fragment(aval)?;
    match cval.ctyp() {
        CTyp::FInt(_) => Some(cval),
        _ => None,
    }
}

fn lit_to_vlit(lit: &Lit, ctyp: &CTyp) -> Option<VLit> {
    match (lit, ctyp) {
        (Lit::Unit, _) => Some(VLit::Unit),
        (Lit::Bool(b), _) => Some(VLit::Bool(*b)),
        (Lit::Bit(b), _) => Some(VLit::Bit(*b)),
        (Lit::Num(n), CTyp::FInt(_)) => i64::try_from(n).ok().map(VLit::Int),
        (Lit::Bits(bits), CTyp::FBits(_, _)) => Some(VLit::Bits(bits.clone())),
        (Lit::String(s), _) => Some(VLit::String(s.clone())),
        _ => None,
    }
}

fn const_int(aval: &AVal) -> Option<i64> {
    match aval {
        AVal::Lit(Lit::Num(n), _, _) => i64::try_from(n).ok(),
        AVal::CVal(CVal::Lit(VLit::Int(n), _), _) => Some(*n),
        _ => None,
    }
}

fn int_lit(n: i64) -> CVal {
    CVal::Lit(VLit::Int(n), CTyp::FInt(64))
}

/// Rebuild a fragment with a different result representation (used where the
/// rewrite is representational only, e.g. zero-extension of fixed bits).
fn retyped(cval: CVal, ctyp: CTyp) -> CVal {
    match cval {
        CVal::Id(name, _) => CVal::Id(name, ctyp),
        CVal::Lit(vlit, _) => CVal::Lit(vlit, ctyp),
        CVal::TupleMember(inner, n, _) => CVal::TupleMember(inner, n, ctyp),
        CVal::Field(inner, field, _) => CVal::Field(inner, field, ctyp),
        CVal::CtorUnwrap(inner, ctor, _) => CVal::CtorUnwrap(inner, ctor, ctyp),
        CVal::Call(op, args, _) => CVal::Call(op, args, ctyp),
        CVal::Raw(text, _) => CVal::Raw(text, ctyp),
        kind @ CVal::CtorKind(_, _, _) => kind,
    }
}

fn comparison(op: Op, sbits_helper: &str, a: &AVal, b: &AVal) -> Option<CVal> {
    let x = fragment(a)?;
    let y = fragment(b)?;
    match (x.ctyp(), y.ctyp()) {
        (CTyp::SBits(_, _), CTyp::SBits(_, _)) => Some(CVal::Call(
            Op::Helper(sbits_helper.to_string()),
            vec![x, y],
            CTyp::Bool,
        )),
        (xc, yc) if xc == yc && xc.is_stack() && !matches!(xc, CTyp::Struct(_, _) | CTyp::Tup(_)) => {
            Some(CVal::Call(op, vec![x, y], CTyp::Bool))
        }
        _ => None,
    }
}

fn int_comparison(op: Op, a: &AVal, b: &AVal) -> Option<CVal> {
    let x = int_fragment(a)?;
    let y = int_fragment(b)?;
    Some(CVal::Call(op, vec![x, y], CTyp::Bool))
}

fn fbits_pair(a: &AVal, b: &AVal) -> Option<(CVal, CVal, u32, Dir)> {
    let x = fragment(a)?;
    let y = fragment(b)?;
    match (x.ctyp(), y.ctyp()) {
        (CTyp::FBits(n, dir), CTyp::FBits(m, _)) if n == m => Some((x, y, n, dir)),
        _ => None,
    }
}

fn fbits_bitwise(op: Op, a: &AVal, b: &AVal) -> Option<CVal> {
    let (x, y, n, dir) = fbits_pair(a, b)?;
    Some(CVal::Call(op, vec![x, y], CTyp::FBits(n, dir)))
}

/// Canonical representative for an unspecified value of a recognized
/// representation.
fn undefined_value(ctyp: &CTyp) -> Option<CVal> {
    match ctyp {
        CTyp::Unit => Some(CVal::unit()),
        CTyp::Bool => Some(CVal::bool(false)),
        CTyp::Bit => Some(CVal::Lit(VLit::Bit(false), CTyp::Bit)),
        CTyp::FInt(_) => Some(int_lit(0)),
        CTyp::FBits(n, dir) => Some(CVal::Lit(
            VLit::Bits(vec![false; *n as usize]),
            CTyp::FBits(*n, *dir),
        )),
        CTyp::Enum(id, members) => {
            let first = members.first()?;
            Some(CVal::Lit(
                VLit::Member(first.clone()),
                CTyp::Enum(id.clone(), members.clone()),
            ))
        }
        _ => None,
    }
}
