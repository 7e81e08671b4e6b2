#![cfg(feature = "insta")]

//! Structural snapshots of the target IR and the emitted C for a small
//! model exercising registers, a specialized variant, and a primitive
//! rewrite.

use serde::Serialize;

use osprey::{codegen, compile_ir, CodegenConfig};
use osprey_core::ast::{Def, Exp, FunDef, Id, Lit, RegDef, TExp, Typ, TypeDef};
use osprey_core::diagnostics::Span;
use osprey_core::{ConstProver, Program, TypeEnv};

fn pretty_json<T: Serialize>(value: &T) -> String {
    let mut out = serde_json::to_string_pretty(value).expect("serialize json");
    out.push('\n');
    out
}

fn te(exp: Exp, typ: Typ) -> TExp {
    TExp::new(exp, typ, Span::unknown())
}

fn model() -> Program {
    Program {
        defs: vec![
            Def::Type(TypeDef::Variant {
                id: Id::new("result"),
                ctors: vec![
                    (Typ::Var(Id::new("'a")), Id::new("Ok")),
                    (Typ::id("string"), Id::new("Error")),
                ],
            }),
            Def::Register(RegDef {
                id: Id::new("PC"),
                typ: Typ::bits(64),
                init: Some(te(Exp::Lit(Lit::Bits(vec![false; 64])), Typ::bits(64))),
                span: Span::unknown(),
            }),
            Def::Fun(FunDef {
                id: Id::new("step"),
                params: vec![Id::new("insn")],
                typ: Typ::Fn(vec![Typ::bits(32)], Box::new(Typ::id("result"))),
                body: te(
                    Exp::Call(
                        Id::new("Ok"),
                        vec![te(
                            Exp::Call(
                                Id::new("add_bits"),
                                vec![
                                    te(Exp::Id(Id::new("insn")), Typ::bits(32)),
                                    te(Exp::Lit(Lit::Bits(vec![false; 32])), Typ::bits(32)),
                                ],
                            ),
                            Typ::bits(32),
                        )],
                    ),
                    Typ::id("result"),
                ),
                span: Span::unknown(),
            }),
        ],
    }
}

#[test]
fn snapshot_target_ir_and_emitted_c() {
    let program = model();
    let env = TypeEnv::from_program(&program);
    let mut cfg = CodegenConfig::default();
    cfg.optimize_primops = true;

    let (cprog, _) = compile_ir(&program, &env, &ConstProver, &cfg).expect("compiles");
    insta::assert_snapshot!("step_target_ir", pretty_json(&cprog));

    let text = codegen(&program, &env, &ConstProver, &cfg).expect("emits");
    insta::assert_snapshot!("step_generated_c", text);
}
