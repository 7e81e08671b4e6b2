//! End-to-end scenarios over the whole backend: source IR in, C text (or
//! rewritten target IR) out.

use osprey::cir::{CDef, CProgram, Instr, Name};
use osprey::{codegen, compile_ir, CodegenConfig};
use osprey_core::ast::{Arm, Def, Exp, FunDef, Id, Lit, Pat, TExp, TPat, Typ, TypeDef};
use osprey_core::diagnostics::Span;
use osprey_core::{ConstProver, Program, TypeEnv};

fn sp() -> Span {
    Span::unknown()
}

fn te(exp: Exp, typ: Typ) -> TExp {
    TExp::new(exp, typ, sp())
}

fn var(name: &str, typ: Typ) -> TExp {
    te(Exp::Id(Id::new(name)), typ)
}

fn call(f: &str, args: Vec<TExp>, typ: Typ) -> TExp {
    te(Exp::Call(Id::new(f), args), typ)
}

fn num(n: i64) -> TExp {
    te(Exp::Lit(Lit::Num(n.into())), Typ::int())
}

fn unit() -> TExp {
    te(Exp::Lit(Lit::Unit), Typ::unit())
}

fn fun(name: &str, params: &[(&str, Typ)], ret: Typ, body: TExp) -> Def {
    Def::Fun(FunDef {
        id: Id::new(name),
        params: params.iter().map(|(p, _)| Id::new(*p)).collect(),
        typ: Typ::Fn(
            params.iter().map(|(_, t)| t.clone()).collect(),
            Box::new(ret),
        ),
        body,
        span: sp(),
    })
}

fn generate(program: &Program, cfg: &CodegenConfig) -> String {
    let env = TypeEnv::from_program(program);
    codegen(program, &env, &ConstProver, cfg).expect("codegen succeeds")
}

fn lower_ir(program: &Program, cfg: &CodegenConfig) -> CProgram {
    let env = TypeEnv::from_program(program);
    compile_ir(program, &env, &ConstProver, cfg)
        .expect("compilation succeeds")
        .0
}

fn add32_program() -> Program {
    Program {
        defs: vec![fun(
            "add32",
            &[("x", Typ::bits(32)), ("y", Typ::bits(32))],
            Typ::bits(32),
            call(
                "add_bits",
                vec![var("x", Typ::bits(32)), var("y", Typ::bits(32))],
                Typ::bits(32),
            ),
        )],
    }
}

#[test]
fn add32_body_specializes_to_masked_machine_add() {
    let mut cfg = CodegenConfig::default();
    cfg.optimize_primops = true;
    let text = generate(&add32_program(), &cfg);
    assert!(text.contains("uint64_t zadd32(uint64_t zx, uint64_t zy)"));
    assert!(text.contains("(zx + zy)"));
    assert!(text.contains("UINT64_MAX >> (64 - 32)"));
    assert!(!text.contains("add_bits("));
}

#[test]
fn disabling_the_analyzer_keeps_the_runtime_call() {
    let text = generate(&add32_program(), &CodegenConfig::default());
    assert!(text.contains("add_bits("));
    assert!(!text.contains("UINT64_MAX >> (64 - 32)"));
}

#[test]
fn zero_extend_of_fixed_bits_needs_no_helper() {
    let mut cfg = CodegenConfig::default();
    cfg.optimize_primops = true;
    let body = call(
        "zero_extend",
        vec![te(Exp::Lit(Lit::Bits(vec![false; 32])), Typ::bits(32))],
        Typ::bits(64),
    );
    let program = Program {
        defs: vec![fun("widen", &[("u", Typ::unit())], Typ::bits(64), body)],
    };
    let text = generate(&program, &cfg);
    assert!(text.contains("UINT64_C(0x0)"));
    assert!(!text.contains("fast_zero_extend"));
}

#[test]
fn narrow_append_inlines_and_wide_append_calls_the_runtime() {
    let mut cfg = CodegenConfig::default();
    cfg.optimize_primops = true;
    let narrow = Program {
        defs: vec![fun(
            "cat60",
            &[("hi", Typ::bits(40)), ("lo", Typ::bits(20))],
            Typ::bits(60),
            call(
                "append",
                vec![var("hi", Typ::bits(40)), var("lo", Typ::bits(20))],
                Typ::bits(60),
            ),
        )],
    };
    let text = generate(&narrow, &cfg);
    assert!(text.contains("zhi << INT64_C(20)"));

    let wide = Program {
        defs: vec![fun(
            "cat80",
            &[("hi", Typ::bits(40)), ("lo", Typ::bits(40))],
            Typ::bits(80),
            call(
                "append",
                vec![var("hi", Typ::bits(40)), var("lo", Typ::bits(40))],
                Typ::bits(80),
            ),
        )],
    };
    let text = generate(&wide, &cfg);
    // Falls back to the helper filling an arbitrary-length result.
    assert!(text.contains("append(&"));
    assert!(text.contains("lbits"));
}

fn tree_program() -> Program {
    Program {
        defs: vec![
            Def::Type(TypeDef::Variant {
                id: Id::new("tree"),
                ctors: vec![
                    (Typ::Var(Id::new("'a")), Id::new("Leaf")),
                    (Typ::list(Typ::id("tree")), Id::new("Node")),
                ],
            }),
            fun(
                "build",
                &[("u", Typ::unit())],
                Typ::id("tree"),
                call("Leaf", vec![num(3)], Typ::id("tree")),
            ),
        ],
    }
}

#[test]
fn variant_specialization_monomorphizes_used_constructors() {
    let cprog = lower_ir(&tree_program(), &CodegenConfig::default());
    let ctors = cprog
        .variant_def(&Id::new("tree"))
        .expect("tree survives specialization");
    assert!(ctors.iter().all(|(_, ctyp)| !ctyp.has_poly()));
    assert!(ctors.iter().any(|(id, _)| id.as_str() == "Leaf_i"));
    assert!(ctors.iter().any(|(id, _)| id.as_str() == "Node"));
    assert!(!ctors.iter().any(|(id, _)| id.as_str() == "Leaf"));

    let text = generate(&tree_program(), &CodegenConfig::default());
    assert!(text.contains("Kind_zLeaf_i"));
    assert!(text.contains("static void zLeaf_i(struct ztree *rop, lint op)"));
}

#[test]
fn heap_returns_rewrite_to_one_exit_label() {
    // Early return inside an if inside a block, with an arbitrary-precision
    // (heap-returned) result.
    let body = te(
        Exp::Block(vec![
            te(
                Exp::If(
                    Box::new(var("flag", Typ::bool())),
                    Box::new(te(Exp::Return(Box::new(num(1))), Typ::unit())),
                    Box::new(unit()),
                ),
                Typ::unit(),
            ),
            num(2),
        ]),
        Typ::int(),
    );
    let program = Program {
        defs: vec![fun("choose", &[("flag", Typ::bool())], Typ::int(), body)],
    };
    let text = generate(&program, &CodegenConfig::default());
    assert!(text.contains("void zchoose(lint *rop, bool zflag)"));
    // Both return sites copy through the caller's pointer.
    assert!(text.matches("(*rop)").count() >= 2);
    // Exactly one exit label, jumped to from the early site.
    let labels = text
        .lines()
        .filter(|line| line.starts_with("end_function_") && line.ends_with(": ;"))
        .count();
    assert_eq!(labels, 1);
    assert!(text.contains("goto end_function_"));
}

#[test]
fn hoisting_skips_recursive_functions_and_rewrites_the_rest() {
    let even = fun(
        "even",
        &[("n", Typ::int())],
        Typ::bool(),
        te(
            Exp::Let(
                TPat {
                    pat: Pat::Id(Id::new("t")),
                    typ: Typ::int(),
                    span: sp(),
                },
                Box::new(num(5)),
                Box::new(call("odd", vec![var("t", Typ::int())], Typ::bool())),
            ),
            Typ::bool(),
        ),
    );
    let odd = fun(
        "odd",
        &[("n", Typ::int())],
        Typ::bool(),
        call("even", vec![var("n", Typ::int())], Typ::bool()),
    );
    let plain = fun(
        "plain",
        &[("u", Typ::unit())],
        Typ::int(),
        te(
            Exp::Let(
                TPat {
                    pat: Pat::Id(Id::new("a")),
                    typ: Typ::int(),
                    span: sp(),
                },
                Box::new(num(1)),
                Box::new(te(
                    Exp::Let(
                        TPat {
                            pat: Pat::Id(Id::new("b")),
                            typ: Typ::int(),
                            span: sp(),
                        },
                        Box::new(num(2)),
                        Box::new(var("a", Typ::int())),
                    ),
                    Typ::int(),
                )),
            ),
            Typ::int(),
        ),
    );
    let program = Program {
        defs: vec![even, odd, plain],
    };
    let mut cfg = CodegenConfig::default();
    cfg.optimize_hoist_allocations = true;
    let cprog = lower_ir(&program, &cfg);

    fn body_has_heap_decl(instrs: &[Instr]) -> bool {
        instrs.iter().any(|instr| {
            matches!(instr, Instr::Decl(ctyp, _) | Instr::Init(ctyp, _, _) if ctyp.is_heap())
                || instr.sub_instrs().iter().any(|sub| body_has_heap_decl(sub))
        })
    }

    for def in &cprog.defs {
        let CDef::Fun(cfun) = def else { continue };
        match cfun.id.as_str() {
            "even" | "odd" => {
                assert!(cfun.prologue.is_empty(), "{} must not hoist", cfun.id);
                assert!(cfun.epilogue.is_empty());
                if cfun.id.as_str() == "even" {
                    assert!(body_has_heap_decl(&cfun.body));
                }
            }
            "plain" => {
                // Two named locals plus their literal temporaries: at least
                // two creates up front, matching kills at the end, and no
                // heap declare left mid-body.
                assert!(cfun.prologue.len() >= 2, "prologue: {:?}", cfun.prologue);
                assert_eq!(cfun.prologue.len(), cfun.epilogue.len());
                assert!(!body_has_heap_decl(&cfun.body));
                assert!(cfun
                    .body
                    .iter()
                    .any(|i| matches!(i, Instr::Reset(_, _) | Instr::Reinit(_, _, _))));
            }
            _ => {}
        }
    }
}

#[test]
fn straight_line_heap_locals_balance_declares_and_clears() {
    let program = Program {
        defs: vec![fun(
            "sum",
            &[("u", Typ::unit())],
            Typ::int(),
            te(
                Exp::Let(
                    TPat {
                        pat: Pat::Id(Id::new("a")),
                        typ: Typ::int(),
                        span: sp(),
                    },
                    Box::new(num(40)),
                    Box::new(call(
                        "add_int",
                        vec![var("a", Typ::int()), num(2)],
                        Typ::int(),
                    )),
                ),
                Typ::int(),
            ),
        )],
    };
    let cprog = lower_ir(&program, &CodegenConfig::default());
    let CDef::Fun(cfun) = &cprog.defs[0] else {
        panic!("expected function");
    };

    fn count(instrs: &[Instr], decls: &mut usize, clears: &mut usize) {
        for instr in instrs {
            match instr {
                Instr::Decl(ctyp, _) | Instr::Init(ctyp, _, _) if ctyp.is_heap() => *decls += 1,
                Instr::Clear(ctyp, _) if ctyp.is_heap() => *clears += 1,
                _ => {}
            }
            for sub in instr.sub_instrs() {
                count(sub, decls, clears);
            }
        }
    }
    let (mut decls, mut clears) = (0, 0);
    count(&cfun.body, &mut decls, &mut clears);
    assert!(decls > 0);
    assert_eq!(decls, clears);
}

#[test]
fn arm_bindings_get_unique_declarations() {
    let arm = |lit: bool, binder: &str| Arm {
        pat: TPat {
            pat: Pat::Tuple(vec![
                TPat {
                    pat: Pat::Lit(Lit::Bool(lit)),
                    typ: Typ::bool(),
                    span: sp(),
                },
                TPat {
                    pat: Pat::Id(Id::new(binder)),
                    typ: Typ::int(),
                    span: sp(),
                },
            ]),
            typ: Typ::Tuple(vec![Typ::bool(), Typ::int()]),
            span: sp(),
        },
        guard: None,
        body: var(binder, Typ::int()),
    };
    let scrutinee = te(
        Exp::Tuple(vec![var("flag", Typ::bool()), num(1)]),
        Typ::Tuple(vec![Typ::bool(), Typ::int()]),
    );
    let body = te(
        Exp::Match(Box::new(scrutinee), vec![arm(true, "x"), arm(false, "x")]),
        Typ::int(),
    );
    let program = Program {
        defs: vec![fun("pick", &[("flag", Typ::bool())], Typ::int(), body)],
    };
    let cprog = lower_ir(&program, &CodegenConfig::default());
    let CDef::Fun(cfun) = &cprog.defs[0] else {
        panic!("expected function");
    };

    fn collect_decls(instrs: &[Instr], out: &mut Vec<Name>) {
        for instr in instrs {
            if let Instr::Decl(_, name) | Instr::Init(_, name, _) = instr {
                out.push(name.clone());
            }
            for sub in instr.sub_instrs() {
                collect_decls(sub, out);
            }
        }
    }
    let mut decls = Vec::new();
    collect_decls(&cfun.body, &mut decls);
    let mut deduped = decls.clone();
    deduped.sort_by_key(|n| format!("{n}"));
    deduped.dedup();
    assert_eq!(decls.len(), deduped.len(), "duplicate declares in {decls:?}");
}

#[test]
fn type_definitions_emit_in_dependency_order() {
    let program = Program {
        defs: vec![
            Def::Type(TypeDef::Record {
                id: Id::new("outer"),
                fields: vec![(Typ::id("inner"), Id::new("i"))],
            }),
            Def::Type(TypeDef::Record {
                id: Id::new("inner"),
                fields: vec![(Typ::bits(8), Id::new("b"))],
            }),
        ],
    };
    let text = generate(&program, &CodegenConfig::default());
    let inner = text.find("struct zinner {").expect("inner emitted");
    let outer = text.find("struct zouter {").expect("outer emitted");
    assert!(inner < outer);
}

#[test]
fn exceptions_thread_through_state_and_scaffold() {
    let program = Program {
        defs: vec![
            Def::Type(TypeDef::Variant {
                id: Id::new("exception"),
                ctors: vec![(Typ::unit(), Id::new("Overflow"))],
            }),
            fun(
                "trip",
                &[("u", Typ::unit())],
                Typ::unit(),
                te(
                    Exp::Throw(Box::new(call(
                        "Overflow",
                        vec![unit()],
                        Typ::id("exception"),
                    ))),
                    Typ::unit(),
                ),
            ),
        ],
    };
    let text = generate(&program, &CodegenConfig::default());
    assert!(text.contains("struct zexception *current_exception = NULL;"));
    assert!(text.contains("have_exception = true;"));
    assert!(text.contains("end_block_exception_"));
    assert!(text.contains("CREATE(union_exception)(current_exception);"));
    assert!(text.contains("KILL(union_exception)(current_exception);"));
}

#[test]
fn configuration_flags_shape_the_generated_surface() {
    let program = add32_program();
    let env = TypeEnv::from_program(&program);

    let text = codegen(&program, &env, &ConstProver, &CodegenConfig::default())
        .expect("codegen succeeds");
    assert!(text.contains("int main(int argc, char *argv[])"));
    assert!(text.contains("void model_init(void)"));

    let cfg = CodegenConfig::default().without_main();
    let text = codegen(&program, &env, &ConstProver, &cfg).expect("codegen succeeds");
    assert!(!text.contains("int main(int argc, char *argv[])"));
    assert!(text.contains("int model_main(int argc, char *argv[])"));

    let cfg = CodegenConfig::default().without_rts();
    let text = codegen(&program, &env, &ConstProver, &cfg).expect("codegen succeeds");
    assert!(!text.contains("void model_init(void)"));
    assert!(!text.contains("#include \"rts.h\""));

    let cfg = CodegenConfig::default().with_prefix("model_");
    let text = codegen(&program, &env, &ConstProver, &cfg).expect("codegen succeeds");
    assert!(text.contains("model_zadd32"));

    let mut cfg = CodegenConfig::default();
    cfg.static_linkage = true;
    let text = codegen(&program, &env, &ConstProver, &cfg).expect("codegen succeeds");
    assert!(text.contains("static uint64_t zadd32"));
}

#[test]
fn registers_are_zencoded_globals() {
    let program = Program {
        defs: vec![
            Def::Register(osprey_core::ast::RegDef {
                id: Id::new("PC"),
                typ: Typ::bits(64),
                init: Some(te(Exp::Lit(Lit::Bits(vec![false; 64])), Typ::bits(64))),
                span: sp(),
            }),
            fun(
                "read_pc",
                &[("u", Typ::unit())],
                Typ::bits(64),
                var("PC", Typ::bits(64)),
            ),
        ],
    };
    let text = generate(&program, &CodegenConfig::default());
    assert!(text.contains("uint64_t zPC;"));
    assert!(text.contains("zPC = UINT64_C(0x0);"));
}
