//! The IR compiler: translate normalized expressions into linear target-IR
//! instructions terminating in an assignment to a designated left-value.
//!
//! Invariants established here and preserved by every later pass:
//! every local is declared before use on all paths; every heap-represented
//! local is cleared on every exit path (including early returns and exception
//! propagation); short-circuit booleans were already turned into branches by
//! the normalizer.

use std::collections::HashMap;

use osprey_core::ast::{Def, FunDef, Id, LetDef, Lit, LoopKind, Pat, Program, RegDef, TPat, Typ};
use osprey_core::diagnostics::Span;
use osprey_core::{lower_type, CTyp, Ctx, Dir, Error, Result};

use crate::anf::{normalize, AArm, AExp, AExpKind, ALExp, AVal};
use crate::cir::{
    CDef, CFun, CLExp, CLet, CProgram, CRegister, CTypeDef, CVal, CallTarget, Instr, Name,
    NameGen, Op, VLit,
};
use crate::config::CodegenConfig;
use crate::primops;

/// The pseudo-function the return rewriter recognizes at early-exit
/// positions.
pub const EARLY_RETURN: &str = "early_return";

/// Lowered signatures of every user function, consulted at call sites and by
/// the emitter.
#[derive(Debug, Default, Clone)]
pub struct Signatures {
    pub funs: HashMap<Id, (Vec<CTyp>, CTyp)>,
    pub registers: HashMap<Id, CTyp>,
    pub letbinds: HashMap<Id, CTyp>,
}

pub fn compile_program(
    program: &Program,
    ctx: &Ctx,
    cfg: &CodegenConfig,
    names: &mut NameGen,
) -> Result<(CProgram, Signatures)> {
    let mut sigs = Signatures::default();

    // Signatures first: call sites need them before bodies compile.
    for def in &program.defs {
        match def {
            Def::Fun(fundef) => {
                let (params, ret) = lower_signature(fundef, ctx)?;
                sigs.funs.insert(fundef.id.clone(), (params, ret));
            }
            Def::Register(regdef) => {
                let ctyp = lower_type(&regdef.typ, ctx, regdef.span)?;
                sigs.registers.insert(regdef.id.clone(), ctyp);
            }
            _ => {}
        }
    }

    let mut defs = Vec::new();
    let mut let_index = 0;
    for def in &program.defs {
        match def {
            Def::Type(tdef) => {
                if let Some(ctdef) = lower_type_def(tdef, ctx)? {
                    defs.push(CDef::Type(ctdef));
                }
            }
            Def::Register(regdef) => {
                defs.push(CDef::Register(compile_register(
                    regdef, ctx, cfg, &sigs, names,
                )?));
            }
            Def::Let(letdef) => {
                let clet = compile_letbind(letdef, let_index, ctx, cfg, &mut sigs, names)?;
                let_index += 1;
                defs.push(CDef::Let(clet));
            }
            Def::Fun(fundef) => {
                defs.push(CDef::Fun(compile_fundef(fundef, ctx, cfg, &sigs, names)?));
            }
        }
    }

    Ok((CProgram { defs }, sigs))
}

fn lower_signature(fundef: &FunDef, ctx: &Ctx) -> Result<(Vec<CTyp>, CTyp)> {
    let Typ::Fn(arg_typs, ret_typ) = &fundef.typ else {
        return Err(Error::TypeLowering {
            span: fundef.span,
            detail: format!("definition of `{}` has a non-function type", fundef.id),
        });
    };
    if arg_typs.len() != fundef.params.len() {
        return Err(Error::ArityMismatch {
            span: fundef.span,
            id: fundef.id.clone(),
            expected: arg_typs.len(),
            found: fundef.params.len(),
        });
    }
    let params = arg_typs
        .iter()
        .map(|typ| lower_type(typ, ctx, fundef.span))
        .collect::<Result<Vec<_>>>()?;
    let ret = lower_type(ret_typ, ctx, fundef.span)?;
    Ok((params, ret))
}

fn lower_type_def(tdef: &osprey_core::ast::TypeDef, ctx: &Ctx) -> Result<Option<CTypeDef>> {
    use osprey_core::ast::TypeDef;
    match tdef {
        TypeDef::Enum { id, members } => Ok(Some(CTypeDef::Enum(id.clone(), members.clone()))),
        TypeDef::Record { id, fields } => {
            let mut lowered = Vec::with_capacity(fields.len());
            for (typ, field) in fields {
                lowered.push((field.clone(), lower_type(typ, ctx, Span::unknown())?));
            }
            Ok(Some(CTypeDef::Struct(id.clone(), lowered)))
        }
        TypeDef::Variant { id, ctors } => {
            let mut lowered = Vec::with_capacity(ctors.len());
            for (typ, ctor) in ctors {
                lowered.push((ctor.clone(), lower_type(typ, ctx, Span::unknown())?));
            }
            Ok(Some(CTypeDef::Variant(id.clone(), lowered)))
        }
        // Synonyms are expanded during lowering and generate no definition.
        TypeDef::Synonym { .. } => Ok(None),
    }
}

fn compile_register(
    regdef: &RegDef,
    ctx: &Ctx,
    cfg: &CodegenConfig,
    sigs: &Signatures,
    names: &mut NameGen,
) -> Result<CRegister> {
    let ctyp = lower_type(&regdef.typ, ctx, regdef.span)?;
    let mut init = Vec::new();
    if let Some(exp) = &regdef.init {
        let aexp = analyzed(normalize(exp, &[], ctx, names)?, ctx, cfg);
        let end_label = names.label("end_register_init");
        let mut compiler = FnCompiler::new(ctx, cfg, sigs, names, CTyp::Unit, end_label, None);
        let dest = CLExp::Id(Name::Id(regdef.id.clone(), 0), ctyp.clone());
        compiler.compile_aexp(&aexp, &dest, &mut init)?;
    }
    Ok(CRegister {
        id: regdef.id.clone(),
        ctyp,
        init,
    })
}

fn compile_letbind(
    letdef: &LetDef,
    index: usize,
    ctx: &Ctx,
    cfg: &CodegenConfig,
    sigs: &mut Signatures,
    names: &mut NameGen,
) -> Result<CLet> {
    let aexp = analyzed(normalize(&letdef.body, &[], ctx, names)?, ctx, cfg);
    let mut setup = Vec::new();
    let mut bindings = Vec::new();
    match &letdef.pat.pat {
        Pat::Id(id) => {
            let ctyp = lower_type(&letdef.pat.typ, ctx, letdef.pat.span)?;
            let end_label = names.label("end_letbind");
            let mut compiler = FnCompiler::new(ctx, cfg, sigs, names, CTyp::Unit, end_label, None);
            let dest = CLExp::Id(Name::Id(id.clone(), 0), ctyp.clone());
            compiler.compile_aexp(&aexp, &dest, &mut setup)?;
            bindings.push((id.clone(), ctyp.clone()));
            sigs.letbinds.insert(id.clone(), ctyp);
        }
        Pat::Tuple(items) if items.iter().all(|p| matches!(p.pat, Pat::Id(_))) => {
            let ctyp = lower_type(&letdef.pat.typ, ctx, letdef.pat.span)?;
            let scratch = names.fresh();
            let end_label = names.label("end_letbind");
            setup.push(Instr::Decl(ctyp.clone(), scratch.clone()));
            let mut compiler = FnCompiler::new(ctx, cfg, sigs, names, CTyp::Unit, end_label, None);
            let dest = CLExp::Id(scratch.clone(), ctyp.clone());
            compiler.compile_aexp(&aexp, &dest, &mut setup)?;
            for (i, item) in items.iter().enumerate() {
                let Pat::Id(id) = &item.pat else {
                    continue;
                };
                let item_ctyp = lower_type(&item.typ, ctx, item.span)?;
                setup.push(Instr::Copy(
                    CLExp::Id(Name::Id(id.clone(), 0), item_ctyp.clone()),
                    CVal::TupleMember(
                        Box::new(CVal::Id(scratch.clone(), ctyp.clone())),
                        i,
                        item_ctyp.clone(),
                    ),
                ));
                bindings.push((id.clone(), item_ctyp.clone()));
                sigs.letbinds.insert(id.clone(), item_ctyp);
            }
            if ctyp.is_heap() {
                setup.push(Instr::Clear(ctyp, scratch));
            }
        }
        _ => {
            return Err(Error::Invariant {
                pass: "letbind compilation",
                detail: format!("unsupported top-level binding pattern {:?}", letdef.pat.pat),
            })
        }
    }
    Ok(CLet {
        index,
        bindings,
        setup,
    })
}

fn compile_fundef(
    fundef: &FunDef,
    ctx: &Ctx,
    cfg: &CodegenConfig,
    sigs: &Signatures,
    names: &mut NameGen,
) -> Result<CFun> {
    let (param_ctyps, ret) = sigs
        .funs
        .get(&fundef.id)
        .cloned()
        .ok_or_else(|| Error::Invariant {
            pass: "function compilation",
            detail: format!("no signature for `{}`", fundef.id),
        })?;
    let params: Vec<(Id, CTyp)> = fundef
        .params
        .iter()
        .cloned()
        .zip(param_ctyps)
        .collect();

    let aexp = analyzed(normalize(&fundef.body, &params, ctx, names)?, ctx, cfg);

    let end_label = names.label("end_function");
    let exc_label = if ctx.env.has_exceptions() {
        Some(names.label("end_block_exception"))
    } else {
        None
    };
    let mut compiler = FnCompiler::new(
        ctx,
        cfg,
        sigs,
        names,
        ret.clone(),
        end_label.clone(),
        exc_label.clone(),
    );
    for (id, ctyp) in &params {
        compiler
            .locals
            .insert(id.clone(), (Name::Id(id.clone(), 0), ctyp.clone()));
    }
    let mut body = Vec::new();
    let dest = CLExp::Id(Name::Return, ret.clone());
    compiler.compile_aexp(&aexp, &dest, &mut body)?;

    Ok(CFun {
        id: fundef.id.clone(),
        params,
        ret,
        prologue: Vec::new(),
        body,
        epilogue: Vec::new(),
        end_label,
        exc_label,
    })
}

fn analyzed(aexp: AExp, ctx: &Ctx, cfg: &CodegenConfig) -> AExp {
    if cfg.optimize_primops {
        primops::analyze(aexp, ctx)
    } else {
        aexp
    }
}

// ── Per-function compilation state ───────────────────────────────────────────

struct FnCompiler<'a, 'b> {
    ctx: &'a Ctx<'a>,
    cfg: &'a CodegenConfig,
    sigs: &'a Signatures,
    names: &'b mut NameGen,
    ret: CTyp,
    /// The function-exit label early returns jump to.
    end_label: String,
    /// In-scope locals, by source id, with their resolved target-IR name.
    /// Shadowing rebinds get a renumbered name at once; duplicates across
    /// disjoint sibling scopes are left for the unique-names pass.
    locals: HashMap<Id, (Name, CTyp)>,
    /// Heap locals currently in scope, innermost last; early exits clear all
    /// of them before jumping.
    cleanup: Vec<(CTyp, Name)>,
    /// Innermost exception target: the function's exception exit block or an
    /// enclosing try handler.
    exc_labels: Vec<String>,
}

impl<'a, 'b> FnCompiler<'a, 'b> {
    fn new(
        ctx: &'a Ctx<'a>,
        cfg: &'a CodegenConfig,
        sigs: &'a Signatures,
        names: &'b mut NameGen,
        ret: CTyp,
        end_label: String,
        exc_label: Option<String>,
    ) -> Self {
        FnCompiler {
            ctx,
            cfg,
            sigs,
            names,
            ret,
            end_label,
            locals: HashMap::new(),
            cleanup: Vec::new(),
            exc_labels: exc_label.into_iter().collect(),
        }
    }

    /// Track a value's pending clears on the cleanup stack for the duration
    /// of nested compilation, so early exits inside release them too.
    fn push_cleanup(&mut self, cleanup: &[Instr]) -> usize {
        let depth = self.cleanup.len();
        for instr in cleanup {
            if let Instr::Clear(ctyp, name) = instr {
                self.cleanup.push((ctyp.clone(), name.clone()));
            }
        }
        depth
    }

    fn lower(&self, typ: &Typ, span: Span) -> Result<CTyp> {
        lower_type(typ, self.ctx, span)
    }

    /// Bring a source binding into scope. A binding that shadows one still in
    /// scope gets a renumbered name immediately so the two stay distinct.
    fn bind_local(&mut self, id: &Id, ctyp: CTyp) -> Name {
        let base = Name::Id(id.clone(), 0);
        let name = if self.locals.contains_key(id) {
            self.names.renumber(&base)
        } else {
            base
        };
        self.locals.insert(id.clone(), (name.clone(), ctyp));
        name
    }

    /// The resolved target-IR name for a source identifier: an in-scope
    /// local, or a global (register or letbind) under its own id.
    fn resolve(&self, id: &Id) -> Name {
        match self.locals.get(id) {
            Some((name, _)) => name.clone(),
            None => Name::Id(id.clone(), 0),
        }
    }

    /// Inline fragments were built before name resolution; re-point their
    /// identifier leaves at the in-scope names.
    fn resolve_cval(&self, cval: &mut CVal) {
        match cval {
            CVal::Id(name, _) => {
                if let Name::Id(id, 0) = name {
                    let resolved = self.resolve(&id.clone());
                    *name = resolved;
                }
            }
            CVal::TupleMember(inner, _, _)
            | CVal::Field(inner, _, _)
            | CVal::CtorKind(inner, _, _)
            | CVal::CtorUnwrap(inner, _, _) => self.resolve_cval(inner),
            CVal::Call(_, args, _) => {
                for arg in args {
                    self.resolve_cval(arg);
                }
            }
            CVal::Lit(_, _) | CVal::Raw(_, _) => {}
        }
    }

    fn exception_ctyp(&self) -> Result<CTyp> {
        let id = Id::new("exception");
        self.lower(&Typ::Id(id), Span::unknown())
    }

    /// Clears for every heap local currently in scope, innermost first.
    fn pending_clears(&self) -> Vec<Instr> {
        self.cleanup
            .iter()
            .rev()
            .map(|(ctyp, name)| Instr::Clear(ctyp.clone(), name.clone()))
            .collect()
    }

    fn compile_aexp(&mut self, aexp: &AExp, dest: &CLExp, out: &mut Vec<Instr>) -> Result<()> {
        let span = aexp.span;
        match &aexp.kind {
            AExpKind::Val(aval) => {
                let (setup, cval, cleanup) = self.compile_aval(aval, span)?;
                out.extend(setup);
                out.push(Instr::Copy(dest.clone(), cval));
                out.extend(cleanup);
            }
            AExpKind::App(id, args) => self.compile_app(id, args, dest, span, out)?,
            AExpKind::Let(id, typ, bound, body) => {
                let ctyp = self.lower(typ, span)?;
                let saved = self.locals.get(id).cloned();
                let name = self.bind_local(id, ctyp.clone());
                out.push(Instr::Decl(ctyp.clone(), name.clone()));
                let bound_dest = CLExp::Id(name.clone(), ctyp.clone());
                self.compile_aexp(bound, &bound_dest, out)?;
                if ctyp.is_heap() {
                    self.cleanup.push((ctyp.clone(), name.clone()));
                }
                self.compile_aexp(body, dest, out)?;
                if ctyp.is_heap() {
                    self.cleanup.pop();
                    out.push(Instr::Clear(ctyp, name));
                }
                match saved {
                    Some(prev) => {
                        self.locals.insert(id.clone(), prev);
                    }
                    None => {
                        self.locals.remove(id);
                    }
                }
            }
            AExpKind::Block(stmts, last) => {
                for stmt in stmts {
                    self.compile_stmt(stmt, out)?;
                }
                self.compile_aexp(last, dest, out)?;
            }
            AExpKind::If(cond, then_exp, else_exp) => {
                let (setup, cond_cv, cleanup) = self.compile_aval(cond, span)?;
                out.extend(setup);
                let depth = self.push_cleanup(&cleanup);
                let mut then_instrs = Vec::new();
                self.compile_aexp(then_exp, dest, &mut then_instrs)?;
                let mut else_instrs = Vec::new();
                self.compile_aexp(else_exp, dest, &mut else_instrs)?;
                self.cleanup.truncate(depth);
                let ctyp = self.lower(&aexp.typ, span)?;
                out.push(Instr::If(cond_cv, then_instrs, else_instrs, ctyp));
                out.extend(cleanup);
            }
            AExpKind::Case(scrutinee, arms) => {
                self.compile_case(scrutinee, arms, dest, span, out)?;
            }
            AExpKind::Try(body, arms) => self.compile_try(body, arms, dest, span, out)?,
            AExpKind::Assign(alexp, value) => {
                let target = self.compile_alexp(alexp, span)?;
                self.compile_aexp(value, &target, out)?;
                out.push(Instr::Copy(dest.clone(), CVal::unit()));
            }
            AExpKind::Return(aval) => {
                let (setup, cval, cleanup) = self.compile_aval(aval, span)?;
                out.extend(setup);
                // The marker call becomes the slot assignment during return
                // rewriting; the clears run between it and the jump.
                out.push(Instr::Funcall(
                    CLExp::Id(Name::Return, self.ret.clone()),
                    CallTarget::Extern(EARLY_RETURN.to_string()),
                    vec![cval],
                ));
                out.extend(cleanup);
                out.extend(self.pending_clears());
                out.push(Instr::Goto(self.end_label.clone()));
            }
            AExpKind::Throw(aval) => {
                let exc_ctyp = self.exception_ctyp()?;
                let (setup, cval, cleanup) = self.compile_aval(aval, span)?;
                out.extend(setup);
                out.push(Instr::Copy(
                    CLExp::Id(Name::CurrentException, exc_ctyp),
                    cval,
                ));
                out.push(Instr::Copy(
                    CLExp::Id(Name::HaveException, CTyp::Bool),
                    CVal::bool(true),
                ));
                out.extend(cleanup);
                out.extend(self.pending_clears());
                let target = self.exc_labels.last().cloned().ok_or(Error::Invariant {
                    pass: "throw compilation",
                    detail: "throw outside any exception context".to_string(),
                })?;
                out.push(Instr::Goto(target));
            }
            AExpKind::Field(aval, field) => {
                let (setup, cval, cleanup) = self.compile_aval(aval, span)?;
                out.extend(setup);
                let ctyp = self.field_ctyp(&cval.ctyp(), field)?;
                out.push(Instr::Copy(
                    dest.clone(),
                    CVal::Field(Box::new(cval), field.clone(), ctyp),
                ));
                out.extend(cleanup);
            }
            AExpKind::Struct(_, fields) => {
                for (field, aval) in fields {
                    let (setup, cval, cleanup) = self.compile_aval(aval, span)?;
                    out.extend(setup);
                    let fctyp = self.field_ctyp(&dest.ctyp(), field)?;
                    out.push(Instr::Copy(
                        CLExp::Field(Box::new(dest.clone()), field.clone(), fctyp),
                        cval,
                    ));
                    out.extend(cleanup);
                }
            }
            AExpKind::List(items) => {
                let ctyp = self.lower(&aexp.typ, span)?;
                let scratch = self.names.fresh();
                out.push(Instr::Decl(ctyp.clone(), scratch.clone()));
                let list_dest = CLExp::Id(scratch.clone(), ctyp.clone());
                out.push(Instr::Funcall(
                    list_dest.clone(),
                    CallTarget::Extern("list_empty".to_string()),
                    vec![],
                ));
                for item in items.iter().rev() {
                    let (setup, cval, cleanup) = self.compile_aval(item, span)?;
                    out.extend(setup);
                    out.push(Instr::Funcall(
                        list_dest.clone(),
                        CallTarget::Extern("list_cons".to_string()),
                        vec![cval, CVal::Id(scratch.clone(), ctyp.clone())],
                    ));
                    out.extend(cleanup);
                }
                out.push(Instr::Copy(
                    dest.clone(),
                    CVal::Id(scratch.clone(), ctyp.clone()),
                ));
                out.push(Instr::Clear(ctyp, scratch));
            }
            AExpKind::For(index, from, to, step, dir, body) => {
                self.compile_for(index, from, to, step, *dir, body, span, out)?;
                out.push(Instr::Copy(dest.clone(), CVal::unit()));
            }
            AExpKind::Loop(kind, cond, body) => {
                self.compile_loop(*kind, cond, body, span, out)?;
                out.push(Instr::Copy(dest.clone(), CVal::unit()));
            }
        }
        Ok(())
    }

    /// Compile a statement-position expression into a scratch destination.
    fn compile_stmt(&mut self, stmt: &AExp, out: &mut Vec<Instr>) -> Result<()> {
        let ctyp = self.lower(&stmt.typ, stmt.span)?;
        let scratch = self.names.fresh();
        out.push(Instr::Decl(ctyp.clone(), scratch.clone()));
        let dest = CLExp::Id(scratch.clone(), ctyp.clone());
        if ctyp.is_heap() {
            self.cleanup.push((ctyp.clone(), scratch.clone()));
        }
        self.compile_aexp(stmt, &dest, out)?;
        if ctyp.is_heap() {
            self.cleanup.pop();
            out.push(Instr::Clear(ctyp, scratch));
        }
        Ok(())
    }

    fn compile_app(
        &mut self,
        id: &Id,
        args: &[AVal],
        dest: &CLExp,
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let mut setup = Vec::new();
        let mut cleanup = Vec::new();
        let mut cvals = Vec::with_capacity(args.len());
        for arg in args {
            let (arg_setup, cval, arg_cleanup) = self.compile_aval(arg, span)?;
            setup.extend(arg_setup);
            cvals.push(cval);
            cleanup.extend(arg_cleanup);
        }
        out.extend(setup);

        if let Some((variant, _)) = self.ctx.env.ctor(id) {
            let arg = match cvals.len() {
                1 => cvals.pop().ok_or(Error::Invariant {
                    pass: "constructor compilation",
                    detail: "constructor argument vanished".to_string(),
                })?,
                // Multi-argument constructors carry their payload as a tuple.
                _ => {
                    let ctyp = CTyp::Tup(cvals.iter().map(CVal::ctyp).collect());
                    let scratch = self.names.fresh();
                    out.push(Instr::Decl(ctyp.clone(), scratch.clone()));
                    for (i, cval) in cvals.drain(..).enumerate() {
                        let mctyp = cval.ctyp();
                        out.push(Instr::Copy(
                            CLExp::Tuple(
                                Box::new(CLExp::Id(scratch.clone(), ctyp.clone())),
                                i,
                                mctyp,
                            ),
                            cval,
                        ));
                    }
                    cleanup.push(Instr::Clear(ctyp.clone(), scratch.clone()));
                    CVal::Id(scratch, ctyp)
                }
            };
            out.push(Instr::Funcall(
                dest.clone(),
                CallTarget::Ctor(variant.clone(), id.clone()),
                vec![arg],
            ));
            out.extend(cleanup);
            return Ok(());
        }

        if self.sigs.funs.contains_key(id) {
            out.push(Instr::Funcall(dest.clone(), CallTarget::Fn(id.clone()), cvals));
            // Calls into user code may raise; propagate before touching the
            // result, releasing argument temporaries and scope locals on the
            // way out.
            if let Some(target) = self.exc_labels.last().cloned() {
                let mut on_raise = cleanup.clone();
                on_raise.extend(self.pending_clears());
                on_raise.push(Instr::Goto(target));
                out.push(Instr::If(
                    CVal::Id(Name::HaveException, CTyp::Bool),
                    on_raise,
                    Vec::new(),
                    CTyp::Unit,
                ));
            }
            out.extend(cleanup);
            return Ok(());
        }

        let extern_name = self
            .ctx
            .env
            .extern_binding(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.as_str().to_string());
        out.push(Instr::Funcall(
            dest.clone(),
            CallTarget::Extern(extern_name),
            cvals,
        ));
        out.extend(cleanup);
        Ok(())
    }

    fn compile_aval(&mut self, aval: &AVal, span: Span) -> Result<(Vec<Instr>, CVal, Vec<Instr>)> {
        match aval {
            AVal::CVal(cval, _) => {
                let mut cval = cval.clone();
                self.resolve_cval(&mut cval);
                Ok((Vec::new(), cval, Vec::new()))
            }
            AVal::Id(id, _, ctyp) => Ok((
                Vec::new(),
                CVal::Id(self.resolve(id), ctyp.clone()),
                Vec::new(),
            )),
            AVal::Ref(id, _, ctyp) => Ok((
                Vec::new(),
                CVal::Call(
                    Op::AddrOf,
                    vec![CVal::Id(
                        Name::Id(id.clone(), 0),
                        match ctyp {
                            CTyp::Ref(inner) => (**inner).clone(),
                            other => other.clone(),
                        },
                    )],
                    ctyp.clone(),
                ),
                Vec::new(),
            )),
            AVal::Lit(lit, _, ctyp) => self.compile_literal(lit, ctyp, span),
            AVal::Tuple(items) => {
                let ctyp = aval.ctyp();
                let scratch = self.names.fresh();
                let mut setup = vec![Instr::Decl(ctyp.clone(), scratch.clone())];
                let mut cleanup = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    let (item_setup, cval, item_cleanup) = self.compile_aval(item, span)?;
                    setup.extend(item_setup);
                    let mctyp = cval.ctyp();
                    setup.push(Instr::Copy(
                        CLExp::Tuple(Box::new(CLExp::Id(scratch.clone(), ctyp.clone())), i, mctyp),
                        cval,
                    ));
                    setup.extend(item_cleanup);
                }
                if ctyp.is_heap() {
                    cleanup.push(Instr::Clear(ctyp.clone(), scratch.clone()));
                }
                Ok((setup, CVal::Id(scratch, ctyp), cleanup))
            }
        }
    }

    fn compile_literal(
        &mut self,
        lit: &Lit,
        ctyp: &CTyp,
        _span: Span,
    ) -> Result<(Vec<Instr>, CVal, Vec<Instr>)> {
        let vlit = match (lit, ctyp) {
            (Lit::Unit, _) => VLit::Unit,
            (Lit::Bool(b), _) => VLit::Bool(*b),
            (Lit::Bit(b), _) => VLit::Bit(*b),
            (Lit::Num(n), CTyp::FInt(_)) => match i64::try_from(n) {
                Ok(n) => VLit::Int(n),
                Err(_) => VLit::String(n.to_string()),
            },
            (Lit::Num(n), _) => match i64::try_from(n) {
                Ok(n) => VLit::Int(n),
                Err(_) => VLit::String(n.to_string()),
            },
            (Lit::Bits(bits), _) => VLit::Bits(bits.clone()),
            (Lit::String(s), _) => VLit::String(s.clone()),
            (Lit::Real(r), _) => VLit::Real(r.clone()),
            (Lit::Undefined, _) => {
                // Canonical zero for stack representations; heap values get a
                // runtime undefined helper at emission.
                VLit::Int(0)
            }
        };
        if ctyp.is_stack() {
            return Ok((Vec::new(), CVal::Lit(vlit, ctyp.clone()), Vec::new()));
        }
        let scratch = self.names.fresh();
        // Init both declares and allocates; no separate declare.
        let setup = vec![Instr::Init(
            ctyp.clone(),
            scratch.clone(),
            CVal::Lit(vlit, ctyp.clone()),
        )];
        let cleanup = vec![Instr::Clear(ctyp.clone(), scratch.clone())];
        Ok((setup, CVal::Id(scratch, ctyp.clone()), cleanup))
    }

    fn compile_alexp(&mut self, alexp: &ALExp, span: Span) -> Result<CLExp> {
        match alexp {
            ALExp::Id(id, typ) => {
                if let Some((name, ctyp)) = self.locals.get(id) {
                    return Ok(CLExp::Id(name.clone(), ctyp.clone()));
                }
                let ctyp = match self.sigs.registers.get(id) {
                    Some(ctyp) => ctyp.clone(),
                    None => self.lower(typ, span)?,
                };
                Ok(CLExp::Id(Name::Id(id.clone(), 0), ctyp))
            }
            ALExp::Field(base, field, _) => {
                let base = self.compile_alexp(base, span)?;
                let ctyp = self.field_ctyp(&base.ctyp(), field)?;
                Ok(CLExp::Field(Box::new(base), field.clone(), ctyp))
            }
        }
    }

    fn field_ctyp(&self, struct_ctyp: &CTyp, field: &Id) -> Result<CTyp> {
        if let CTyp::Struct(id, fields) = struct_ctyp {
            if let Some((_, ctyp)) = fields.iter().find(|(f, _)| f == field) {
                return Ok(ctyp.clone());
            }
            // Shallow nominal occurrence: consult the definition.
            if let Some(decl_fields) = self.ctx.env.record(id) {
                if let Some((typ, _)) = decl_fields.iter().find(|(_, f)| f == field) {
                    return self.lower(typ, Span::unknown());
                }
            }
        }
        Err(Error::Invariant {
            pass: "field access compilation",
            detail: format!("no field `{field}` on {struct_ctyp:?}"),
        })
    }

    fn ctor_payload_ctyp(&self, pats: &[TPat]) -> Result<CTyp> {
        match pats {
            [single] => self.lower(&single.typ, single.span),
            many => {
                let mut items = Vec::with_capacity(many.len());
                for pat in many {
                    items.push(self.lower(&pat.typ, pat.span)?);
                }
                Ok(CTyp::Tup(items))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_for(
        &mut self,
        index: &Id,
        from: &AVal,
        to: &AVal,
        step: &AVal,
        dir: Dir,
        body: &AExp,
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let (from_setup, from_cv, from_cleanup) = self.compile_aval(from, span)?;
        let (to_setup, to_cv, to_cleanup) = self.compile_aval(to, span)?;
        let (step_setup, step_cv, step_cleanup) = self.compile_aval(step, span)?;
        out.extend(from_setup);
        out.extend(to_setup);
        out.extend(step_setup);
        let saved = self.locals.get(index).cloned();
        let idx = self.bind_local(index, CTyp::FInt(64));
        out.push(Instr::Decl(CTyp::FInt(64), idx.clone()));
        out.push(Instr::Copy(
            CLExp::Id(idx.clone(), CTyp::FInt(64)),
            from_cv,
        ));
        let start = self.names.label("for_start");
        let end = self.names.label("for_end");
        out.push(Instr::Label(start.clone()));
        let exit_op = match dir {
            Dir::Inc => Op::Igt,
            Dir::Dec => Op::Ilt,
        };
        out.push(Instr::Jump(
            CVal::Call(
                exit_op,
                vec![CVal::Id(idx.clone(), CTyp::FInt(64)), to_cv],
                CTyp::Bool,
            ),
            end.clone(),
        ));
        let depth = self.push_cleanup(&from_cleanup);
        self.push_cleanup(&to_cleanup);
        self.push_cleanup(&step_cleanup);
        self.compile_stmt(body, out)?;
        self.cleanup.truncate(depth);
        match saved {
            Some(prev) => {
                self.locals.insert(index.clone(), prev);
            }
            None => {
                self.locals.remove(index);
            }
        }
        let step_op = match dir {
            Dir::Inc => Op::Iadd,
            Dir::Dec => Op::Isub,
        };
        out.push(Instr::Copy(
            CLExp::Id(idx.clone(), CTyp::FInt(64)),
            CVal::Call(
                step_op,
                vec![CVal::Id(idx, CTyp::FInt(64)), step_cv],
                CTyp::FInt(64),
            ),
        ));
        out.push(Instr::Goto(start));
        out.push(Instr::Label(end));
        out.extend(from_cleanup);
        out.extend(to_cleanup);
        out.extend(step_cleanup);
        Ok(())
    }

    fn compile_loop(
        &mut self,
        kind: LoopKind,
        cond: &AExp,
        body: &AExp,
        _span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let start = self.names.label("loop_start");
        let end = self.names.label("loop_end");
        let cond_name = self.names.fresh();
        out.push(Instr::Decl(CTyp::Bool, cond_name.clone()));
        let cond_dest = CLExp::Id(cond_name.clone(), CTyp::Bool);
        out.push(Instr::Label(start.clone()));
        match kind {
            LoopKind::While => {
                self.compile_aexp(cond, &cond_dest, out)?;
                out.push(Instr::Jump(
                    CVal::Call(
                        Op::Not,
                        vec![CVal::Id(cond_name, CTyp::Bool)],
                        CTyp::Bool,
                    ),
                    end.clone(),
                ));
                self.compile_stmt(body, out)?;
            }
            LoopKind::Until => {
                self.compile_stmt(body, out)?;
                self.compile_aexp(cond, &cond_dest, out)?;
                out.push(Instr::Jump(CVal::Id(cond_name, CTyp::Bool), end.clone()));
            }
        }
        out.push(Instr::Goto(start));
        out.push(Instr::Label(end));
        Ok(())
    }

    fn compile_case(
        &mut self,
        scrutinee: &AVal,
        arms: &[AArm],
        dest: &CLExp,
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let (setup, scrutinee_cv, cleanup) = self.compile_aval(scrutinee, span)?;
        out.extend(setup);
        let depth = self.push_cleanup(&cleanup);
        let case_end = self.names.label("case_end");
        for arm in arms {
            self.compile_arm(arm, &scrutinee_cv, dest, &case_end, out)?;
        }
        out.push(Instr::MatchFailure);
        out.push(Instr::Label(case_end));
        self.cleanup.truncate(depth);
        out.extend(cleanup);
        Ok(())
    }

    fn compile_arm(
        &mut self,
        arm: &AArm,
        scrutinee: &CVal,
        dest: &CLExp,
        case_end: &str,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let fail = self.names.label("case_next");
        // Tests first (pure projections), bindings only once the arm is
        // known to apply.
        self.compile_pattern_tests(&arm.pat, scrutinee, &fail, out)?;
        let mut bound = Vec::new();
        let saved_locals = self.locals.clone();
        self.compile_pattern_binds(&arm.pat, scrutinee, &mut bound, out)?;
        let cleanup_depth = self.cleanup.len();
        for (ctyp, name) in &bound {
            if ctyp.is_heap() {
                self.cleanup.push((ctyp.clone(), name.clone()));
            }
        }
        if let Some(guard) = &arm.guard {
            let guard_name = self.names.fresh();
            out.push(Instr::Decl(CTyp::Bool, guard_name.clone()));
            let guard_dest = CLExp::Id(guard_name.clone(), CTyp::Bool);
            self.compile_aexp(guard, &guard_dest, out)?;
            // A failing guard must release the arm's bindings before moving
            // on.
            let mut on_fail: Vec<Instr> = bound
                .iter()
                .filter(|(ctyp, _)| ctyp.is_heap())
                .map(|(ctyp, name)| Instr::Clear(ctyp.clone(), name.clone()))
                .collect();
            on_fail.push(Instr::Goto(fail.clone()));
            out.push(Instr::If(
                CVal::Call(
                    Op::Not,
                    vec![CVal::Id(guard_name, CTyp::Bool)],
                    CTyp::Bool,
                ),
                on_fail,
                Vec::new(),
                CTyp::Unit,
            ));
        }
        self.compile_aexp(&arm.body, dest, out)?;
        self.cleanup.truncate(cleanup_depth);
        for (ctyp, name) in bound.iter().rev() {
            if ctyp.is_heap() {
                out.push(Instr::Clear(ctyp.clone(), name.clone()));
            }
        }
        self.locals = saved_locals;
        out.push(Instr::Goto(case_end.to_string()));
        out.push(Instr::Label(fail));
        Ok(())
    }

    fn compile_pattern_tests(
        &mut self,
        pat: &TPat,
        value: &CVal,
        fail: &str,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        match &pat.pat {
            Pat::Wild | Pat::Id(_) => Ok(()),
            Pat::Lit(lit) => {
                let ctyp = self.lower(&pat.typ, pat.span)?;
                let test = match (&lit, &ctyp) {
                    (Lit::String(_), _) => {
                        let (_, lit_cv, _) = self.compile_literal(lit, &CTyp::String, pat.span)?;
                        CVal::Call(
                            Op::Helper("eq_string".to_string()),
                            vec![value.clone(), lit_cv],
                            CTyp::Bool,
                        )
                    }
                    _ => {
                        let (_, lit_cv, _) = self.compile_literal(lit, &ctyp, pat.span)?;
                        CVal::Call(Op::Eq, vec![value.clone(), lit_cv], CTyp::Bool)
                    }
                };
                out.push(Instr::Jump(
                    CVal::Call(Op::Not, vec![test], CTyp::Bool),
                    fail.to_string(),
                ));
                Ok(())
            }
            Pat::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    let ctyp = self.lower(&item.typ, item.span)?;
                    let member =
                        CVal::TupleMember(Box::new(value.clone()), i, ctyp);
                    self.compile_pattern_tests(item, &member, fail, out)?;
                }
                Ok(())
            }
            Pat::Ctor(ctor, args) => {
                // The tag test carries the same payload representation as the
                // unwrap beside it; specialization resolves both to the same
                // monomorphic instance.
                let payload_ctyp = self.ctor_payload_ctyp(args)?;
                out.push(Instr::Jump(
                    CVal::Call(
                        Op::Not,
                        vec![CVal::CtorKind(
                            Box::new(value.clone()),
                            ctor.clone(),
                            payload_ctyp.clone(),
                        )],
                        CTyp::Bool,
                    ),
                    fail.to_string(),
                ));
                let unwrapped =
                    CVal::CtorUnwrap(Box::new(value.clone()), ctor.clone(), payload_ctyp.clone());
                match &args[..] {
                    [single] => self.compile_pattern_tests(single, &unwrapped, fail, out),
                    many => {
                        for (i, item) in many.iter().enumerate() {
                            let ctyp = self.lower(&item.typ, item.span)?;
                            let member = CVal::TupleMember(Box::new(unwrapped.clone()), i, ctyp);
                            self.compile_pattern_tests(item, &member, fail, out)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn compile_pattern_binds(
        &mut self,
        pat: &TPat,
        value: &CVal,
        bound: &mut Vec<(CTyp, Name)>,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        match &pat.pat {
            Pat::Wild | Pat::Lit(_) => Ok(()),
            Pat::Id(id) => {
                let ctyp = self.lower(&pat.typ, pat.span)?;
                let name = self.bind_local(id, ctyp.clone());
                out.push(Instr::Decl(ctyp.clone(), name.clone()));
                out.push(Instr::Copy(
                    CLExp::Id(name.clone(), ctyp.clone()),
                    value.clone(),
                ));
                bound.push((ctyp, name));
                Ok(())
            }
            Pat::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    let ctyp = self.lower(&item.typ, item.span)?;
                    let member = CVal::TupleMember(Box::new(value.clone()), i, ctyp);
                    self.compile_pattern_binds(item, &member, bound, out)?;
                }
                Ok(())
            }
            Pat::Ctor(ctor, args) => {
                let payload_ctyp = self.ctor_payload_ctyp(args)?;
                let unwrapped =
                    CVal::CtorUnwrap(Box::new(value.clone()), ctor.clone(), payload_ctyp.clone());
                match &args[..] {
                    [single] => self.compile_pattern_binds(single, &unwrapped, bound, out),
                    many => {
                        for (i, item) in many.iter().enumerate() {
                            let ctyp = self.lower(&item.typ, item.span)?;
                            let member = CVal::TupleMember(Box::new(unwrapped.clone()), i, ctyp);
                            self.compile_pattern_binds(item, &member, bound, out)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn compile_try(
        &mut self,
        body: &AExp,
        arms: &[AArm],
        dest: &CLExp,
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let exc_ctyp = self.exception_ctyp()?;
        let handler = self.names.label("try_handler");
        let try_end = self.names.label("try_end");

        self.exc_labels.push(handler.clone());
        let mut body_instrs = Vec::new();
        self.compile_aexp(body, dest, &mut body_instrs)?;
        self.exc_labels.pop();
        body_instrs.push(Instr::Goto(try_end.clone()));
        out.push(Instr::TryBlock(body_instrs));

        out.push(Instr::Label(handler));
        out.push(Instr::Copy(
            CLExp::Id(Name::HaveException, CTyp::Bool),
            CVal::bool(false),
        ));
        let exc_value = CVal::Id(Name::CurrentException, exc_ctyp);
        for arm in arms {
            self.compile_arm(arm, &exc_value, dest, &try_end, out)?;
        }
        // No handler matched: the exception keeps propagating outward.
        out.push(Instr::Copy(
            CLExp::Id(Name::HaveException, CTyp::Bool),
            CVal::bool(true),
        ));
        let target = self.exc_labels.last().cloned().ok_or(Error::Invariant {
            pass: "try compilation",
            detail: "try block outside any exception context".to_string(),
        })?;
        out.extend(self.pending_clears());
        out.push(Instr::Goto(target));
        out.push(Instr::Label(try_end));
        let _ = span;
        Ok(())
    }
}
