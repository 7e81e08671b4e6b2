//! The emitter: translate the finished target IR into one C translation
//! unit. Output order: includes, type definitions (auxiliary and user, with
//! their helper functions), exception state, registers, letbind globals,
//! function prototypes, function bodies, letbind initializer/finalizer
//! pairs, and the `model_init`/`model_fini`/`model_main`/`main` scaffold.

mod ctypes;
mod exprs;
mod startup;

use std::collections::HashSet;

use osprey_core::{CTyp, Id};

use crate::cir::{CDef, CFun, CLet, CProgram, CRegister, CTypeDef, Instr};
use crate::compile::Signatures;
use crate::config::CodegenConfig;
use crate::zencode::zencode;

pub use ctypes::{c_type, pick_convention_is_stack};

pub(crate) struct FnCtx {
    name: String,
    ret: CTyp,
    heap_return: bool,
    epilogue: Vec<Instr>,
}

pub struct Emitter<'a> {
    out: String,
    cfg: &'a CodegenConfig,
    sigs: &'a Signatures,
    has_exceptions: bool,
    defined_user: HashSet<Id>,
    generated_aux: HashSet<String>,
    forward_declared: HashSet<String>,
    deferred_aux: Vec<CTyp>,
    helper_protos: Vec<String>,
    helper_bodies: Vec<String>,
    current_fn: Option<FnCtx>,
    temp_counter: u32,
}

pub fn emit_program(
    program: &CProgram,
    sigs: &Signatures,
    cfg: &CodegenConfig,
    has_exceptions: bool,
) -> String {
    let mut emitter = Emitter {
        out: String::new(),
        cfg,
        sigs,
        has_exceptions,
        defined_user: HashSet::new(),
        generated_aux: HashSet::new(),
        forward_declared: HashSet::new(),
        deferred_aux: Vec::new(),
        helper_protos: Vec::new(),
        helper_bodies: Vec::new(),
        current_fn: None,
        temp_counter: 0,
    };
    emitter.run(program);
    emitter.out
}

impl Emitter<'_> {
    fn run(&mut self, program: &CProgram) {
        self.emit_preamble();

        let type_defs: Vec<CTypeDef> = program
            .defs
            .iter()
            .filter_map(|def| match def {
                CDef::Type(tdef) => Some(tdef.clone()),
                _ => None,
            })
            .collect();
        self.emit_type_defs(&type_defs);
        self.ensure_program_aux(program);
        self.flush_helpers();

        if self.has_exceptions {
            self.out.push_str("// exception state\n");
            self.out
                .push_str("struct zexception *current_exception = NULL;\n");
            self.out.push_str("bool have_exception = false;\n\n");
        }

        let registers: Vec<&CRegister> = program
            .defs
            .iter()
            .filter_map(|def| match def {
                CDef::Register(reg) => Some(reg),
                _ => None,
            })
            .collect();
        let lets: Vec<&CLet> = program
            .defs
            .iter()
            .filter_map(|def| match def {
                CDef::Let(clet) => Some(clet),
                _ => None,
            })
            .collect();

        self.emit_registers(&registers);
        self.emit_letbind_globals(&lets);

        for cfun in program.functions() {
            let proto = self.signature(cfun);
            self.out.push_str(&proto);
            self.out.push_str(";\n");
        }
        self.out.push('\n');
        for cfun in program.functions() {
            self.emit_function(cfun);
        }

        self.emit_letbind_functions(&lets);
        self.emit_startup(&registers, &lets, program);
    }

    fn emit_preamble(&mut self) {
        self.out.push_str("#include <stdint.h>\n");
        self.out.push_str("#include <stdbool.h>\n");
        self.out.push_str("#include <stdlib.h>\n\n");
        self.out.push_str("#include \"osprey.h\"\n");
        if !self.cfg.no_rts {
            self.out.push_str("#include \"rts.h\"\n");
        }
        self.out.push('\n');
    }

    /// Auxiliary types reachable from signatures and instruction-level
    /// declarations, beyond those the user type definitions already pulled
    /// in.
    fn ensure_program_aux(&mut self, program: &CProgram) {
        let mut ctyps: Vec<CTyp> = Vec::new();
        for def in &program.defs {
            match def {
                CDef::Fun(cfun) => {
                    for (_, ctyp) in &cfun.params {
                        ctyps.push(ctyp.clone());
                    }
                    ctyps.push(cfun.ret.clone());
                    collect_instr_ctyps(&cfun.prologue, &mut ctyps);
                    collect_instr_ctyps(&cfun.body, &mut ctyps);
                    collect_instr_ctyps(&cfun.epilogue, &mut ctyps);
                }
                CDef::Register(reg) => {
                    ctyps.push(reg.ctyp.clone());
                    collect_instr_ctyps(&reg.init, &mut ctyps);
                }
                CDef::Let(clet) => {
                    for (_, ctyp) in &clet.bindings {
                        ctyps.push(ctyp.clone());
                    }
                    collect_instr_ctyps(&clet.setup, &mut ctyps);
                }
                CDef::Type(_) => {}
            }
        }
        for ctyp in ctyps {
            self.ensure_aux(&ctyp);
        }
        self.flush_deferred_aux();
    }

    fn flush_helpers(&mut self) {
        if !self.helper_protos.is_empty() {
            for proto in std::mem::take(&mut self.helper_protos) {
                self.out.push_str(&proto);
                self.out.push_str(";\n");
            }
            self.out.push('\n');
        }
        for body in std::mem::take(&mut self.helper_bodies) {
            self.out.push_str(&body);
            self.out.push_str("\n\n");
        }
    }

    fn signature(&self, cfun: &CFun) -> String {
        let linkage = if self.cfg.static_linkage { "static " } else { "" };
        let fname = format!("{}{}", self.cfg.prefix, zencode(cfun.id.as_str()));
        let mut params: Vec<String> = cfun
            .params
            .iter()
            .map(|(id, ctyp)| format!("{} {}", c_type(ctyp), zencode(id.as_str())))
            .collect();
        // Mangled names all start with `z`, so the placeholder cannot
        // collide.
        if params.is_empty() {
            params.push("unit u".to_string());
        }
        if let Some(extra) = &self.cfg.extra_params {
            params.push(extra.clone());
        }
        let params = params.join(", ");
        if cfun.heap_return() {
            format!(
                "{linkage}void {fname}({} *rop, {params})",
                c_type(&cfun.ret)
            )
        } else {
            format!("{linkage}{} {fname}({params})", c_type(&cfun.ret))
        }
    }

    fn emit_function(&mut self, cfun: &CFun) {
        self.current_fn = Some(FnCtx {
            name: cfun.id.to_string(),
            ret: cfun.ret.clone(),
            heap_return: cfun.heap_return(),
            epilogue: cfun.epilogue.clone(),
        });
        let signature = self.signature(cfun);
        self.out.push_str(&signature);
        self.out.push_str("\n{\n");
        let prologue = cfun.prologue.clone();
        let body = cfun.body.clone();
        self.emit_instrs(&prologue, 1);
        self.emit_instrs(&body, 1);
        self.out.push_str("}\n\n");
        self.current_fn = None;
    }
}

fn collect_instr_ctyps(instrs: &[Instr], out: &mut Vec<CTyp>) {
    for instr in instrs {
        match instr {
            Instr::Decl(ctyp, _)
            | Instr::Init(ctyp, _, _)
            | Instr::Clear(ctyp, _)
            | Instr::Reset(ctyp, _)
            | Instr::Reinit(ctyp, _, _)
            | Instr::Alias(ctyp, _, _) => out.push(ctyp.clone()),
            _ => {}
        }
        for sub in instr.sub_instrs() {
            collect_instr_ctyps(sub, out);
        }
    }
}
