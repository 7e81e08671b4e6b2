//! Registers, letbind initializer/finalizer pairs, and the model
//! entry/teardown scaffold.

use osprey_core::Id;

use crate::cir::{CDef, CLet, CProgram, CRegister};
use crate::zencode::zencode;

use super::ctypes::c_type;
use super::Emitter;

impl Emitter<'_> {
    pub(super) fn emit_registers(&mut self, registers: &[&CRegister]) {
        if registers.is_empty() {
            return;
        }
        self.out.push_str("// registers\n");
        for reg in registers {
            self.out.push_str(&format!(
                "{} {};\n",
                c_type(&reg.ctyp),
                zencode(reg.id.as_str())
            ));
        }
        self.out.push('\n');
    }

    pub(super) fn emit_letbind_globals(&mut self, lets: &[&CLet]) {
        if lets.is_empty() {
            return;
        }
        let linkage = if self.cfg.static_linkage { "static " } else { "" };
        self.out.push_str("// letbind globals\n");
        for clet in lets {
            for (id, ctyp) in &clet.bindings {
                self.out.push_str(&format!(
                    "{linkage}{} {};\n",
                    c_type(ctyp),
                    zencode(id.as_str())
                ));
            }
        }
        self.out.push('\n');
    }

    pub(super) fn emit_letbind_functions(&mut self, lets: &[&CLet]) {
        let linkage = if self.cfg.static_linkage { "static " } else { "" };
        for clet in lets {
            self.out.push_str(&format!(
                "{linkage}void create_letbind_{}(void)\n{{\n",
                clet.index
            ));
            for (id, ctyp) in &clet.bindings {
                if ctyp.is_heap() {
                    self.line(
                        1,
                        &format!("CREATE({})(&{});", ctyp.mangled(), zencode(id.as_str())),
                    );
                }
            }
            let setup = clet.setup.clone();
            self.emit_instrs(&setup, 1);
            self.out.push_str("}\n\n");

            self.out.push_str(&format!(
                "{linkage}void kill_letbind_{}(void)\n{{\n",
                clet.index
            ));
            for (id, ctyp) in clet.bindings.iter().rev() {
                if ctyp.is_heap() {
                    self.line(
                        1,
                        &format!("KILL({})(&{});", ctyp.mangled(), zencode(id.as_str())),
                    );
                }
            }
            self.out.push_str("}\n\n");
        }
    }

    pub(super) fn emit_startup(
        &mut self,
        registers: &[&CRegister],
        lets: &[&CLet],
        program: &CProgram,
    ) {
        let has_main = program.defs.iter().any(|def| {
            matches!(def, CDef::Fun(cfun) if cfun.id == Id::new("main"))
        });

        if !self.cfg.no_rts {
            self.emit_model_init(registers, lets);
            self.emit_model_fini(registers, lets);
        }
        self.emit_model_main(has_main);
        if !self.cfg.no_main {
            self.out.push_str("int main(int argc, char *argv[])\n{\n");
            self.line(1, "return model_main(argc, argv);");
            self.out.push_str("}\n");
        }
    }

    fn emit_model_init(&mut self, registers: &[&CRegister], lets: &[&CLet]) {
        self.out.push_str("void model_init(void)\n{\n");
        self.line(1, "setup_rts();");
        if self.has_exceptions {
            self.line(
                1,
                "current_exception = rts_alloc(sizeof(struct zexception));",
            );
            self.line(1, "CREATE(union_exception)(current_exception);");
            self.line(1, "have_exception = false;");
        }
        for reg in registers {
            if reg.ctyp.is_heap() {
                self.line(
                    1,
                    &format!(
                        "CREATE({})(&{});",
                        reg.ctyp.mangled(),
                        zencode(reg.id.as_str())
                    ),
                );
            }
            let init = reg.init.clone();
            self.emit_instrs(&init, 1);
        }
        for clet in lets {
            self.line(1, &format!("create_letbind_{}();", clet.index));
        }
        self.out.push_str("}\n\n");
    }

    fn emit_model_fini(&mut self, registers: &[&CRegister], lets: &[&CLet]) {
        self.out.push_str("void model_fini(void)\n{\n");
        for clet in lets.iter().rev() {
            self.line(1, &format!("kill_letbind_{}();", clet.index));
        }
        for reg in registers.iter().rev() {
            if reg.ctyp.is_heap() {
                self.line(
                    1,
                    &format!(
                        "KILL({})(&{});",
                        reg.ctyp.mangled(),
                        zencode(reg.id.as_str())
                    ),
                );
            }
        }
        if self.has_exceptions {
            self.line(1, "KILL(union_exception)(current_exception);");
            self.line(1, "rts_free(current_exception);");
            self.line(1, "current_exception = NULL;");
        }
        self.line(1, "cleanup_rts();");
        self.out.push_str("}\n\n");
    }

    fn emit_model_main(&mut self, has_main: bool) {
        self.out
            .push_str("int model_main(int argc, char *argv[])\n{\n");
        self.line(1, "(void)argc;");
        self.line(1, "(void)argv;");
        if !self.cfg.no_rts {
            self.line(1, "model_init();");
        }
        if has_main {
            let fname = format!("{}{}", self.cfg.prefix, zencode("main"));
            self.line(1, &format!("{fname}(UNIT);"));
        }
        if !self.cfg.no_rts {
            self.line(1, "model_fini();");
        }
        self.line(1, "return EXIT_SUCCESS;");
        self.out.push_str("}\n\n");
    }
}
