//! Per-instruction translation to C statements, and rendering of inline
//! right-values. The translation is a direct surjection: one instruction,
//! one statement (plus allocation/conversion calls where a representation
//! boundary is crossed).

use osprey_core::CTyp;

use crate::cir::{CLExp, CVal, CallTarget, Instr, Name, Op, VLit};
use crate::zencode::zencode;

use super::ctypes::{c_type, poison_value};
use super::Emitter;

pub fn render_name(name: &Name) -> String {
    match name {
        Name::Id(id, 0) => zencode(id.as_str()),
        Name::Id(id, n) => zencode(&format!("{id}#{n}")),
        Name::Return => "rop".to_string(),
        Name::CurrentException => "(*current_exception)".to_string(),
        Name::HaveException => "have_exception".to_string(),
    }
}

pub fn render_vlit(vlit: &VLit, ctyp: &CTyp) -> String {
    match vlit {
        VLit::Unit => "UNIT".to_string(),
        VLit::Bool(b) => b.to_string(),
        VLit::Bit(b) => format!("UINT64_C({})", u64::from(*b)),
        VLit::Int(n) => match ctyp {
            CTyp::Bit | CTyp::FBits(_, _) => format!("UINT64_C({n:#X})"),
            _ => format!("INT64_C({n})"),
        },
        VLit::Bits(bits) => format!("UINT64_C({:#X})", bits_to_word(bits)),
        VLit::String(s) => quote_c_string(s),
        VLit::Real(r) => r.clone(),
        VLit::Member(id) => zencode(id.as_str()),
    }
}

/// Most-significant-bit-first to machine word; widths above 64 never reach
/// inline position.
fn bits_to_word(bits: &[bool]) -> u64 {
    bits.iter().fold(0, |acc, b| (acc << 1) | u64::from(*b))
}

fn quote_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn render_cval(cval: &CVal) -> String {
    match cval {
        CVal::Id(name, _) => render_name(name),
        CVal::Lit(vlit, ctyp) => render_vlit(vlit, ctyp),
        CVal::TupleMember(inner, i, _) => format!("({}).ztup{i}", render_cval(inner)),
        CVal::Field(inner, field, _) => {
            format!("({}).{}", render_cval(inner), zencode(field.as_str()))
        }
        CVal::CtorKind(inner, ctor, _) => format!(
            "(({}).kind == Kind_{})",
            render_cval(inner),
            zencode(ctor.as_str())
        ),
        CVal::CtorUnwrap(inner, ctor, _) => {
            format!("(({}).{})", render_cval(inner), zencode(ctor.as_str()))
        }
        CVal::Call(op, args, _) => render_op(op, args),
        CVal::Raw(text, _) => text.clone(),
    }
}

fn render_op(op: &Op, args: &[CVal]) -> String {
    let arg = |i: usize| render_cval(&args[i]);
    let infix = |sym: &str| format!("({} {sym} {})", arg(0), arg(1));
    match op {
        Op::Not => format!("!({})", arg(0)),
        Op::Eq => infix("=="),
        Op::Neq => infix("!="),
        Op::Ilt => infix("<"),
        Op::Ilteq => infix("<="),
        Op::Igt => infix(">"),
        Op::Igteq => infix(">="),
        Op::Iadd => infix("+"),
        Op::Isub => infix("-"),
        Op::Ineg => format!("(-{})", arg(0)),
        Op::Bnot => format!("(~{})", arg(0)),
        Op::Band => infix("&"),
        Op::Bor => infix("|"),
        Op::Bxor => infix("^"),
        Op::Badd => infix("+"),
        Op::Shl => infix("<<"),
        Op::Shr => infix(">>"),
        Op::AddrOf => format!("(&{})", arg(0)),
        Op::Mask(n) if *n >= 64 => arg(0),
        Op::Mask(n) => format!("((UINT64_MAX >> (64 - {n})) & ({}))", arg(0)),
        Op::Helper(name) => {
            let rendered: Vec<String> = args.iter().map(render_cval).collect();
            format!("{name}({})", rendered.join(", "))
        }
    }
}

pub fn render_clexp(clexp: &CLExp) -> String {
    match clexp {
        CLExp::Id(name, _) => render_name(name),
        CLExp::Field(inner, field, _) => {
            format!("{}.{}", render_clexp(inner), zencode(field.as_str()))
        }
        CLExp::Tuple(inner, i, _) => format!("{}.ztup{i}", render_clexp(inner)),
        CLExp::Deref(inner) => format!("(*{})", render_clexp(inner)),
    }
}

/// The `CREATE_OF`/`RECREATE_OF` source tag of an initializer literal.
fn lit_source_tag(vlit: &VLit) -> &'static str {
    match vlit {
        VLit::Int(_) => "fint",
        VLit::Bits(bits) if bits.len() <= 64 => "fbits",
        VLit::Bits(_) => "string",
        VLit::String(_) | VLit::Real(_) => "string",
        _ => "fint",
    }
}

fn render_init_lit(vlit: &VLit, ctyp: &CTyp) -> String {
    match vlit {
        // Wide bit literals travel as hex strings.
        VLit::Bits(bits) if bits.len() > 64 => {
            let mut hex = String::from("0x");
            for chunk in bits.chunks(4) {
                let mut nibble = 0u8;
                for b in chunk {
                    nibble = (nibble << 1) | u8::from(*b);
                }
                hex.push_str(&format!("{nibble:X}"));
            }
            quote_c_string(&hex)
        }
        VLit::Real(r) => quote_c_string(r),
        other => render_vlit(other, ctyp),
    }
}

impl Emitter<'_> {
    pub(super) fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub(super) fn emit_instrs(&mut self, instrs: &[Instr], depth: usize) {
        for instr in instrs {
            self.emit_instr(instr, depth);
        }
    }

    pub(super) fn emit_instr(&mut self, instr: &Instr, depth: usize) {
        match instr {
            Instr::Decl(ctyp, name) => {
                let name = render_name(name);
                self.line(depth, &format!("{} {name};", c_type(ctyp)));
                if ctyp.is_heap() {
                    self.line(depth, &format!("CREATE({})(&{name});", ctyp.mangled()));
                }
            }
            Instr::Init(ctyp, name, cval) => {
                let spelled = render_name(name);
                self.line(depth, &format!("{} {spelled};", c_type(ctyp)));
                match cval {
                    CVal::Lit(vlit, _) if ctyp.is_heap() => {
                        self.line(
                            depth,
                            &format!(
                                "CREATE_OF({}, {})(&{spelled}, {});",
                                ctyp.mangled(),
                                lit_source_tag(vlit),
                                render_init_lit(vlit, ctyp)
                            ),
                        );
                    }
                    _ => {
                        if ctyp.is_heap() {
                            self.line(depth, &format!("CREATE({})(&{spelled});", ctyp.mangled()));
                        }
                        self.emit_copy(&CLExp::Id(name.clone(), ctyp.clone()), cval, depth);
                    }
                }
            }
            Instr::Copy(dest, cval) => self.emit_copy(dest, cval, depth),
            Instr::Funcall(dest, target, args) => self.emit_funcall(dest, target, args, depth),
            Instr::If(cond, then_instrs, else_instrs, _) => {
                self.line(depth, &format!("if ({}) {{", render_cval(cond)));
                self.emit_instrs(then_instrs, depth + 1);
                if else_instrs.is_empty() {
                    self.line(depth, "}");
                } else {
                    self.line(depth, "} else {");
                    self.emit_instrs(else_instrs, depth + 1);
                    self.line(depth, "}");
                }
            }
            Instr::Jump(cond, label) => {
                self.line(depth, &format!("if ({}) goto {label};", render_cval(cond)));
            }
            Instr::Goto(label) => self.line(depth, &format!("goto {label};")),
            Instr::Label(label) => self.line(0, &format!("{label}: ;")),
            Instr::Block(instrs) | Instr::TryBlock(instrs) => {
                self.line(depth, "{");
                self.emit_instrs(instrs, depth + 1);
                self.line(depth, "}");
            }
            Instr::Clear(ctyp, name) => {
                self.line(
                    depth,
                    &format!("KILL({})(&{});", ctyp.mangled(), render_name(name)),
                );
            }
            Instr::Reset(ctyp, name) => {
                self.line(
                    depth,
                    &format!("RECREATE({})(&{});", ctyp.mangled(), render_name(name)),
                );
            }
            Instr::Reinit(ctyp, name, cval) => {
                let spelled = render_name(name);
                match cval {
                    CVal::Lit(vlit, _) if ctyp.is_heap() => {
                        self.line(
                            depth,
                            &format!(
                                "RECREATE_OF({}, {})(&{spelled}, {});",
                                ctyp.mangled(),
                                lit_source_tag(vlit),
                                render_init_lit(vlit, ctyp)
                            ),
                        );
                    }
                    _ => {
                        self.line(depth, &format!("RECREATE({})(&{spelled});", ctyp.mangled()));
                        self.emit_copy(&CLExp::Id(name.clone(), ctyp.clone()), cval, depth);
                    }
                }
            }
            Instr::Alias(_, name, cval) => {
                self.line(
                    depth,
                    &format!("{} = {};", render_name(name), render_cval(cval)),
                );
            }
            Instr::Return(cval) => {
                self.emit_epilogue(depth);
                self.line(depth, &format!("return {};", render_cval(cval)));
            }
            Instr::End => {
                self.emit_epilogue(depth);
                let (heap_return, ret) = match &self.current_fn {
                    Some(ctx) => (ctx.heap_return, ctx.ret.clone()),
                    None => (true, CTyp::Unit),
                };
                if heap_return {
                    self.line(depth, "return;");
                } else {
                    self.line(depth, &format!("return {};", poison_value(&ret)));
                }
            }
            Instr::MatchFailure => {
                let fn_name = self
                    .current_fn
                    .as_ref()
                    .map(|ctx| ctx.name.clone())
                    .unwrap_or_default();
                self.line(depth, &format!("match_failure(\"{fn_name}\");"));
            }
            Instr::Comment(text) => self.line(depth, &format!("/* {text} */")),
            Instr::Raw(text) => self.line(depth, text),
        }
    }

    fn emit_epilogue(&mut self, depth: usize) {
        let epilogue = self
            .current_fn
            .as_ref()
            .map(|ctx| ctx.epilogue.clone())
            .unwrap_or_default();
        for instr in &epilogue {
            self.emit_instr(instr, depth);
        }
    }

    pub(super) fn emit_copy(&mut self, dest: &CLExp, cval: &CVal, depth: usize) {
        let dst_ct = dest.ctyp();
        let src_ct = cval.ctyp();
        let dest_s = render_clexp(dest);
        let src_s = render_cval(cval);
        if dst_ct == src_ct {
            if dst_ct.is_heap() {
                self.line(
                    depth,
                    &format!("COPY({})(&{dest_s}, {src_s});", dst_ct.mangled()),
                );
            } else {
                self.line(depth, &format!("{dest_s} = {src_s};"));
            }
        } else if dst_ct.is_stack() && src_ct.is_stack() && c_type(&dst_ct) == c_type(&src_ct) {
            // Same machine shape (e.g. two fixed widths of one word).
            self.line(depth, &format!("{dest_s} = {src_s};"));
        } else if dst_ct.is_heap() {
            self.line(
                depth,
                &format!(
                    "CONVERT_OF({}, {})(&{dest_s}, {src_s});",
                    dst_ct.mangled(),
                    src_ct.mangled()
                ),
            );
        } else {
            self.line(
                depth,
                &format!(
                    "{dest_s} = CONVERT_OF({}, {})({src_s});",
                    dst_ct.mangled(),
                    src_ct.mangled()
                ),
            );
        }
    }

    fn emit_funcall(&mut self, dest: &CLExp, target: &CallTarget, args: &[CVal], depth: usize) {
        let rendered: Vec<String> = args.iter().map(render_cval).collect();
        let dest_s = render_clexp(dest);
        match target {
            CallTarget::Fn(id) => {
                let fname = format!("{}{}", self.cfg.prefix, zencode(id.as_str()));
                let ret = self
                    .sigs
                    .funs
                    .get(id)
                    .map(|(_, ret)| ret.clone())
                    .unwrap_or_else(|| dest.ctyp());
                let mut all_args = rendered;
                if all_args.is_empty() {
                    all_args.push("UNIT".to_string());
                }
                if let Some(extra) = &self.cfg.extra_arguments {
                    all_args.push(extra.clone());
                }
                let arg_list = all_args.join(", ");
                let dst_ct = dest.ctyp();
                if ret.is_heap() {
                    if dst_ct == ret {
                        self.line(depth, &format!("{fname}(&{dest_s}, {arg_list});"));
                    } else {
                        // The callee fills a slot of its own representation;
                        // convert on the way out.
                        let tmp = format!("conv{}", self.temp_counter);
                        self.temp_counter += 1;
                        self.line(depth, "{");
                        self.line(depth + 1, &format!("{} {tmp};", c_type(&ret)));
                        self.line(depth + 1, &format!("CREATE({})(&{tmp});", ret.mangled()));
                        self.line(depth + 1, &format!("{fname}(&{tmp}, {arg_list});"));
                        self.emit_copy(dest, &CVal::Raw(tmp.clone(), ret.clone()), depth + 1);
                        self.line(depth + 1, &format!("KILL({})(&{tmp});", ret.mangled()));
                        self.line(depth, "}");
                    }
                } else {
                    self.emit_copy(dest, &CVal::Raw(format!("{fname}({arg_list})"), ret), depth);
                }
            }
            CallTarget::Ctor(_, ctor) => {
                self.line(
                    depth,
                    &format!(
                        "{}(&{dest_s}, {});",
                        zencode(ctor.as_str()),
                        rendered.join(", ")
                    ),
                );
            }
            CallTarget::Extern(name) => {
                self.emit_extern_call(dest, name, args, &rendered, depth);
            }
        }
    }

    fn emit_extern_call(
        &mut self,
        dest: &CLExp,
        name: &str,
        args: &[CVal],
        rendered: &[String],
        depth: usize,
    ) {
        let dest_s = render_clexp(dest);
        let dst_ct = dest.ctyp();
        match name {
            "list_empty" => self.line(depth, &format!("{dest_s} = NULL;")),
            "list_cons" => {
                let mangled = dst_ct.mangled();
                self.line(
                    depth,
                    &format!("cons_{mangled}(&{dest_s}, {});", rendered.join(", ")),
                );
            }
            "list_hd" => {
                let list_ct = args.first().map(CVal::ctyp).unwrap_or(CTyp::Unit);
                let mangled = list_ct.mangled();
                if dst_ct.is_stack() {
                    self.line(depth, &format!("{dest_s} = pick_{mangled}({});", rendered[0]));
                } else {
                    self.line(depth, &format!("pick_{mangled}(&{dest_s}, {});", rendered[0]));
                }
            }
            "vector_access" if matches!(args.first().map(CVal::ctyp), Some(CTyp::Vector(_, _))) => {
                let vec_ct = args[0].ctyp();
                let mangled = vec_ct.mangled();
                if dst_ct.is_stack() {
                    self.line(
                        depth,
                        &format!("{dest_s} = vector_access_{mangled}({});", rendered.join(", ")),
                    );
                } else {
                    self.line(
                        depth,
                        &format!(
                            "vector_access_{mangled}(&{dest_s}, {});",
                            rendered.join(", ")
                        ),
                    );
                }
            }
            _ => {
                if dst_ct.is_heap() {
                    self.line(
                        depth,
                        &format!("{name}(&{dest_s}, {});", rendered.join(", ")),
                    );
                } else {
                    self.line(
                        depth,
                        &format!("{dest_s} = {name}({});", rendered.join(", ")),
                    );
                }
            }
        }
    }
}
