//! The target IR: a linear, statement-oriented instruction form.
//!
//! Instructions are produced by the IR compiler, reshaped by the rewrite
//! passes, and translated one-for-one into C statements by the emitter.
//! Right-values ([`CVal`]) are pure inline expressions; everything with an
//! effect is an [`Instr`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use osprey_core::{CTyp, Id};

/// Addressable locations. `Return` is the function-return slot before the
/// return rewriter runs; the exception names address the process-wide
/// exception state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Name {
    /// A source-named or generated local; the number distinguishes shadowed
    /// declarations after the unique-names pass.
    Id(Id, u32),
    Return,
    CurrentException,
    HaveException,
}

impl Name {
    pub fn local(id: impl Into<String>) -> Name {
        Name::Id(Id::new(id), 0)
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Name::Id(id, 0) => write!(f, "{id}"),
            Name::Id(id, n) => write!(f, "{id}#{n}"),
            Name::Return => write!(f, "return"),
            Name::CurrentException => write!(f, "current_exception"),
            Name::HaveException => write!(f, "have_exception"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VLit {
    Unit,
    Bool(bool),
    Bit(bool),
    Int(i64),
    /// Most-significant bit first.
    Bits(Vec<bool>),
    String(String),
    Real(String),
    /// An enumeration member.
    Member(Id),
}

/// Operators usable inside inline expressions. `Helper` names a runtime
/// function that is pure and callable in expression position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Not,
    Eq,
    Neq,
    Ilt,
    Ilteq,
    Igt,
    Igteq,
    Iadd,
    Isub,
    Ineg,
    Bnot,
    Band,
    Bor,
    Bxor,
    Badd,
    Shl,
    Shr,
    AddrOf,
    /// Truncate to the low `n` bits.
    Mask(u32),
    Helper(String),
}

/// Right-value atoms: pure expressions the emitter can print inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CVal {
    Id(Name, CTyp),
    Lit(VLit, CTyp),
    TupleMember(Box<CVal>, usize, CTyp),
    Field(Box<CVal>, Id, CTyp),
    /// Tag test: is this variant value built by `ctor`? Carries the payload
    /// representation expected at the test site, so variant specialization
    /// can tell the instances of one constructor apart.
    CtorKind(Box<CVal>, Id, CTyp),
    /// Payload projection out of a variant value known to be built by `ctor`.
    CtorUnwrap(Box<CVal>, Id, CTyp),
    Call(Op, Vec<CVal>, CTyp),
    Raw(String, CTyp),
}

impl CVal {
    pub fn ctyp(&self) -> CTyp {
        match self {
            CVal::Id(_, ctyp)
            | CVal::Lit(_, ctyp)
            | CVal::TupleMember(_, _, ctyp)
            | CVal::Field(_, _, ctyp)
            | CVal::CtorUnwrap(_, _, ctyp)
            | CVal::Call(_, _, ctyp)
            | CVal::Raw(_, ctyp) => ctyp.clone(),
            CVal::CtorKind(_, _, _) => CTyp::Bool,
        }
    }

    pub fn unit() -> CVal {
        CVal::Lit(VLit::Unit, CTyp::Unit)
    }

    pub fn bool(value: bool) -> CVal {
        CVal::Lit(VLit::Bool(value), CTyp::Bool)
    }
}

/// Structured left-values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CLExp {
    Id(Name, CTyp),
    Field(Box<CLExp>, Id, CTyp),
    Tuple(Box<CLExp>, usize, CTyp),
    /// Write through a pointer; the inner left-value has a `Ref`
    /// representation.
    Deref(Box<CLExp>),
}

impl CLExp {
    pub fn local(name: Name, ctyp: CTyp) -> CLExp {
        CLExp::Id(name, ctyp)
    }

    pub fn ctyp(&self) -> CTyp {
        match self {
            CLExp::Id(_, ctyp) | CLExp::Field(_, _, ctyp) | CLExp::Tuple(_, _, ctyp) => {
                ctyp.clone()
            }
            CLExp::Deref(inner) => match inner.ctyp() {
                CTyp::Ref(pointee) => *pointee,
                other => other,
            },
        }
    }

    /// The local this left-value ultimately writes.
    pub fn root(&self) -> &Name {
        match self {
            CLExp::Id(name, _) => name,
            CLExp::Field(inner, _, _) | CLExp::Tuple(inner, _, _) | CLExp::Deref(inner) => {
                inner.root()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallTarget {
    /// A user function, by source id.
    Fn(Id),
    /// A variant constructor: `(variant, constructor)`.
    Ctor(Id, Id),
    /// A runtime primitive, by its C-level name.
    Extern(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    Decl(CTyp, Name),
    Init(CTyp, Name, CVal),
    Copy(CLExp, CVal),
    Funcall(CLExp, CallTarget, Vec<CVal>),
    If(CVal, Vec<Instr>, Vec<Instr>, CTyp),
    /// Conditional branch to a label.
    Jump(CVal, String),
    Goto(String),
    Label(String),
    Block(Vec<Instr>),
    TryBlock(Vec<Instr>),
    Clear(CTyp, Name),
    /// Re-initialize an already-allocated slot.
    Reset(CTyp, Name),
    Reinit(CTyp, Name, CVal),
    /// Bind a name to a value without copying; only the experimental
    /// alias-hoisting pass produces this.
    Alias(CTyp, Name, CVal),
    Return(CVal),
    /// Function exit with no value (heap-returning functions).
    End,
    MatchFailure,
    Comment(String),
    Raw(String),
}

// ── Traversal and renaming ───────────────────────────────────────────────────

impl Instr {
    /// Nested instruction lists, for recursive walks.
    pub fn sub_instrs(&self) -> Vec<&Vec<Instr>> {
        match self {
            Instr::If(_, then_instrs, else_instrs, _) => vec![then_instrs, else_instrs],
            Instr::Block(instrs) | Instr::TryBlock(instrs) => vec![instrs],
            _ => Vec::new(),
        }
    }

    pub fn sub_instrs_mut(&mut self) -> Vec<&mut Vec<Instr>> {
        match self {
            Instr::If(_, then_instrs, else_instrs, _) => vec![then_instrs, else_instrs],
            Instr::Block(instrs) | Instr::TryBlock(instrs) => vec![instrs],
            _ => Vec::new(),
        }
    }

    /// Names read by this instruction (transitively, including nested
    /// instructions).
    pub fn reads(&self) -> HashSet<Name> {
        let mut out = HashSet::new();
        self.collect_reads(&mut out);
        out
    }

    fn collect_reads(&self, out: &mut HashSet<Name>) {
        match self {
            Instr::Init(_, _, cval)
            | Instr::Copy(_, cval)
            | Instr::Reinit(_, _, cval)
            | Instr::Alias(_, _, cval)
            | Instr::Jump(cval, _)
            | Instr::Return(cval) => cval_reads(cval, out),
            Instr::Funcall(clexp, _, args) => {
                // Projections under the destination are reads of the root.
                if !matches!(clexp, CLExp::Id(_, _)) {
                    out.insert(clexp.root().clone());
                }
                for arg in args {
                    cval_reads(arg, out);
                }
            }
            Instr::If(cond, then_instrs, else_instrs, _) => {
                cval_reads(cond, out);
                for instr in then_instrs.iter().chain(else_instrs) {
                    instr.collect_reads(out);
                }
            }
            Instr::Block(instrs) | Instr::TryBlock(instrs) => {
                for instr in instrs {
                    instr.collect_reads(out);
                }
            }
            _ => {}
        }
        if let Instr::Copy(clexp, _) = self {
            if !matches!(clexp, CLExp::Id(_, _)) {
                out.insert(clexp.root().clone());
            }
        }
    }

    /// Names written by this instruction (transitively).
    pub fn writes(&self) -> HashSet<Name> {
        let mut out = HashSet::new();
        self.collect_writes(&mut out);
        out
    }

    fn collect_writes(&self, out: &mut HashSet<Name>) {
        match self {
            Instr::Decl(_, name)
            | Instr::Init(_, name, _)
            | Instr::Clear(_, name)
            | Instr::Reset(_, name)
            | Instr::Reinit(_, name, _)
            | Instr::Alias(_, name, _) => {
                out.insert(name.clone());
            }
            Instr::Copy(clexp, _) | Instr::Funcall(clexp, _, _) => {
                out.insert(clexp.root().clone());
            }
            Instr::If(_, then_instrs, else_instrs, _) => {
                for instr in then_instrs.iter().chain(else_instrs) {
                    instr.collect_writes(out);
                }
            }
            Instr::Block(instrs) | Instr::TryBlock(instrs) => {
                for instr in instrs {
                    instr.collect_writes(out);
                }
            }
            _ => {}
        }
    }

    pub fn mentions(&self, name: &Name) -> bool {
        self.reads().contains(name) || self.writes().contains(name)
    }

    /// Apply `f` to every right-value in this instruction, nested
    /// instructions included. `f` sees each `CVal` node exactly once,
    /// outermost first.
    pub fn visit_cvals_mut(&mut self, f: &mut impl FnMut(&mut CVal)) {
        match self {
            Instr::Init(_, _, cval)
            | Instr::Copy(_, cval)
            | Instr::Reinit(_, _, cval)
            | Instr::Alias(_, _, cval)
            | Instr::Jump(cval, _)
            | Instr::Return(cval) => visit_cval(cval, f),
            Instr::Funcall(_, _, args) => {
                for arg in args {
                    visit_cval(arg, f);
                }
            }
            Instr::If(cond, then_instrs, else_instrs, _) => {
                visit_cval(cond, f);
                for instr in then_instrs.iter_mut().chain(else_instrs) {
                    instr.visit_cvals_mut(f);
                }
            }
            Instr::Block(instrs) | Instr::TryBlock(instrs) => {
                for instr in instrs {
                    instr.visit_cvals_mut(f);
                }
            }
            _ => {}
        }
    }

    /// Rewrite every occurrence of `from` to `to`.
    pub fn rename(&mut self, from: &Name, to: &Name) {
        match self {
            Instr::Decl(_, name) | Instr::Clear(_, name) | Instr::Reset(_, name) => {
                rename_name(name, from, to);
            }
            Instr::Init(_, name, cval)
            | Instr::Reinit(_, name, cval)
            | Instr::Alias(_, name, cval) => {
                rename_name(name, from, to);
                rename_cval(cval, from, to);
            }
            Instr::Copy(clexp, cval) => {
                rename_clexp(clexp, from, to);
                rename_cval(cval, from, to);
            }
            Instr::Funcall(clexp, _, args) => {
                rename_clexp(clexp, from, to);
                for arg in args {
                    rename_cval(arg, from, to);
                }
            }
            Instr::If(cond, then_instrs, else_instrs, _) => {
                rename_cval(cond, from, to);
                for instr in then_instrs.iter_mut().chain(else_instrs) {
                    instr.rename(from, to);
                }
            }
            Instr::Jump(cval, _) | Instr::Return(cval) => rename_cval(cval, from, to),
            Instr::Block(instrs) | Instr::TryBlock(instrs) => {
                for instr in instrs {
                    instr.rename(from, to);
                }
            }
            _ => {}
        }
    }
}

fn rename_name(name: &mut Name, from: &Name, to: &Name) {
    if name == from {
        *name = to.clone();
    }
}

fn rename_cval(cval: &mut CVal, from: &Name, to: &Name) {
    match cval {
        CVal::Id(name, _) => rename_name(name, from, to),
        CVal::TupleMember(inner, _, _)
        | CVal::Field(inner, _, _)
        | CVal::CtorKind(inner, _, _)
        | CVal::CtorUnwrap(inner, _, _) => rename_cval(inner, from, to),
        CVal::Call(_, args, _) => {
            for arg in args {
                rename_cval(arg, from, to);
            }
        }
        CVal::Lit(_, _) | CVal::Raw(_, _) => {}
    }
}

fn rename_clexp(clexp: &mut CLExp, from: &Name, to: &Name) {
    match clexp {
        CLExp::Id(name, _) => rename_name(name, from, to),
        CLExp::Field(inner, _, _) | CLExp::Tuple(inner, _, _) | CLExp::Deref(inner) => {
            rename_clexp(inner, from, to)
        }
    }
}

fn visit_cval(cval: &mut CVal, f: &mut impl FnMut(&mut CVal)) {
    f(cval);
    match cval {
        CVal::TupleMember(inner, _, _)
        | CVal::Field(inner, _, _)
        | CVal::CtorKind(inner, _, _)
        | CVal::CtorUnwrap(inner, _, _) => visit_cval(inner, f),
        CVal::Call(_, args, _) => {
            for arg in args {
                visit_cval(arg, f);
            }
        }
        CVal::Id(_, _) | CVal::Lit(_, _) | CVal::Raw(_, _) => {}
    }
}

fn cval_reads(cval: &CVal, out: &mut HashSet<Name>) {
    match cval {
        CVal::Id(name, _) => {
            out.insert(name.clone());
        }
        CVal::TupleMember(inner, _, _)
        | CVal::Field(inner, _, _)
        | CVal::CtorKind(inner, _, _)
        | CVal::CtorUnwrap(inner, _, _) => cval_reads(inner, out),
        CVal::Call(_, args, _) => {
            for arg in args {
                cval_reads(arg, out);
            }
        }
        CVal::Lit(_, _) | CVal::Raw(_, _) => {}
    }
}

// ── Generated definitions ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CTypeDef {
    Enum(Id, Vec<Id>),
    Struct(Id, Vec<(Id, CTyp)>),
    Variant(Id, Vec<(Id, CTyp)>),
}

impl CTypeDef {
    pub fn id(&self) -> &Id {
        match self {
            CTypeDef::Enum(id, _) | CTypeDef::Struct(id, _) | CTypeDef::Variant(id, _) => id,
        }
    }

    pub fn ctyp(&self) -> CTyp {
        match self {
            CTypeDef::Enum(id, members) => CTyp::Enum(id.clone(), members.clone()),
            CTypeDef::Struct(id, fields) => CTyp::Struct(id.clone(), fields.clone()),
            CTypeDef::Variant(id, ctors) => CTyp::Variant(id.clone(), ctors.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CFun {
    pub id: Id,
    pub params: Vec<(Id, CTyp)>,
    pub ret: CTyp,
    /// Declarations hoisted to the function entry.
    pub prologue: Vec<Instr>,
    pub body: Vec<Instr>,
    /// Clears hoisted to the function exit.
    pub epilogue: Vec<Instr>,
    /// The unique function-exit label early returns jump to.
    pub end_label: String,
    /// Label of the exception exit block, when the program declares
    /// exceptions.
    pub exc_label: Option<String>,
}

impl CFun {
    /// Heap-returning functions receive a caller-provided pointer instead of
    /// returning by value.
    pub fn heap_return(&self) -> bool {
        self.ret.is_heap()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CLet {
    pub index: usize,
    pub bindings: Vec<(Id, CTyp)>,
    pub setup: Vec<Instr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CRegister {
    pub id: Id,
    pub ctyp: CTyp,
    pub init: Vec<Instr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CDef {
    Type(CTypeDef),
    Register(CRegister),
    Let(CLet),
    Fun(CFun),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CProgram {
    pub defs: Vec<CDef>,
}

impl CProgram {
    pub fn functions(&self) -> impl Iterator<Item = &CFun> {
        self.defs.iter().filter_map(|def| match def {
            CDef::Fun(cfun) => Some(cfun),
            _ => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut CFun> {
        self.defs.iter_mut().filter_map(|def| match def {
            CDef::Fun(cfun) => Some(cfun),
            _ => None,
        })
    }

    pub fn variant_def(&self, id: &Id) -> Option<&[(Id, CTyp)]> {
        self.defs.iter().find_map(|def| match def {
            CDef::Type(CTypeDef::Variant(vid, ctors)) if vid == id => Some(ctors.as_slice()),
            _ => None,
        })
    }
}

/// Fresh names and labels for the whole compilation run. The counter is
/// monotonic; a run starts it at zero.
#[derive(Debug, Default)]
pub struct NameGen {
    counter: u32,
}

impl NameGen {
    pub fn new() -> Self {
        NameGen::default()
    }

    pub fn fresh(&mut self) -> Name {
        let n = self.counter;
        self.counter += 1;
        Name::local(format!("gz{n}"))
    }

    pub fn label(&mut self, stem: &str) -> String {
        let n = self.counter;
        self.counter += 1;
        format!("{stem}_{n}")
    }

    /// A numbered variant of an existing name, for the unique-names pass.
    pub fn renumber(&mut self, name: &Name) -> Name {
        let n = self.counter;
        self.counter += 1;
        match name {
            Name::Id(id, _) => Name::Id(id.clone(), n),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> Name {
        Name::local(name)
    }

    #[test]
    fn rename_reaches_nested_branches() {
        let mut instr = Instr::If(
            CVal::Id(local("c"), CTyp::Bool),
            vec![Instr::Copy(
                CLExp::Id(local("x"), CTyp::FInt(64)),
                CVal::Id(local("y"), CTyp::FInt(64)),
            )],
            vec![],
            CTyp::Unit,
        );
        instr.rename(&local("y"), &local("w"));
        assert!(instr.reads().contains(&local("w")));
        assert!(!instr.reads().contains(&local("y")));
    }

    #[test]
    fn writes_see_through_projections() {
        let instr = Instr::Copy(
            CLExp::Field(
                Box::new(CLExp::Id(local("s"), CTyp::Struct(Id::new("s"), vec![]))),
                Id::new("f"),
                CTyp::Bool,
            ),
            CVal::bool(true),
        );
        assert!(instr.writes().contains(&local("s")));
        // A partial write also reads the rest of the aggregate.
        assert!(instr.reads().contains(&local("s")));
    }

    #[test]
    fn fresh_names_are_distinct() {
        let mut gen = NameGen::new();
        let a = gen.fresh();
        let b = gen.fresh();
        assert_ne!(a, b);
    }
}
