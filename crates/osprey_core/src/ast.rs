//! The typed source IR handed over by the (external) front end.
//!
//! Every expression node arrives already annotated with its inferred type and
//! source span; the backend never re-runs inference, it only re-lowers types
//! under refined local kind environments.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::diagnostics::Span;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub String);

impl Id {
    pub fn new(name: impl Into<String>) -> Self {
        Id(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds classify the arguments of parameterized types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Type-level integers (widths, ranges).
    Int,
    /// Ordinary types.
    Type,
    /// Type-level booleans.
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindedId {
    pub kind: Kind,
    pub id: Id,
}

/// Bit ordering of a vector: most-significant-first (`Dec`) or
/// least-significant-first (`Inc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dir {
    Inc,
    Dec,
}

/// Type-level numeric expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NExp {
    Constant(BigInt),
    Var(Id),
    Add(Box<NExp>, Box<NExp>),
    Sub(Box<NExp>, Box<NExp>),
    Mul(Box<NExp>, Box<NExp>),
    Neg(Box<NExp>),
}

impl NExp {
    pub fn constant(n: i64) -> Self {
        NExp::Constant(BigInt::from(n))
    }

    /// The literal value of this expression, when it is one.
    pub fn as_constant(&self) -> Option<&BigInt> {
        match self {
            NExp::Constant(n) => Some(n),
            _ => None,
        }
    }
}

/// Type-level constraints over numeric expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NConstraint {
    Equal(NExp, NExp),
    NotEqual(NExp, NExp),
    Ge(NExp, NExp),
    Gt(NExp, NExp),
    Le(NExp, NExp),
    Lt(NExp, NExp),
    Set(Id, Vec<BigInt>),
    Or(Box<NConstraint>, Box<NConstraint>),
    And(Box<NConstraint>, Box<NConstraint>),
    True,
    False,
}

/// Arguments of an applied type constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypArg {
    NExp(NExp),
    Typ(Typ),
    Dir(Dir),
    Bool(NConstraint),
}

/// The source type algebra.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Typ {
    /// A named type: one of the built-in primitives (`unit`, `bool`, `bit`,
    /// `int`, `nat`, `string`, `real`) or a user-declared record, variant,
    /// enumeration, or synonym.
    Id(Id),
    /// A type variable bound by an enclosing quantifier.
    Var(Id),
    /// An applied type constructor: `range`, `atom`, `atom_bool`, `implicit`,
    /// `itself`, `list`, `vector`, `register`, or a parameterized synonym.
    App(Id, Vec<TypArg>),
    Tuple(Vec<Typ>),
    /// An existential over integer kinds: `{'n 'm, constraint. body}`.
    Exist(Vec<KindedId>, NConstraint, Box<Typ>),
    /// A function type; only appears on definitions, never on values.
    Fn(Vec<Typ>, Box<Typ>),
}

impl Typ {
    pub fn id(name: &str) -> Self {
        Typ::Id(Id::new(name))
    }

    pub fn unit() -> Self {
        Typ::id("unit")
    }

    pub fn bool() -> Self {
        Typ::id("bool")
    }

    pub fn int() -> Self {
        Typ::id("int")
    }

    /// `bits(n)` in decreasing order, the idiomatic machine-word spelling.
    pub fn bits(n: i64) -> Self {
        Typ::App(
            Id::new("vector"),
            vec![
                TypArg::NExp(NExp::constant(n)),
                TypArg::Dir(Dir::Dec),
                TypArg::Typ(Typ::id("bit")),
            ],
        )
    }

    pub fn atom(nexp: NExp) -> Self {
        Typ::App(Id::new("atom"), vec![TypArg::NExp(nexp)])
    }

    pub fn range(lo: NExp, hi: NExp) -> Self {
        Typ::App(Id::new("range"), vec![TypArg::NExp(lo), TypArg::NExp(hi)])
    }

    pub fn list(elem: Typ) -> Self {
        Typ::App(Id::new("list"), vec![TypArg::Typ(elem)])
    }
}

// ── Expressions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Lit {
    Unit,
    Bool(bool),
    /// A single bit.
    Bit(bool),
    Num(BigInt),
    /// Bit-vector literal, most-significant bit first.
    Bits(Vec<bool>),
    String(String),
    /// Reals are kept as their source spelling; the backend never computes
    /// with them.
    Real(String),
    /// An unspecified value of the annotated type.
    Undefined,
}

/// A type- and span-annotated expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TExp {
    pub exp: Exp,
    pub typ: Typ,
    pub span: Span,
}

impl TExp {
    pub fn new(exp: Exp, typ: Typ, span: Span) -> Self {
        TExp { exp, typ, span }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exp {
    Lit(Lit),
    Id(Id),
    /// A reference to a register, yielding `register(T)`.
    Ref(Id),
    /// Application of a function, primitive, or variant constructor.
    Call(Id, Vec<TExp>),
    Tuple(Vec<TExp>),
    /// Record literal; fields in declaration order.
    Struct(Id, Vec<(Id, TExp)>),
    Field(Box<TExp>, Id),
    If(Box<TExp>, Box<TExp>, Box<TExp>),
    Match(Box<TExp>, Vec<Arm>),
    Try(Box<TExp>, Vec<Arm>),
    /// Immutable binding: `let pat = e1 in e2`.
    Let(TPat, Box<TExp>, Box<TExp>),
    /// Mutable local declaration: `var x = e1 in e2`.
    Var(Id, Box<TExp>, Box<TExp>),
    Assign(LExp, Box<TExp>),
    Block(Vec<TExp>),
    Return(Box<TExp>),
    Throw(Box<TExp>),
    /// Counted loop over an `FInt(64)` index.
    For(Id, Box<TExp>, Box<TExp>, Box<TExp>, Dir, Box<TExp>),
    Loop(LoopKind, Box<TExp>, Box<TExp>),
    List(Vec<TExp>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    While,
    Until,
}

/// Assignment targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LExp {
    Id(Id, Typ),
    Field(Box<LExp>, Id, Typ),
}

impl LExp {
    pub fn typ(&self) -> &Typ {
        match self {
            LExp::Id(_, typ) | LExp::Field(_, _, typ) => typ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub pat: TPat,
    pub guard: Option<TExp>,
    pub body: TExp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TPat {
    pub pat: Pat,
    pub typ: Typ,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pat {
    Wild,
    Id(Id),
    Lit(Lit),
    Tuple(Vec<TPat>),
    Ctor(Id, Vec<TPat>),
}

// ── Definitions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDef {
    Record {
        id: Id,
        fields: Vec<(Typ, Id)>,
    },
    Variant {
        id: Id,
        ctors: Vec<(Typ, Id)>,
    },
    Enum {
        id: Id,
        members: Vec<Id>,
    },
    Synonym {
        id: Id,
        typ: Typ,
    },
}

impl TypeDef {
    pub fn id(&self) -> &Id {
        match self {
            TypeDef::Record { id, .. }
            | TypeDef::Variant { id, .. }
            | TypeDef::Enum { id, .. }
            | TypeDef::Synonym { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunDef {
    pub id: Id,
    pub params: Vec<Id>,
    /// The function's `Fn` type; its arity must match `params`.
    pub typ: Typ,
    pub body: TExp,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetDef {
    pub pat: TPat,
    pub body: TExp,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegDef {
    pub id: Id,
    pub typ: Typ,
    pub init: Option<TExp>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Def {
    Type(TypeDef),
    Fun(FunDef),
    Let(LetDef),
    Register(RegDef),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub defs: Vec<Def>,
}
