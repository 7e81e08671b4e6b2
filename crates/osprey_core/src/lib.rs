//! Shared data model of the osprey compiler: the typed source IR handed over
//! by the front end, the concrete representations chosen by type lowering,
//! and the environment/prover seams the backend consumes.

#![deny(clippy::unwrap_used)]

pub mod ast;
pub mod ctype;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod lower;

pub use ast::{
    Arm, Def, Dir, Exp, FunDef, Id, Kind, KindedId, LExp, LetDef, Lit, LoopKind, NConstraint,
    NExp, Pat, Program, RegDef, TExp, TPat, Typ, TypArg, TypeDef,
};
pub use ctype::CTyp;
pub use diagnostics::{render_error, Position, Span};
pub use env::{ConstProver, Ctx, KindEnv, Prover, TypeEnv};
pub use error::{Error, Result};
pub use lower::lower_type;
