use std::collections::HashMap;

use crate::ast::{Def, Id, Kind, KindedId, NConstraint, NExp, Program, Typ, TypeDef};

/// The local kind environment threaded through existential binders and
/// pattern branches during type lowering. Cloning is cheap; lowering under a
/// refined environment never disturbs its parent.
#[derive(Debug, Clone, Default)]
pub struct KindEnv {
    pub vars: im::HashMap<Id, Kind>,
    pub constraints: im::Vector<NConstraint>,
}

impl KindEnv {
    pub fn bind(&self, kids: &[KindedId], constraint: &NConstraint) -> KindEnv {
        let mut vars = self.vars.clone();
        for kid in kids {
            vars.insert(kid.id.clone(), kid.kind);
        }
        let mut constraints = self.constraints.clone();
        constraints.push_back(constraint.clone());
        KindEnv { vars, constraints }
    }
}

/// The constraint-proving capability consulted during type lowering. The real
/// implementation wraps an SMT solver; the backend only depends on this seam.
pub trait Prover {
    /// Whether `constraint` holds under `kinds`. A `false` answer means
    /// "unproven", not "disproven".
    fn prove(&self, kinds: &KindEnv, constraint: &NConstraint) -> bool;
}

/// Proves exactly the constraints that are decidable by constant folding.
/// Sufficient for whole-program tests; production callers supply an SMT-backed
/// implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstProver;

impl Prover for ConstProver {
    fn prove(&self, _kinds: &KindEnv, constraint: &NConstraint) -> bool {
        eval_constraint(constraint).unwrap_or(false)
    }
}

fn eval_nexp(nexp: &NExp) -> Option<num_bigint::BigInt> {
    match nexp {
        NExp::Constant(n) => Some(n.clone()),
        NExp::Var(_) => None,
        NExp::Add(a, b) => Some(eval_nexp(a)? + eval_nexp(b)?),
        NExp::Sub(a, b) => Some(eval_nexp(a)? - eval_nexp(b)?),
        NExp::Mul(a, b) => Some(eval_nexp(a)? * eval_nexp(b)?),
        NExp::Neg(a) => Some(-eval_nexp(a)?),
    }
}

fn eval_constraint(constraint: &NConstraint) -> Option<bool> {
    match constraint {
        NConstraint::Equal(a, b) => Some(eval_nexp(a)? == eval_nexp(b)?),
        NConstraint::NotEqual(a, b) => Some(eval_nexp(a)? != eval_nexp(b)?),
        NConstraint::Ge(a, b) => Some(eval_nexp(a)? >= eval_nexp(b)?),
        NConstraint::Gt(a, b) => Some(eval_nexp(a)? > eval_nexp(b)?),
        NConstraint::Le(a, b) => Some(eval_nexp(a)? <= eval_nexp(b)?),
        NConstraint::Lt(a, b) => Some(eval_nexp(a)? < eval_nexp(b)?),
        NConstraint::Set(_, _) => None,
        NConstraint::Or(a, b) => Some(eval_constraint(a)? || eval_constraint(b)?),
        NConstraint::And(a, b) => Some(eval_constraint(a)? && eval_constraint(b)?),
        NConstraint::True => Some(true),
        NConstraint::False => Some(false),
    }
}

/// Global type information collected from the program's definitions:
/// synonym expansion, record/variant/enum lookup, extern bindings.
#[derive(Debug, Default, Clone)]
pub struct TypeEnv {
    synonyms: HashMap<Id, Typ>,
    records: HashMap<Id, Vec<(Typ, Id)>>,
    variants: HashMap<Id, Vec<(Typ, Id)>>,
    enums: HashMap<Id, Vec<Id>>,
    /// Constructor name → owning variant.
    ctors: HashMap<Id, Id>,
    /// Enumeration member → owning enumeration.
    enum_members: HashMap<Id, Id>,
    externs: HashMap<Id, String>,
}

impl TypeEnv {
    pub fn from_program(program: &Program) -> TypeEnv {
        let mut env = TypeEnv::default();
        for def in &program.defs {
            if let Def::Type(tdef) = def {
                env.add_type_def(tdef);
            }
        }
        env
    }

    pub fn add_type_def(&mut self, tdef: &TypeDef) {
        match tdef {
            TypeDef::Record { id, fields } => {
                self.records.insert(id.clone(), fields.clone());
            }
            TypeDef::Variant { id, ctors } => {
                for (_, ctor) in ctors {
                    self.ctors.insert(ctor.clone(), id.clone());
                }
                self.variants.insert(id.clone(), ctors.clone());
            }
            TypeDef::Enum { id, members } => {
                for member in members {
                    self.enum_members.insert(member.clone(), id.clone());
                }
                self.enums.insert(id.clone(), members.clone());
            }
            TypeDef::Synonym { id, typ } => {
                self.synonyms.insert(id.clone(), typ.clone());
            }
        }
    }

    pub fn add_extern(&mut self, id: Id, c_name: impl Into<String>) {
        self.externs.insert(id, c_name.into());
    }

    pub fn synonym(&self, id: &Id) -> Option<&Typ> {
        self.synonyms.get(id)
    }

    pub fn record(&self, id: &Id) -> Option<&[(Typ, Id)]> {
        self.records.get(id).map(Vec::as_slice)
    }

    pub fn variant(&self, id: &Id) -> Option<&[(Typ, Id)]> {
        self.variants.get(id).map(Vec::as_slice)
    }

    pub fn enumeration(&self, id: &Id) -> Option<&[Id]> {
        self.enums.get(id).map(Vec::as_slice)
    }

    /// The variant a constructor belongs to, with its declared argument type.
    pub fn ctor(&self, ctor: &Id) -> Option<(&Id, &Typ)> {
        let variant = self.ctors.get(ctor)?;
        let (typ, _) = self
            .variants
            .get(variant)?
            .iter()
            .find(|(_, id)| id == ctor)?;
        Some((variant, typ))
    }

    pub fn enum_member(&self, member: &Id) -> Option<&Id> {
        self.enum_members.get(member)
    }

    pub fn extern_binding(&self, id: &Id) -> Option<&str> {
        self.externs.get(id).map(String::as_str)
    }

    /// Whether the program declared an `exception` variant; exception state
    /// is only generated when it did.
    pub fn has_exceptions(&self) -> bool {
        self.variants.contains_key(&Id::new("exception"))
    }
}

/// Everything type lowering needs: global lookups, the prover seam, and the
/// local kind environment.
#[derive(Clone)]
pub struct Ctx<'a> {
    pub env: &'a TypeEnv,
    pub prover: &'a dyn Prover,
    pub kinds: KindEnv,
}

impl<'a> Ctx<'a> {
    pub fn new(env: &'a TypeEnv, prover: &'a dyn Prover) -> Self {
        Ctx {
            env,
            prover,
            kinds: KindEnv::default(),
        }
    }

    pub fn bind_kinds(&self, kids: &[KindedId], constraint: &NConstraint) -> Ctx<'a> {
        Ctx {
            env: self.env,
            prover: self.prover,
            kinds: self.kinds.bind(kids, constraint),
        }
    }

    pub fn prove(&self, constraint: &NConstraint) -> bool {
        self.prover.prove(&self.kinds, constraint)
    }
}
