//! Concrete runtime representations chosen by type lowering.
//!
//! `CTyp` names how a value lives at runtime: a machine word, a small
//! fixed-capacity block, a heap allocation, or an aggregate of those. The
//! whole backend downstream of the type lowerer speaks `CTyp`, never `Typ`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ast::{Dir, Id};

#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub enum CTyp {
    Unit,
    Bit,
    Bool,
    String,
    Real,
    /// Enumeration with its ordered members.
    Enum(Id, Vec<Id>),
    /// Fixed-width signed integer, width ≤ 64.
    FInt(u32),
    /// Arbitrary-precision integer, heap-allocated.
    LInt,
    /// Fixed bit-vector of width ≤ 64.
    FBits(u32, Dir),
    /// Small bit-vector: capacity ≤ 64, runtime length.
    SBits(u32, Dir),
    /// Arbitrary-length bit-vector, heap-allocated.
    LBits(Dir),
    Tup(Vec<CTyp>),
    /// Named record with its ordered fields.
    Struct(Id, Vec<(Id, CTyp)>),
    /// Named tagged union with its ordered constructors.
    Variant(Id, Vec<(Id, CTyp)>),
    List(Box<CTyp>),
    Vector(Dir, Box<CTyp>),
    Ref(Box<CTyp>),
    /// A representation deferred to variant specialization.
    Poly(Id),
}

/// Named representations are nominal: two structs (or variants, or enums) are
/// the same representation exactly when their ids match, which also makes
/// recursive definitions finite to compare.
impl PartialEq for CTyp {
    fn eq(&self, other: &Self) -> bool {
        use CTyp::*;
        match (self, other) {
            (Unit, Unit) | (Bit, Bit) | (Bool, Bool) | (String, String) | (Real, Real) => true,
            (LInt, LInt) => true,
            (FInt(n), FInt(m)) => n == m,
            (FBits(n, d), FBits(m, e)) => n == m && d == e,
            (SBits(n, d), SBits(m, e)) => n == m && d == e,
            (LBits(d), LBits(e)) => d == e,
            (Enum(a, _), Enum(b, _)) => a == b,
            (Struct(a, _), Struct(b, _)) => a == b,
            (Variant(a, _), Variant(b, _)) => a == b,
            (Tup(xs), Tup(ys)) => xs == ys,
            (List(x), List(y)) => x == y,
            (Vector(d, x), Vector(e, y)) => d == e && x == y,
            (Ref(x), Ref(y)) => x == y,
            (Poly(a), Poly(b)) => a == b,
            _ => false,
        }
    }
}

impl CTyp {
    /// Whether a value of this representation can live without heap
    /// allocation.
    pub fn is_stack(&self) -> bool {
        match self {
            CTyp::Unit
            | CTyp::Bit
            | CTyp::Bool
            | CTyp::Enum(_, _)
            | CTyp::FInt(_)
            | CTyp::FBits(_, _)
            | CTyp::SBits(_, _) => true,
            CTyp::LInt | CTyp::LBits(_) | CTyp::String | CTyp::Real => false,
            CTyp::Tup(items) => items.iter().all(CTyp::is_stack),
            CTyp::Struct(_, fields) => fields.iter().all(|(_, ctyp)| ctyp.is_stack()),
            CTyp::Variant(_, _) => false,
            CTyp::List(_) | CTyp::Vector(_, _) => false,
            CTyp::Ref(_) => true,
            CTyp::Poly(_) => true,
        }
    }

    pub fn is_heap(&self) -> bool {
        !self.is_stack()
    }

    /// The least upper bound in the representation lattice: every fixed or
    /// small representation widens to its unbounded form.
    pub fn sup(&self) -> CTyp {
        match self {
            CTyp::FInt(_) => CTyp::LInt,
            CTyp::FBits(_, dir) | CTyp::SBits(_, dir) => CTyp::LBits(*dir),
            CTyp::Tup(items) => CTyp::Tup(items.iter().map(CTyp::sup).collect()),
            CTyp::List(elem) => CTyp::List(Box::new(elem.sup())),
            CTyp::Vector(dir, elem) => CTyp::Vector(*dir, Box::new(elem.sup())),
            CTyp::Ref(inner) => CTyp::Ref(Box::new(inner.sup())),
            other => other.clone(),
        }
    }

    /// True when any part of the representation is still polymorphic.
    pub fn has_poly(&self) -> bool {
        match self {
            CTyp::Poly(_) => true,
            CTyp::Tup(items) => items.iter().any(CTyp::has_poly),
            CTyp::List(elem) | CTyp::Vector(_, elem) | CTyp::Ref(elem) => elem.has_poly(),
            CTyp::Struct(_, fields) | CTyp::Variant(_, fields) => {
                fields.iter().any(|(_, ctyp)| ctyp.has_poly())
            }
            _ => false,
        }
    }

    /// Match `self` (which may contain `Poly` placeholders) against a fully
    /// concrete `actual`, producing the placeholder bindings. Returns `None`
    /// on structural mismatch or inconsistent bindings.
    pub fn unify(&self, actual: &CTyp) -> Option<HashMap<Id, CTyp>> {
        let mut unifier = HashMap::new();
        if self.unify_into(actual, &mut unifier) {
            Some(unifier)
        } else {
            None
        }
    }

    fn unify_into(&self, actual: &CTyp, unifier: &mut HashMap<Id, CTyp>) -> bool {
        match (self, actual) {
            (CTyp::Poly(kid), _) => match unifier.get(kid) {
                Some(bound) => bound == actual,
                None => {
                    unifier.insert(kid.clone(), actual.clone());
                    true
                }
            },
            (CTyp::Tup(xs), CTyp::Tup(ys)) if xs.len() == ys.len() => xs
                .iter()
                .zip(ys)
                .all(|(x, y)| x.unify_into(y, unifier)),
            (CTyp::List(x), CTyp::List(y)) => x.unify_into(y, unifier),
            (CTyp::Vector(d, x), CTyp::Vector(e, y)) if d == e => x.unify_into(y, unifier),
            (CTyp::Ref(x), CTyp::Ref(y)) => x.unify_into(y, unifier),
            (x, y) => x == y,
        }
    }

    /// Replace `Poly` placeholders by their bindings; unbound placeholders
    /// are left in place.
    pub fn subst(&self, unifier: &HashMap<Id, CTyp>) -> CTyp {
        match self {
            CTyp::Poly(kid) => unifier.get(kid).cloned().unwrap_or_else(|| self.clone()),
            CTyp::Tup(items) => CTyp::Tup(items.iter().map(|t| t.subst(unifier)).collect()),
            CTyp::List(elem) => CTyp::List(Box::new(elem.subst(unifier))),
            CTyp::Vector(dir, elem) => CTyp::Vector(*dir, Box::new(elem.subst(unifier))),
            CTyp::Ref(inner) => CTyp::Ref(Box::new(inner.subst(unifier))),
            CTyp::Struct(id, fields) => CTyp::Struct(
                id.clone(),
                fields
                    .iter()
                    .map(|(f, t)| (f.clone(), t.subst(unifier)))
                    .collect(),
            ),
            CTyp::Variant(id, ctors) => CTyp::Variant(
                id.clone(),
                ctors
                    .iter()
                    .map(|(c, t)| (c.clone(), t.subst(unifier)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Canonical spelling of the representation, used to name generated
    /// auxiliary types and specialized constructors. Injective over the
    /// representations the backend can produce.
    pub fn mangled(&self) -> String {
        match self {
            CTyp::Unit => "unit".to_string(),
            CTyp::Bit => "bit".to_string(),
            CTyp::Bool => "bool".to_string(),
            CTyp::String => "string".to_string(),
            CTyp::Real => "real".to_string(),
            CTyp::Enum(id, _) => format!("enum_{id}"),
            CTyp::FInt(n) => format!("i{n}"),
            CTyp::LInt => "i".to_string(),
            CTyp::FBits(n, dir) => format!("b{n}{}", dir_tag(*dir)),
            CTyp::SBits(cap, dir) => format!("sb{cap}{}", dir_tag(*dir)),
            CTyp::LBits(dir) => format!("b{}", dir_tag(*dir)),
            CTyp::Tup(items) => {
                let parts: Vec<_> = items.iter().map(CTyp::mangled).collect();
                format!("tup{}_{}", items.len(), parts.join("_"))
            }
            CTyp::Struct(id, _) => format!("struct_{id}"),
            CTyp::Variant(id, _) => format!("union_{id}"),
            CTyp::List(elem) => format!("list_{}", elem.mangled()),
            CTyp::Vector(dir, elem) => format!("vec{}_{}", dir_tag(*dir), elem.mangled()),
            CTyp::Ref(inner) => format!("ref_{}", inner.mangled()),
            CTyp::Poly(kid) => format!("poly_{kid}"),
        }
    }
}

fn dir_tag(dir: Dir) -> &'static str {
    match dir {
        Dir::Dec => "d",
        Dir::Inc => "i",
    }
}

impl std::fmt::Display for CTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.mangled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fbits(n: u32) -> CTyp {
        CTyp::FBits(n, Dir::Dec)
    }

    #[test]
    fn primitives_are_stack() {
        assert!(CTyp::Unit.is_stack());
        assert!(CTyp::Bit.is_stack());
        assert!(CTyp::Bool.is_stack());
        assert!(CTyp::FInt(64).is_stack());
        assert!(fbits(32).is_stack());
        assert!(CTyp::SBits(64, Dir::Dec).is_stack());
    }

    #[test]
    fn heap_representations_are_not_stack() {
        assert!(!CTyp::LInt.is_stack());
        assert!(!CTyp::LBits(Dir::Dec).is_stack());
        assert!(!CTyp::String.is_stack());
        assert!(!CTyp::Real.is_stack());
        assert!(!CTyp::List(Box::new(CTyp::FInt(64))).is_stack());
        assert!(!CTyp::Vector(Dir::Dec, Box::new(CTyp::Bool)).is_stack());
    }

    #[test]
    fn aggregates_are_stack_when_every_field_is() {
        assert!(CTyp::Tup(vec![fbits(8), CTyp::Bool]).is_stack());
        assert!(!CTyp::Tup(vec![fbits(8), CTyp::LInt]).is_stack());
        let stack_struct = CTyp::Struct(Id::new("s"), vec![(Id::new("f"), fbits(4))]);
        assert!(stack_struct.is_stack());
        let heap_struct = CTyp::Struct(Id::new("s"), vec![(Id::new("f"), CTyp::LBits(Dir::Dec))]);
        assert!(!heap_struct.is_stack());
    }

    #[test]
    fn variants_never_stack_references_always() {
        let variant = CTyp::Variant(Id::new("v"), vec![(Id::new("C"), CTyp::Unit)]);
        assert!(!variant.is_stack());
        assert!(CTyp::Ref(Box::new(CTyp::LInt)).is_stack());
        assert!(CTyp::Poly(Id::new("'a")).is_stack());
    }

    #[test]
    fn supremum_widens_fixed_forms() {
        assert_eq!(CTyp::FInt(64).sup(), CTyp::LInt);
        assert_eq!(fbits(32).sup(), CTyp::LBits(Dir::Dec));
        assert_eq!(CTyp::SBits(64, Dir::Inc).sup(), CTyp::LBits(Dir::Inc));
        assert_eq!(
            CTyp::Tup(vec![CTyp::FInt(64), CTyp::Bool]).sup(),
            CTyp::Tup(vec![CTyp::LInt, CTyp::Bool])
        );
    }

    #[test]
    fn nominal_equality_ignores_bodies() {
        let shallow = CTyp::Variant(Id::new("tree"), vec![]);
        let deep = CTyp::Variant(Id::new("tree"), vec![(Id::new("Leaf"), CTyp::LInt)]);
        assert_eq!(shallow, deep);
        assert_ne!(shallow, CTyp::Variant(Id::new("other"), vec![]));
    }

    #[test]
    fn unify_binds_poly_consistently() {
        let declared = CTyp::Tup(vec![CTyp::Poly(Id::new("'a")), CTyp::Poly(Id::new("'a"))]);
        let actual = CTyp::Tup(vec![CTyp::FInt(64), CTyp::FInt(64)]);
        let unifier = declared.unify(&actual).expect("unifies");
        assert_eq!(unifier[&Id::new("'a")], CTyp::FInt(64));

        let mismatched = CTyp::Tup(vec![CTyp::FInt(64), CTyp::LInt]);
        assert!(declared.unify(&mismatched).is_none());
    }

    #[test]
    fn mangled_spellings_distinguish_widths_and_orders() {
        assert_eq!(fbits(32).mangled(), "b32d");
        assert_eq!(CTyp::FBits(32, Dir::Inc).mangled(), "b32i");
        assert_eq!(CTyp::SBits(64, Dir::Dec).mangled(), "sb64d");
        assert_eq!(
            CTyp::Tup(vec![CTyp::LInt, fbits(1)]).mangled(),
            "tup2_i_b1d"
        );
    }
}
