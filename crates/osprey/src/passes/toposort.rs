//! Order generated type definitions so every representation a definition
//! embeds by value has already been declared. Dependencies through a heap
//! indirection (lists, vectors, references) resolve with a forward
//! declaration instead, so self-recursion through them is allowed; any other
//! cycle is a fatal input error.

use std::collections::{HashMap, HashSet};

use osprey_core::{CTyp, Error, Id, Result};

use crate::cir::{CDef, CProgram, CTypeDef};

pub fn sort_type_defs(program: &mut CProgram) -> Result<()> {
    let type_defs: Vec<CTypeDef> = program
        .defs
        .iter()
        .filter_map(|def| match def {
            CDef::Type(tdef) => Some(tdef.clone()),
            _ => None,
        })
        .collect();
    if type_defs.is_empty() {
        return Ok(());
    }

    let declared: HashSet<Id> = type_defs.iter().map(|t| t.id().clone()).collect();
    let mut deps: HashMap<Id, Vec<Id>> = HashMap::new();
    for tdef in &type_defs {
        let mut used = Vec::new();
        match tdef {
            CTypeDef::Enum(_, _) => {}
            CTypeDef::Struct(_, fields) | CTypeDef::Variant(_, fields) => {
                for (_, ctyp) in fields {
                    collect_value_deps(ctyp, &mut used);
                }
            }
        }
        used.retain(|id| declared.contains(id) && id != tdef.id());
        deps.insert(tdef.id().clone(), used);
    }

    // Kahn's algorithm with insertion order breaking ties.
    let mut remaining: Vec<CTypeDef> = type_defs;
    let mut emitted: HashSet<Id> = HashSet::new();
    let mut sorted: Vec<CTypeDef> = Vec::new();
    while !remaining.is_empty() {
        let ready = remaining.iter().position(|tdef| {
            deps[tdef.id()]
                .iter()
                .all(|dep| emitted.contains(dep))
        });
        match ready {
            Some(index) => {
                let tdef = remaining.remove(index);
                emitted.insert(tdef.id().clone());
                sorted.push(tdef);
            }
            None => {
                // Every remaining definition waits on another one.
                let id = remaining[0].id().clone();
                return Err(Error::TypeCycle { id });
            }
        }
    }

    let mut sorted = sorted.into_iter();
    for def in &mut program.defs {
        if matches!(def, CDef::Type(_)) {
            if let Some(next) = sorted.next() {
                *def = CDef::Type(next);
            }
        }
    }
    Ok(())
}

/// Named types embedded by value. A `List`, `Vector`, or `Ref` boundary
/// stops the walk: those fields are pointers in the generated code.
fn collect_value_deps(ctyp: &CTyp, out: &mut Vec<Id>) {
    match ctyp {
        CTyp::Enum(id, _) | CTyp::Struct(id, _) | CTyp::Variant(id, _) => out.push(id.clone()),
        CTyp::Tup(items) => {
            for item in items {
                collect_value_deps(item, out);
            }
        }
        CTyp::List(_) | CTyp::Vector(_, _) | CTyp::Ref(_) => {}
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant_of(name: &str, fields: Vec<(&str, CTyp)>) -> CTypeDef {
        CTypeDef::Variant(
            Id::new(name),
            fields
                .into_iter()
                .map(|(ctor, ctyp)| (Id::new(ctor), ctyp))
                .collect(),
        )
    }

    fn order(program: &CProgram) -> Vec<String> {
        program
            .defs
            .iter()
            .filter_map(|def| match def {
                CDef::Type(tdef) => Some(tdef.id().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn uses_come_before_users() {
        let inner = CTypeDef::Struct(Id::new("inner"), vec![(Id::new("n"), CTyp::FInt(64))]);
        let outer = CTypeDef::Struct(
            Id::new("outer"),
            vec![(Id::new("i"), CTyp::Struct(Id::new("inner"), vec![]))],
        );
        // Deliberately out of order.
        let mut program = CProgram {
            defs: vec![CDef::Type(outer), CDef::Type(inner)],
        };
        sort_type_defs(&mut program).expect("sorts");
        assert_eq!(order(&program), vec!["inner", "outer"]);
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let a = CTypeDef::Enum(Id::new("a"), vec![Id::new("A")]);
        let b = CTypeDef::Enum(Id::new("b"), vec![Id::new("B")]);
        let mut program = CProgram {
            defs: vec![CDef::Type(a), CDef::Type(b)],
        };
        sort_type_defs(&mut program).expect("sorts");
        assert_eq!(order(&program), vec!["a", "b"]);
    }

    #[test]
    fn self_recursion_through_a_list_is_fine() {
        let tree = variant_of(
            "tree",
            vec![
                ("Leaf", CTyp::LInt),
                ("Node", CTyp::List(Box::new(CTyp::Variant(Id::new("tree"), vec![])))),
            ],
        );
        let mut program = CProgram {
            defs: vec![CDef::Type(tree)],
        };
        assert!(sort_type_defs(&mut program).is_ok());
    }

    #[test]
    fn value_cycles_are_fatal() {
        let a = variant_of("a", vec![("MkA", CTyp::Variant(Id::new("b"), vec![]))]);
        let b = variant_of("b", vec![("MkB", CTyp::Variant(Id::new("a"), vec![]))]);
        let mut program = CProgram {
            defs: vec![CDef::Type(a), CDef::Type(b)],
        };
        assert!(matches!(
            sort_type_defs(&mut program),
            Err(Error::TypeCycle { .. })
        ));
    }
}
