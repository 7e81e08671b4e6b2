//! Allocation hoisting: move heap-represented locals of non-recursive
//! functions to the function prologue/epilogue, replacing in-body declares
//! with resets of the already-allocated slot.
//!
//! Recursive functions are skipped: a hoisted slot would be shared across
//! activations.

use std::collections::{HashMap, HashSet};

use osprey_core::{CTyp, Id};

use crate::cir::{CFun, CProgram, CallTarget, Instr, Name, NameGen};

pub fn hoist_allocations(program: &mut CProgram, names: &mut NameGen) {
    let recursive = recursive_functions(program);
    for cfun in program.functions_mut() {
        if !recursive.contains(&cfun.id) {
            hoist_fun(cfun, names);
        }
    }
}

/// Functions that can reach themselves through the call graph, directly or
/// mutually.
fn recursive_functions(program: &CProgram) -> HashSet<Id> {
    let mut callees: HashMap<Id, HashSet<Id>> = HashMap::new();
    for cfun in program.functions() {
        let mut out = HashSet::new();
        collect_calls(&cfun.body, &mut out);
        callees.insert(cfun.id.clone(), out);
    }

    let mut recursive = HashSet::new();
    for id in callees.keys() {
        // Iterative reachability from this function's callees.
        let mut stack: Vec<&Id> = callees[id].iter().collect();
        let mut visited: HashSet<&Id> = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == id {
                recursive.insert(id.clone());
                break;
            }
            if !visited.insert(next) {
                continue;
            }
            if let Some(further) = callees.get(next) {
                stack.extend(further);
            }
        }
    }
    recursive
}

fn collect_calls(instrs: &[Instr], out: &mut HashSet<Id>) {
    for instr in instrs {
        if let Instr::Funcall(_, CallTarget::Fn(id), _) = instr {
            out.insert(id.clone());
        }
        for sub in instr.sub_instrs() {
            collect_calls(sub, out);
        }
    }
}

fn hoist_fun(cfun: &mut CFun, names: &mut NameGen) {
    let mut prologue = Vec::new();
    let mut epilogue = Vec::new();
    hoist_list(&mut cfun.body, names, &mut prologue, &mut epilogue);
    cfun.prologue.extend(prologue);
    cfun.epilogue.extend(epilogue);
}

fn hoist_list(
    instrs: &mut Vec<Instr>,
    names: &mut NameGen,
    prologue: &mut Vec<Instr>,
    epilogue: &mut Vec<Instr>,
) {
    let mut i = 0;
    while i < instrs.len() {
        let hoistable = match &instrs[i] {
            Instr::Decl(ctyp, name) | Instr::Init(ctyp, name, _) if ctyp.is_heap() => {
                Some((ctyp.clone(), name.clone()))
            }
            _ => None,
        };
        let Some((ctyp, name)) = hoistable else {
            for sub in instrs[i].sub_instrs_mut() {
                hoist_list(sub, names, prologue, epilogue);
            }
            i += 1;
            continue;
        };

        // The slot keeps living across the whole function, so it gets a name
        // of its own.
        let hoisted = names.renumber(&name);
        prologue.push(Instr::Decl(ctyp.clone(), hoisted.clone()));
        epilogue.push(Instr::Clear(ctyp.clone(), hoisted.clone()));
        instrs[i] = match std::mem::replace(&mut instrs[i], Instr::Comment(String::new())) {
            Instr::Decl(ctyp, _) => Instr::Reset(ctyp, hoisted.clone()),
            Instr::Init(ctyp, _, cval) => Instr::Reinit(ctyp, hoisted.clone(), cval),
            other => other,
        };
        for instr in &mut instrs[i + 1..] {
            instr.rename(&name, &hoisted);
        }
        remove_clears(instrs, i + 1, &ctyp, &hoisted);
        i += 1;
    }
}

/// Drop every in-body clear of the hoisted slot; the single epilogue clear
/// covers all exit paths.
fn remove_clears(instrs: &mut Vec<Instr>, from: usize, ctyp: &CTyp, name: &Name) {
    let mut i = from;
    while i < instrs.len() {
        if matches!(&instrs[i], Instr::Clear(c, n) if c == ctyp && n == name) {
            instrs.remove(i);
            continue;
        }
        for sub in instrs[i].sub_instrs_mut() {
            remove_clears(sub, 0, ctyp, name);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cir::{CDef, CLExp, CVal, Name};
    use osprey_core::CTyp;

    fn call(caller_dest: &str, callee: &str) -> Instr {
        Instr::Funcall(
            CLExp::Id(Name::local(caller_dest), CTyp::Unit),
            CallTarget::Fn(Id::new(callee)),
            vec![],
        )
    }

    fn fun(name: &str, body: Vec<Instr>) -> CFun {
        CFun {
            id: Id::new(name),
            params: vec![],
            ret: CTyp::Unit,
            prologue: vec![],
            body,
            epilogue: vec![],
            end_label: "end_function_0".to_string(),
            exc_label: None,
        }
    }

    #[test]
    fn mutual_recursion_is_detected_and_skipped() {
        let mut program = CProgram {
            defs: vec![
                CDef::Fun(fun(
                    "even",
                    vec![Instr::Decl(CTyp::LInt, Name::local("t")), call("u", "odd")],
                )),
                CDef::Fun(fun("odd", vec![call("u", "even")])),
                CDef::Fun(fun(
                    "plain",
                    vec![
                        Instr::Decl(CTyp::LInt, Name::local("a")),
                        Instr::Clear(CTyp::LInt, Name::local("a")),
                        Instr::Decl(CTyp::LInt, Name::local("b")),
                        Instr::Clear(CTyp::LInt, Name::local("b")),
                    ],
                )),
            ],
        };
        let mut names = NameGen::new();
        hoist_allocations(&mut program, &mut names);

        let funs: Vec<&CFun> = program.functions().collect();
        // Both members of the cycle keep their declares in place.
        assert!(funs[0].prologue.is_empty());
        assert!(matches!(funs[0].body[0], Instr::Decl(_, _)));
        assert!(funs[1].prologue.is_empty());
        // The plain function gets two prologue creates, two epilogue kills,
        // and resets in the body.
        assert_eq!(funs[2].prologue.len(), 2);
        assert_eq!(funs[2].epilogue.len(), 2);
        assert!(funs[2]
            .body
            .iter()
            .all(|instr| matches!(instr, Instr::Reset(_, _))));
    }

    #[test]
    fn initializers_become_reinits() {
        let mut program = CProgram {
            defs: vec![CDef::Fun(fun(
                "f",
                vec![
                    Instr::Init(
                        CTyp::LInt,
                        Name::local("n"),
                        CVal::Lit(crate::cir::VLit::Int(5), CTyp::LInt),
                    ),
                    Instr::Clear(CTyp::LInt, Name::local("n")),
                ],
            ))],
        };
        let mut names = NameGen::new();
        hoist_allocations(&mut program, &mut names);
        let cfun = program.functions().next().expect("one function");
        assert!(matches!(cfun.body[0], Instr::Reinit(_, _, _)));
        assert!(cfun.body.len() == 1);
    }
}
