//! Small peephole passes over the linear instruction stream: renaming
//! duplicate declarations, removing working-copy aliases, and combining
//! variables that only forward their value.
//!
//! Every pass is conservative. If liveness over the bracketed window cannot
//! be shown from straight-line structure alone (a label or goto crosses it),
//! the pattern is declined.

use std::collections::HashSet;

use osprey_core::CTyp;

use crate::cir::{CFun, CLExp, CVal, Instr, Name, NameGen};

/// Give a fresh identifier to each declaration whose name was already
/// declared earlier in the same function.
pub fn unique_names(cfun: &mut CFun, names: &mut NameGen) {
    let mut seen: HashSet<Name> = cfun
        .params
        .iter()
        .map(|(id, _)| Name::Id(id.clone(), 0))
        .collect();
    uniquify(&mut cfun.body, &mut seen, names);
}

fn decl_name(instr: &mut Instr) -> Option<&mut Name> {
    match instr {
        Instr::Decl(_, name)
        | Instr::Init(_, name, _)
        | Instr::Reset(_, name)
        | Instr::Reinit(_, name, _)
        | Instr::Alias(_, name, _) => Some(name),
        _ => None,
    }
}

fn uniquify(instrs: &mut [Instr], seen: &mut HashSet<Name>, names: &mut NameGen) {
    for i in 0..instrs.len() {
        let (head, tail) = instrs.split_at_mut(i + 1);
        if let Some(name) = decl_name(&mut head[i]) {
            if seen.contains(name) {
                let old = name.clone();
                let fresh = names.renumber(&old);
                *name = fresh.clone();
                seen.insert(fresh.clone());
                for instr in tail.iter_mut() {
                    instr.rename(&old, &fresh);
                }
            } else {
                seen.insert(name.clone());
            }
        }
        for sub in instrs[i].sub_instrs_mut() {
            uniquify(sub, seen, names);
        }
    }
}

/// `create x; x = y; … [x mutated, y untouched]; y = x; kill x`
/// becomes direct mutation of `y`.
pub fn remove_alias(cfun: &mut CFun) {
    remove_alias_list(&mut cfun.body);
}

fn remove_alias_list(instrs: &mut Vec<Instr>) {
    while remove_alias_once(instrs) {}
    for instr in instrs {
        for sub in instr.sub_instrs_mut() {
            remove_alias_list(sub);
        }
    }
}

fn remove_alias_once(instrs: &mut Vec<Instr>) -> bool {
    for d in 0..instrs.len() {
        let Instr::Decl(_, x) = &instrs[d] else {
            continue;
        };
        let x = x.clone();
        // First use must be `x = y`.
        let Some(a) = next_mention(instrs, d + 1, &x) else {
            continue;
        };
        let Instr::Copy(CLExp::Id(dst, _), CVal::Id(y, _)) = &instrs[a] else {
            continue;
        };
        if dst != &x || y == &x {
            continue;
        }
        let y = y.clone();
        // Last uses must be `y = x; … kill x`.
        let Some(b) = find_copy_back(instrs, a + 1, &y, &x) else {
            continue;
        };
        let Some(k) = next_mention(instrs, b + 1, &x) else {
            continue;
        };
        if !matches!(&instrs[k], Instr::Clear(_, name) if name == &x) {
            continue;
        }
        if next_mention(instrs, k + 1, &x).is_some() {
            continue;
        }
        // In between, y must be untouched and control flow must stay local.
        let window = &instrs[a + 1..b];
        if window_has_flow(window) || window.iter().any(|instr| instr.mentions(&y)) {
            continue;
        }
        instrs.remove(k);
        instrs.remove(b);
        for instr in &mut instrs[a + 1..b] {
            instr.rename(&x, &y);
        }
        instrs.remove(a);
        instrs.remove(d);
        return true;
    }
    false
}

/// `create x; create y; … [y mutated, x untouched]; x = y; kill y`
/// folds `y` into `x`.
pub fn combine_variables(cfun: &mut CFun) {
    combine_list(&mut cfun.body);
}

fn combine_list(instrs: &mut Vec<Instr>) {
    while combine_once(instrs) {}
    for instr in instrs {
        for sub in instr.sub_instrs_mut() {
            combine_list(sub);
        }
    }
}

fn combine_once(instrs: &mut Vec<Instr>) -> bool {
    for j in 0..instrs.len() {
        let Instr::Decl(_, y) = &instrs[j] else {
            continue;
        };
        let y = y.clone();
        // Find the forwarding copy `x = y` followed by `kill y`.
        let Some(b) = find_forwarding_copy(instrs, j + 1, &y) else {
            continue;
        };
        let Instr::Copy(CLExp::Id(x, _), CVal::Id(_, _)) = &instrs[b] else {
            continue;
        };
        let x = x.clone();
        if x == y {
            continue;
        }
        let Some(k) = next_mention(instrs, b + 1, &y) else {
            continue;
        };
        if !matches!(&instrs[k], Instr::Clear(_, name) if name == &y) {
            continue;
        }
        if next_mention(instrs, k + 1, &y).is_some() {
            continue;
        }
        // x must be untouched while y is being built.
        let window = &instrs[j + 1..b];
        if window_has_flow(window) || window.iter().any(|instr| instr.mentions(&x)) {
            continue;
        }
        instrs.remove(k);
        instrs.remove(b);
        for instr in &mut instrs[j + 1..b] {
            instr.rename(&y, &x);
        }
        instrs.remove(j);
        return true;
    }
    false
}

/// Experimental: after `reset x` of a struct-represented local, if the next
/// use of `x` is `y = x` and `x` is never referenced afterwards, the copy
/// becomes an alias (plain assignment, no deep copy).
pub fn hoist_alias(cfun: &mut CFun) {
    hoist_alias_list(&mut cfun.body);
}

fn hoist_alias_list(instrs: &mut Vec<Instr>) {
    for i in 0..instrs.len() {
        let Instr::Reset(ctyp @ CTyp::Struct(_, _), x) = &instrs[i] else {
            for sub in instrs[i].sub_instrs_mut() {
                hoist_alias_list(sub);
            }
            continue;
        };
        let (ctyp, x) = (ctyp.clone(), x.clone());
        let Some(u) = next_mention(instrs, i + 1, &x) else {
            continue;
        };
        let Instr::Copy(CLExp::Id(y, _), CVal::Id(src, _)) = &instrs[u] else {
            continue;
        };
        if src != &x {
            continue;
        }
        if next_mention(instrs, u + 1, &x).is_some() {
            continue;
        }
        let y = y.clone();
        instrs[u] = Instr::Alias(ctyp.clone(), y, CVal::Id(x, ctyp));
    }
}

// ── Window scanning ──────────────────────────────────────────────────────────

fn next_mention(instrs: &[Instr], from: usize, name: &Name) -> Option<usize> {
    (from..instrs.len()).find(|&i| instrs[i].mentions(name))
}

/// The first `y = x` copy at or after `from`, with every intermediate
/// mention of `x` allowed (x is the mutated working copy).
fn find_copy_back(instrs: &[Instr], from: usize, y: &Name, x: &Name) -> Option<usize> {
    (from..instrs.len()).find(|&i| {
        matches!(&instrs[i], Instr::Copy(CLExp::Id(dst, _), CVal::Id(src, _))
            if dst == y && src == x)
    })
}

/// The first `_ = y` forwarding copy after `from`.
fn find_forwarding_copy(instrs: &[Instr], from: usize, y: &Name) -> Option<usize> {
    (from..instrs.len()).find(|&i| {
        matches!(&instrs[i], Instr::Copy(CLExp::Id(_, _), CVal::Id(src, _)) if src == y)
    })
}

/// Labels and gotos make straight-line liveness reasoning unsound.
fn window_has_flow(window: &[Instr]) -> bool {
    window.iter().any(has_flow)
}

fn has_flow(instr: &Instr) -> bool {
    match instr {
        Instr::Label(_) | Instr::Goto(_) | Instr::Jump(_, _) => true,
        other => other.sub_instrs().iter().any(|sub| sub.iter().any(has_flow)),
    }
}
