//! Early-return rewriting: every assignment to the return slot becomes an
//! assignment to a single named slot (stack returns) or a copy through the
//! caller-provided pointer (heap returns); the unique function-exit label is
//! placed once at the end of the body, with the final return (or plain exit,
//! for heap returns) after it.

use osprey_core::{CTyp, Error, Result};

use crate::cir::{CFun, CLExp, CVal, CallTarget, Instr, Name, NameGen};
use crate::compile::EARLY_RETURN;

pub fn fix_returns(cfun: &mut CFun, names: &mut NameGen) -> Result<()> {
    let end_label = cfun.end_label.clone();
    if cfun.heap_return() {
        rewrite(&mut cfun.body, &heap_slot(&cfun.ret))?;
        cfun.body.push(Instr::Label(end_label));
        cfun.body.push(Instr::End);
    } else {
        let slot = names.fresh();
        rewrite(&mut cfun.body, &CLExp::Id(slot.clone(), cfun.ret.clone()))?;
        cfun.body
            .insert(0, Instr::Decl(cfun.ret.clone(), slot.clone()));
        cfun.body.push(Instr::Label(end_label));
        cfun.body.push(Instr::Return(CVal::Id(slot, cfun.ret.clone())));
    }
    // The exception exit block sits past the normal return; its End returns a
    // poison value nobody reads because the exception flag is set.
    if let Some(exc) = cfun.exc_label.clone() {
        cfun.body.push(Instr::Label(exc));
        cfun.body.push(Instr::End);
    }
    Ok(())
}

/// The destination heap-returning functions write through: the caller's
/// pointer, addressed via the return name so the emitter can spell it.
fn heap_slot(ret: &CTyp) -> CLExp {
    CLExp::Deref(Box::new(CLExp::Id(
        Name::Return,
        CTyp::Ref(Box::new(ret.clone())),
    )))
}

/// Descend through blocks, conditionals, early-return markers, calls into
/// the return slot, and direct copies to it. Everything else passes through
/// unchanged; a malformed marker is a backend bug.
fn rewrite(instrs: &mut Vec<Instr>, slot: &CLExp) -> Result<()> {
    for instr in instrs {
        match instr {
            Instr::Funcall(dest, CallTarget::Extern(name), args) if name == EARLY_RETURN => {
                if !matches!(dest, CLExp::Id(Name::Return, _)) {
                    return Err(Error::Invariant {
                        pass: "return rewriting",
                        detail: "early return into something other than the return slot"
                            .to_string(),
                    });
                }
                let value = args.pop().ok_or(Error::Invariant {
                    pass: "return rewriting",
                    detail: "early return without a value".to_string(),
                })?;
                *instr = Instr::Copy(slot.clone(), value);
            }
            Instr::Copy(dest, _) | Instr::Funcall(dest, _, _) if dest.root() == &Name::Return => {
                reroot(dest, slot);
            }
            other => {
                for sub in other.sub_instrs_mut() {
                    rewrite(sub, slot)?;
                }
            }
        }
    }
    Ok(())
}

/// Substitute the return-slot root of a left-value.
fn reroot(clexp: &mut CLExp, slot: &CLExp) {
    match clexp {
        CLExp::Id(Name::Return, _) => *clexp = slot.clone(),
        CLExp::Id(_, _) => {}
        CLExp::Field(inner, _, _) | CLExp::Tuple(inner, _, _) | CLExp::Deref(inner) => {
            reroot(inner, slot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cir::VLit;
    use osprey_core::{Dir, Id};

    fn fbits8() -> CTyp {
        CTyp::FBits(8, Dir::Dec)
    }

    fn stack_fun(body: Vec<Instr>) -> CFun {
        CFun {
            id: Id::new("f"),
            params: vec![],
            ret: fbits8(),
            prologue: vec![],
            body,
            epilogue: vec![],
            end_label: "end_function_9".to_string(),
            exc_label: None,
        }
    }

    #[test]
    fn stack_returns_share_one_exit() {
        let ret_dest = CLExp::Id(Name::Return, fbits8());
        // An early return inside a branch, as the IR compiler produces it:
        // marker call followed by the jump to the end label.
        let early = vec![
            Instr::Funcall(
                ret_dest.clone(),
                CallTarget::Extern(EARLY_RETURN.to_string()),
                vec![CVal::Lit(VLit::Int(1), fbits8())],
            ),
            Instr::Goto("end_function_9".to_string()),
        ];
        let terminal = Instr::Copy(ret_dest, CVal::Lit(VLit::Int(2), fbits8()));
        let mut cfun = stack_fun(vec![
            Instr::If(CVal::bool(true), early, vec![], CTyp::Unit),
            terminal,
        ]);
        let mut names = NameGen::new();
        fix_returns(&mut cfun, &mut names).expect("rewrites");

        // One declared slot up front, one exit label, one return.
        let Some(Instr::Decl(_, slot)) = cfun.body.first() else {
            panic!("expected slot declaration first");
        };
        let slot = slot.clone();
        let labels = cfun
            .body
            .iter()
            .filter(|i| matches!(i, Instr::Label(_)))
            .count();
        assert_eq!(labels, 1);
        assert!(matches!(cfun.body.last(), Some(Instr::Return(CVal::Id(name, _))) if *name == slot));
        // No assignment to the raw return slot survives, and the early
        // marker became a slot assignment.
        fn no_raw_return(instrs: &[Instr]) {
            for instr in instrs {
                if let Instr::Copy(dest, _) | Instr::Funcall(dest, _, _) = instr {
                    assert_ne!(dest.root(), &Name::Return);
                }
                for sub in instr.sub_instrs() {
                    no_raw_return(sub);
                }
            }
        }
        no_raw_return(&cfun.body);
        let Instr::If(_, then_instrs, _, _) = &cfun.body[1] else {
            panic!("expected branch");
        };
        assert!(matches!(&then_instrs[0], Instr::Copy(dest, _) if dest.root() == &slot));
        assert!(matches!(&then_instrs[1], Instr::Goto(label) if label == "end_function_9"));
    }

    #[test]
    fn heap_returns_copy_through_the_pointer() {
        let ret = CTyp::LInt;
        let mut cfun = CFun {
            id: Id::new("g"),
            params: vec![],
            ret: ret.clone(),
            prologue: vec![],
            body: vec![Instr::Copy(
                CLExp::Id(Name::Return, ret.clone()),
                CVal::Id(Name::local("x"), ret.clone()),
            )],
            epilogue: vec![],
            end_label: "end_function_3".to_string(),
            exc_label: None,
        };
        let mut names = NameGen::new();
        fix_returns(&mut cfun, &mut names).expect("rewrites");
        let Instr::Copy(dest, _) = &cfun.body[0] else {
            panic!("expected copy");
        };
        assert!(matches!(dest, CLExp::Deref(_)));
        assert!(matches!(cfun.body.last(), Some(Instr::End)));
    }

    #[test]
    fn misdirected_early_return_is_a_bug() {
        let mut cfun = stack_fun(vec![Instr::Funcall(
            CLExp::Id(Name::local("x"), fbits8()),
            CallTarget::Extern(EARLY_RETURN.to_string()),
            vec![CVal::Lit(VLit::Int(1), fbits8())],
        )]);
        let mut names = NameGen::new();
        assert!(matches!(
            fix_returns(&mut cfun, &mut names),
            Err(Error::Invariant { .. })
        ));
    }
}
