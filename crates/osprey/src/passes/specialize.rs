//! Variant specialization: monomorphize polymorphic tagged-union
//! constructors by call-site usage.
//!
//! For every constructor call whose declared argument representation still
//! contains `Poly`, the unifier against the actual argument is computed,
//! promoted to suprema, and a fresh monomorphic constructor is synthesized.
//! After the pass the variant's constructor list holds only monomorphic
//! entries: the originally-monomorphic ones plus the instances actually
//! used; unused polymorphic constructors disappear.

use std::collections::HashMap;

use osprey_core::{CTyp, Error, Id, Result};

use crate::cir::{CDef, CLExp, CProgram, CTypeDef, CVal, CallTarget, Instr, NameGen};

pub fn specialize_variants(program: &mut CProgram, names: &mut NameGen) -> Result<()> {
    let mut table = SpecTable::from_program(program);
    if table.poly.is_empty() {
        return Ok(());
    }

    // Rewrite constructor calls, collecting the instances in first-use order.
    let mut defs = std::mem::take(&mut program.defs);
    for def in &mut defs {
        let instr_lists: Vec<&mut Vec<Instr>> = match def {
            CDef::Fun(cfun) => vec![&mut cfun.prologue, &mut cfun.body, &mut cfun.epilogue],
            CDef::Register(reg) => vec![&mut reg.init],
            CDef::Let(clet) => vec![&mut clet.setup],
            CDef::Type(_) => vec![],
        };
        for instrs in instr_lists {
            table.rewrite_calls(instrs, names)?;
            for instr in instrs.iter_mut() {
                instr.visit_cvals_mut(&mut |cval| table.rewrite_match_site(cval));
            }
        }
    }
    program.defs = defs;

    // Swap in the specialized constructor lists and check nothing stayed
    // polymorphic.
    for def in &mut program.defs {
        let CDef::Type(CTypeDef::Variant(id, ctors)) = def else {
            continue;
        };
        let mut rebuilt: Vec<(Id, CTyp)> = ctors
            .iter()
            .filter(|(_, ctyp)| !ctyp.has_poly())
            .cloned()
            .collect();
        rebuilt.extend(table.instances_for(id));
        for (ctor, ctyp) in &rebuilt {
            if ctyp.has_poly() {
                return Err(Error::PolymorphismLeak {
                    variant: id.clone(),
                    ctor: ctor.clone(),
                    ctyp: ctyp.to_string(),
                });
            }
        }
        *ctors = rebuilt;
    }
    Ok(())
}

struct SpecTable {
    /// Declared argument representation of each polymorphic constructor,
    /// keyed by constructor id, with its owning variant.
    poly: HashMap<Id, (Id, CTyp)>,
    /// Synthesized instances in first-use order: `(variant, new ctor,
    /// concrete representation)`.
    instances: Vec<(Id, Id, CTyp)>,
    /// Original constructor → its instances (indices into `instances`).
    by_ctor: HashMap<Id, Vec<usize>>,
}

impl SpecTable {
    fn from_program(program: &CProgram) -> SpecTable {
        let mut poly = HashMap::new();
        for def in &program.defs {
            if let CDef::Type(CTypeDef::Variant(variant, ctors)) = def {
                for (ctor, ctyp) in ctors {
                    if ctyp.has_poly() {
                        poly.insert(ctor.clone(), (variant.clone(), ctyp.clone()));
                    }
                }
            }
        }
        SpecTable {
            poly,
            instances: Vec::new(),
            by_ctor: HashMap::new(),
        }
    }

    fn instances_for(&self, variant: &Id) -> Vec<(Id, CTyp)> {
        self.instances
            .iter()
            .filter(|(v, _, _)| v == variant)
            .map(|(_, ctor, ctyp)| (ctor.clone(), ctyp.clone()))
            .collect()
    }

    /// Monomorphize one constructor application against the representation
    /// of its actual argument. Returns the new constructor id and concrete
    /// payload representation.
    fn instantiate(&mut self, ctor: &Id, actual: &CTyp) -> Result<(Id, CTyp)> {
        let (variant, declared) = self.poly.get(ctor).cloned().ok_or(Error::Invariant {
            pass: "variant specialization",
            detail: format!("no polymorphic declaration for `{ctor}`"),
        })?;
        let unifier = declared.unify(actual).ok_or(Error::Invariant {
            pass: "variant specialization",
            detail: format!(
                "constructor `{ctor}` argument {} does not match its declaration {}",
                actual, declared
            ),
        })?;
        // Promote every binding to its supremum so all instances of one
        // constructor shape agree on storage.
        let promoted: HashMap<Id, CTyp> = unifier
            .into_iter()
            .map(|(kid, ctyp)| (kid, ctyp.sup()))
            .collect();
        let concrete = declared.subst(&promoted);

        let mut keys: Vec<&Id> = promoted.keys().collect();
        keys.sort();
        let suffix: Vec<String> = keys.iter().map(|k| promoted[*k].mangled()).collect();
        let new_ctor = Id::new(format!("{ctor}_{}", suffix.join("_")));

        if !self
            .instances
            .iter()
            .any(|(_, existing, _)| existing == &new_ctor)
        {
            self.instances
                .push((variant, new_ctor.clone(), concrete.clone()));
            self.by_ctor
                .entry(ctor.clone())
                .or_default()
                .push(self.instances.len() - 1);
        }
        Ok((new_ctor, concrete))
    }

    fn rewrite_calls(&mut self, instrs: &mut Vec<Instr>, names: &mut NameGen) -> Result<()> {
        let mut i = 0;
        while i < instrs.len() {
            for sub in instrs[i].sub_instrs_mut() {
                self.rewrite_calls(sub, names)?;
            }
            let Instr::Funcall(_, CallTarget::Ctor(_, ctor), args) = &instrs[i] else {
                i += 1;
                continue;
            };
            if !self.poly.contains_key(ctor) {
                i += 1;
                continue;
            }
            let ctor = ctor.clone();
            let actual = args
                .first()
                .map(CVal::ctyp)
                .ok_or(Error::Invariant {
                    pass: "variant specialization",
                    detail: format!("constructor `{ctor}` applied to nothing"),
                })?;
            let (new_ctor, concrete) = self.instantiate(&ctor, &actual)?;

            // Cast the argument when the promoted storage differs from the
            // value at hand.
            if actual != concrete {
                let tmp = names.fresh();
                let Instr::Funcall(_, target, args) = &mut instrs[i] else {
                    continue;
                };
                *target = CallTarget::Ctor(self.poly[&ctor].0.clone(), new_ctor);
                let original = args[0].clone();
                args[0] = CVal::Id(tmp.clone(), concrete.clone());
                let setup = vec![
                    Instr::Decl(concrete.clone(), tmp.clone()),
                    Instr::Copy(CLExp::Id(tmp.clone(), concrete.clone()), original),
                ];
                let mut tail = Vec::new();
                if concrete.is_heap() {
                    tail.push(Instr::Clear(concrete, tmp));
                }
                instrs.splice(i..i, setup);
                i += 2;
                let after = i + 1;
                instrs.splice(after..after, tail);
            } else {
                let Instr::Funcall(_, target, _) = &mut instrs[i] else {
                    continue;
                };
                *target = CallTarget::Ctor(self.poly[&ctor].0.clone(), new_ctor);
            }
            i += 1;
        }
        Ok(())
    }

    /// Re-point tag tests and payload projections at the specialized
    /// constructor. Both carry the payload representation their site
    /// expects, so when a constructor has several instances the one whose
    /// storage matches the supremum of the expected representation wins —
    /// the tag test and the unwrap beside it always resolve to the same
    /// instance.
    fn rewrite_match_site(&self, cval: &mut CVal) {
        let (CVal::CtorKind(_, ctor, ctyp) | CVal::CtorUnwrap(_, ctor, ctyp)) = cval else {
            return;
        };
        if let Some(new_ctor) = self.pick_instance(ctor, ctyp) {
            if let Some((_, _, stored)) = self
                .instances
                .iter()
                .find(|(_, id, _)| id == &new_ctor)
            {
                *ctyp = stored.clone();
            }
            *ctor = new_ctor;
        }
    }

    fn pick_instance(&self, ctor: &Id, expected: &CTyp) -> Option<Id> {
        let indices = self.by_ctor.get(ctor)?;
        let wanted = expected.sup();
        for &i in indices {
            if self.instances[i].2 == wanted {
                return Some(self.instances[i].1.clone());
            }
        }
        indices
            .first()
            .map(|&i| self.instances[i].1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cir::{CFun, Name, Op, VLit};
    use osprey_core::Dir;

    /// `union tree = Leaf('a) | Node(list(tree))`, used once at `int`.
    #[test]
    fn single_use_synthesizes_one_monomorphic_ctor() {
        let tree = Id::new("tree");
        let leaf = Id::new("Leaf");
        let node = Id::new("Node");
        let variant = CTypeDef::Variant(
            tree.clone(),
            vec![
                (leaf.clone(), CTyp::Poly(Id::new("'a"))),
                (
                    node.clone(),
                    CTyp::List(Box::new(CTyp::Variant(tree.clone(), vec![]))),
                ),
            ],
        );
        let dest = CLExp::Id(Name::local("t"), CTyp::Variant(tree.clone(), vec![]));
        let call = Instr::Funcall(
            dest,
            CallTarget::Ctor(tree.clone(), leaf.clone()),
            vec![CVal::Lit(VLit::Int(3), CTyp::FInt(64))],
        );
        let mut program = CProgram {
            defs: vec![
                CDef::Type(variant),
                CDef::Fun(CFun {
                    id: Id::new("build"),
                    params: vec![],
                    ret: CTyp::Unit,
                    prologue: vec![],
                    body: vec![call],
                    epilogue: vec![],
                    end_label: "end_function_0".to_string(),
                    exc_label: None,
                }),
            ],
        };
        let mut names = NameGen::new();
        specialize_variants(&mut program, &mut names).expect("specializes");

        let ctors = program.variant_def(&tree).expect("variant survives");
        // Leaf('a) is gone; Leaf_i stores the supremum of FInt, and the
        // originally-monomorphic Node stays.
        assert_eq!(ctors.len(), 2);
        assert!(ctors.iter().any(|(id, ctyp)| {
            id.as_str() == "Leaf_i" && *ctyp == CTyp::LInt
        }));
        assert!(ctors.iter().any(|(id, _)| id == &node));
        assert!(ctors.iter().all(|(_, ctyp)| !ctyp.has_poly()));

        // The call site now targets the fresh constructor with a cast.
        let cfun = program.functions().next().expect("function");
        let funcall = cfun
            .body
            .iter()
            .find_map(|instr| match instr {
                Instr::Funcall(_, CallTarget::Ctor(_, ctor), args) => Some((ctor, args)),
                _ => None,
            })
            .expect("constructor call");
        assert_eq!(funcall.0.as_str(), "Leaf_i");
        assert_eq!(funcall.1[0].ctyp(), CTyp::LInt);
        // The cast temporary is declared, filled, and cleared around the
        // call.
        assert!(matches!(cfun.body.first(), Some(Instr::Decl(CTyp::LInt, _))));
        assert!(matches!(cfun.body.last(), Some(Instr::Clear(CTyp::LInt, _))));
    }

    /// `union box = Wrap('a)`, instantiated at both an integer and a
    /// bit-vector payload. A match site expecting the bit-vector instance
    /// must have its tag test and its unwrap re-pointed at that instance,
    /// not at whichever instance happened to be registered first.
    #[test]
    fn match_sites_distinguish_instances_of_one_constructor() {
        let box_id = Id::new("box");
        let wrap = Id::new("Wrap");
        let variant = CTypeDef::Variant(
            box_id.clone(),
            vec![(wrap.clone(), CTyp::Poly(Id::new("'a")))],
        );
        let dest = |name: &str| CLExp::Id(Name::local(name), CTyp::Variant(box_id.clone(), vec![]));
        let int_call = Instr::Funcall(
            dest("a"),
            CallTarget::Ctor(box_id.clone(), wrap.clone()),
            vec![CVal::Lit(VLit::Int(1), CTyp::FInt(64))],
        );
        let bits_call = Instr::Funcall(
            dest("b"),
            CallTarget::Ctor(box_id.clone(), wrap.clone()),
            vec![CVal::Lit(VLit::Bits(vec![false; 8]), CTyp::FBits(8, Dir::Dec))],
        );
        let scrutinee = CVal::Id(Name::local("b"), CTyp::Variant(box_id.clone(), vec![]));
        let tag_test = Instr::Jump(
            CVal::Call(
                Op::Not,
                vec![CVal::CtorKind(
                    Box::new(scrutinee.clone()),
                    wrap.clone(),
                    CTyp::FBits(8, Dir::Dec),
                )],
                CTyp::Bool,
            ),
            "case_next_7".to_string(),
        );
        let unwrap = Instr::Copy(
            CLExp::Id(Name::local("x"), CTyp::FBits(8, Dir::Dec)),
            CVal::CtorUnwrap(Box::new(scrutinee), wrap.clone(), CTyp::FBits(8, Dir::Dec)),
        );
        let mut program = CProgram {
            defs: vec![
                CDef::Type(variant),
                CDef::Fun(CFun {
                    id: Id::new("probe"),
                    params: vec![],
                    ret: CTyp::Unit,
                    prologue: vec![],
                    body: vec![int_call, bits_call, tag_test, unwrap],
                    epilogue: vec![],
                    end_label: "end_function_0".to_string(),
                    exc_label: None,
                }),
            ],
        };
        let mut names = NameGen::new();
        specialize_variants(&mut program, &mut names).expect("specializes");

        // Both instances exist, monomorphic.
        let ctors = program.variant_def(&box_id).expect("variant survives");
        assert_eq!(ctors.len(), 2);
        assert!(ctors.iter().any(|(id, ctyp)| id.as_str() == "Wrap_i" && *ctyp == CTyp::LInt));
        assert!(ctors
            .iter()
            .any(|(id, ctyp)| id.as_str() == "Wrap_bd" && *ctyp == CTyp::LBits(Dir::Dec)));

        // The match site resolved both the tag test and the unwrap to the
        // bit-vector instance, even though the integer one registered first.
        let cfun = program.functions().next().expect("function");
        let mut kind_ctor = None;
        let mut unwrap_ctor = None;
        for instr in &cfun.body {
            let mut instr = instr.clone();
            instr.visit_cvals_mut(&mut |cval| match cval {
                CVal::CtorKind(_, ctor, _) => kind_ctor = Some(ctor.clone()),
                CVal::CtorUnwrap(_, ctor, ctyp) => {
                    unwrap_ctor = Some((ctor.clone(), ctyp.clone()))
                }
                _ => {}
            });
        }
        assert_eq!(kind_ctor.expect("tag test survives").as_str(), "Wrap_bd");
        let (unwrap_ctor, stored) = unwrap_ctor.expect("unwrap survives");
        assert_eq!(unwrap_ctor.as_str(), "Wrap_bd");
        assert_eq!(stored, CTyp::LBits(Dir::Dec));
    }

    #[test]
    fn unused_polymorphic_ctor_is_dropped() {
        let opt = Id::new("option");
        let variant = CTypeDef::Variant(
            opt.clone(),
            vec![
                (Id::new("Some"), CTyp::Poly(Id::new("'a"))),
                (Id::new("None"), CTyp::Unit),
            ],
        );
        let mut program = CProgram {
            defs: vec![CDef::Type(variant)],
        };
        let mut names = NameGen::new();
        specialize_variants(&mut program, &mut names).expect("specializes");
        let ctors = program.variant_def(&opt).expect("variant survives");
        assert_eq!(ctors.len(), 1);
        assert_eq!(ctors[0].0.as_str(), "None");
    }
}
