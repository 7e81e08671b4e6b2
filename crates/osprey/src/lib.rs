//! Backend lowering pipeline of the osprey compiler: translate the typed
//! source IR into the linear target IR, run the rewrite passes, and emit a C
//! translation unit.
//!
//! Pass order is fixed: per function, normalization, primitive analysis
//! (optional), IR compilation, and return rewriting; then program-wide
//! unique-names, the alias peepholes (optional), variant specialization,
//! allocation hoisting (optional, after unique-names), type-definition
//! sorting, and last of all emission.

#![deny(clippy::unwrap_used)]

pub mod anf;
pub mod cir;
pub mod compile;
pub mod config;
pub mod emit;
pub mod passes;
pub mod primops;
pub mod zencode;

use osprey_core::{Ctx, Program, Prover, Result, TypeEnv};

use cir::{CProgram, NameGen};
use compile::Signatures;
pub use config::CodegenConfig;

/// Run the pipeline up to (but not including) emission, returning the
/// rewritten target IR and the lowered signatures. The returned program is
/// serializable, so tooling and tests can inspect it structurally.
pub fn compile_ir(
    program: &Program,
    env: &TypeEnv,
    prover: &dyn Prover,
    cfg: &CodegenConfig,
) -> Result<(CProgram, Signatures)> {
    let ctx = Ctx::new(env, prover);
    let mut names = NameGen::new();
    let (mut cprog, sigs) = compile::compile_program(program, &ctx, cfg, &mut names)?;

    for cfun in cprog.functions_mut() {
        passes::returns::fix_returns(cfun, &mut names)?;
    }
    // Unique names are a correctness requirement of emission (sibling scopes
    // flatten into one C scope), not an optimization.
    for cfun in cprog.functions_mut() {
        passes::alias::unique_names(cfun, &mut names);
    }
    if cfg.optimize_alias {
        for cfun in cprog.functions_mut() {
            passes::alias::remove_alias(cfun);
            passes::alias::combine_variables(cfun);
        }
    }
    passes::specialize::specialize_variants(&mut cprog, &mut names)?;
    if cfg.optimize_hoist_allocations {
        passes::hoist::hoist_allocations(&mut cprog, &mut names);
        if cfg.optimize_experimental {
            for cfun in cprog.functions_mut() {
                passes::alias::hoist_alias(cfun);
            }
        }
    }
    passes::toposort::sort_type_defs(&mut cprog)?;
    Ok((cprog, sigs))
}

/// Full pipeline: compile, rewrite, and emit one C translation unit.
pub fn codegen(
    program: &Program,
    env: &TypeEnv,
    prover: &dyn Prover,
    cfg: &CodegenConfig,
) -> Result<String> {
    let (cprog, sigs) = compile_ir(program, env, prover, cfg)?;
    Ok(emit::emit_program(&cprog, &sigs, cfg, env.has_exceptions()))
}

/// Emit into a caller-provided sink.
pub fn codegen_to<W: std::io::Write>(
    program: &Program,
    env: &TypeEnv,
    prover: &dyn Prover,
    cfg: &CodegenConfig,
    sink: &mut W,
) -> Result<()> {
    let text = codegen(program, env, prover, cfg)?;
    sink.write_all(text.as_bytes())?;
    Ok(())
}
