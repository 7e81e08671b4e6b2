//! Rewrite passes over the target IR, applied between the IR compiler and
//! the emitter. Ordering matters: return rewriting runs per function right
//! after compilation, unique-names precedes hoisting, variant specialization
//! and type sorting precede emission.

pub mod alias;
pub mod hoist;
pub mod returns;
pub mod specialize;
pub mod toposort;
