//! Auto-vectorization analysis for a sea-of-nodes JIT IR.
//!
//! This crate decides whether a counted loop can be rewritten into SIMD form
//! and computes everything a code generator needs to do so safely:
//!
//! - **Address disassembly** ([`vectorize::VPointer`]): decompose a memory
//!   access into the canonical linear form `base + offset + invar + scale*iv`.
//! - **Loop analysis** ([`vectorize::VLoopAnalyzer`]): validate the loop
//!   shape, mark reduction cycles, partition memory operations into
//!   alias-disjoint slices, order the body in reverse postorder, infer vector
//!   element types, and build a memory dependence graph with fast
//!   independence queries.
//! - **Alignment solving** ([`vectorize::AlignmentSolver`]): determine which
//!   pre-loop trip counts align every main-loop vector access.
//!
//! The [`ir`] module provides the substrate the analysis runs against: an
//! arena-allocated node graph with use-def chains, a value-numbering table,
//! control/dominance oracles, and a builder for counted loops in canonical
//! shape. Code generation, unrolling and the pre-loop limit rewrite itself
//! live in the surrounding compiler, not here.

pub mod ir;
pub mod vectorize;

pub use ir::builder::LoopGraphBuilder;
pub use ir::graph::Graph;
pub use vectorize::{AlignmentSolution, AlignmentSolver, Platform, VLoop, VLoopAnalyzer, VPointer};
