//! Auto-vectorization analysis.
//!
//! One loop at a time, the analysis decides whether a counted loop can be
//! turned into SIMD form and computes what the code generator needs:
//!
//! 1. **Preconditions** (`vloop`): loop shape gatekeeping
//! 2. **Reductions** (`reduction`): reduction cycles through header phis
//! 3. **Memory slices** (`slices`): alias-disjoint store chains
//! 4. **Body** (`body`): reverse-postorder node list
//! 5. **Element types** (`velt`): narrowest safe vector element type per node
//! 6. **Dependence graph** (`dependence`): memory/data DAG with O(V+E)
//!    independence queries
//!
//! `vpointer` decomposes addresses into `base + offset + invar + scale*iv`;
//! `alignment` turns one decomposed reference plus the loop strides into the
//! set of pre-loop trip counts that aligns every main-loop access. The
//! `analyzer` module chains steps 1-6 into a single pass.

pub mod alignment;
pub mod analyzer;
pub mod body;
pub mod dependence;
pub mod reduction;
pub mod slices;
pub mod velt;
pub mod vloop;
pub mod vpointer;

pub use alignment::{AlignmentSolution, AlignmentSolver};
pub use analyzer::{AnalyzeFailure, VLoopAnalyzer};
pub use body::{BodyFailure, VLoopBody};
pub use dependence::VLoopDependenceGraph;
pub use reduction::VLoopReductions;
pub use slices::VLoopMemorySlices;
pub use velt::VLoopTypes;
pub use vloop::{PreconditionFailure, VLoop};
pub use vpointer::{PointerCmp, VPointer};

use crate::ir::types::ValueType;

// =============================================================================
// Platform capabilities
// =============================================================================

/// SIMD capabilities of the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Widest vector register in bytes. Must be a power of two >= 2 for
    /// vectorization to proceed.
    pub vector_width_in_bytes: i32,
    /// Guaranteed alignment of object base addresses.
    pub object_alignment_in_bytes: i32,
    /// Target tolerates misaligned vector accesses, which permits analyzing
    /// unsafe (baseless) references.
    pub misaligned_vectors_ok: bool,
}

impl Platform {
    /// 128-bit vectors.
    pub const fn sse42() -> Self {
        Platform {
            vector_width_in_bytes: 16,
            object_alignment_in_bytes: 8,
            misaligned_vectors_ok: true,
        }
    }

    /// 256-bit vectors.
    pub const fn avx2() -> Self {
        Platform {
            vector_width_in_bytes: 32,
            object_alignment_in_bytes: 8,
            misaligned_vectors_ok: true,
        }
    }

    /// 512-bit vectors.
    pub const fn avx512() -> Self {
        Platform {
            vector_width_in_bytes: 64,
            object_alignment_in_bytes: 8,
            misaligned_vectors_ok: true,
        }
    }

    /// Number of lanes a vector holds for the given element type.
    pub fn max_vector_length(&self, elem: ValueType) -> i32 {
        let size = elem.data_size();
        if size == 0 {
            0
        } else {
            self.vector_width_in_bytes / size
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::avx2()
    }
}

// =============================================================================
// Tests
// =============================================================================
