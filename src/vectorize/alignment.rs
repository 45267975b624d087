//! Alignment solving.
//!
//! Given one VPointer-decomposed memory reference and the pre-/main-loop
//! strides, decide whether the pre-loop trip count can be chosen so that
//! every main-loop vector access is aligned to `aw = min(vector_width,
//! object_alignment)`.
//!
//! The address is reshaped into a linear expression with constant
//! coefficients:
//!
//! ```text
//! adr = base                                  (base % aw = 0)
//!     + C_const                               (sum of constant terms)
//!     + C_invar * var_invar                   (invariant term)
//!     + C_init  * var_init                    (variable init term)
//!     + C_pre   * pre_iter                    (adjustable pre-loop term)
//!     + C_main  * main_iter                   (main-loop term)
//! ```
//!
//! Alignment across main-loop iterations requires `C_main % aw = 0`. The
//! remaining single modular equation is strengthened into three independent
//! ones (const, invar, init), each of which is trivial, constrained, or
//! empty; the combination yields the returned [`AlignmentSolution`].

use log::trace;

use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

use super::vpointer::VPointer;
use super::Platform;

// =============================================================================
// Solution
// =============================================================================

/// Admissible pre-loop iteration counts for one memory reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignmentSolution {
    /// Any pre-loop trip count aligns the reference.
    Trivial,
    /// No pre-loop trip count works for all runtime values.
    Empty { reason: &'static str },
    /// The admissible counts are `m*q + r - invar/(scale*pre_stride) -
    /// init/pre_stride` for any integer `m`; the invar and init terms are
    /// dropped when the invariant is absent or the init is a compile-time
    /// constant.
    Constrained {
        mem_ref: NodeId,
        /// Periodicity; a power of two >= 2.
        q: i32,
        /// Constant alignment residue, `0 <= r < q`.
        r: i32,
        invar: Option<NodeId>,
        scale: i32,
    },
}

impl AlignmentSolution {
    #[inline]
    pub fn is_trivial(&self) -> bool {
        matches!(self, AlignmentSolution::Trivial)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, AlignmentSolution::Empty { .. })
    }

    #[inline]
    pub fn is_constrained(&self) -> bool {
        matches!(self, AlignmentSolution::Constrained { .. })
    }

    /// Intersect with the solution of another memory reference of the same
    /// loop. Pre-stride and init are shared by all references, so two
    /// constrained solutions are compatible only when they describe the same
    /// periodic set.
    pub fn filter(&self, other: &AlignmentSolution) -> AlignmentSolution {
        match (self, other) {
            (AlignmentSolution::Empty { .. }, _) => self.clone(),
            (_, AlignmentSolution::Empty { .. }) => other.clone(),
            (AlignmentSolution::Trivial, _) => other.clone(),
            (_, AlignmentSolution::Trivial) => self.clone(),
            (
                AlignmentSolution::Constrained {
                    q: q1,
                    r: r1,
                    invar: i1,
                    scale: s1,
                    ..
                },
                AlignmentSolution::Constrained {
                    q: q2,
                    r: r2,
                    invar: i2,
                    scale: s2,
                    ..
                },
            ) => {
                if q1 == q2 && r1 == r2 && i1 == i2 && s1 == s2 {
                    self.clone()
                } else {
                    AlignmentSolution::Empty {
                        reason: "constrained solutions do not intersect",
                    }
                }
            }
        }
    }

    /// Modulo with a non-negative result.
    #[inline]
    pub const fn mod_pos(i: i32, q: i32) -> i32 {
        ((i % q) + q) % q
    }
}

// =============================================================================
// Solver
// =============================================================================

/// Per-reference alignment solver.
pub struct AlignmentSolver {
    mem_ref: NodeId,
    base: NodeId,
    scale: i32,
    offset: i32,
    invar: Option<NodeId>,
    invar_factor: i32,
    init_node: NodeId,
    pre_stride: i32,
    main_stride: i32,
    vector_width: i32,
    /// Alignment width: `min(vector_width, object_alignment)`.
    aw: i32,
}

impl AlignmentSolver {
    /// Set up the solver for one decomposed reference.
    ///
    /// `init_node` is the iv's value before the pre-loop, `pre_stride` the iv
    /// increment per pre-loop iteration, and `main_stride` the increment per
    /// main-loop iteration (`pre_stride * unroll_factor`).
    pub fn new(
        graph: &Graph,
        pointer: &VPointer,
        init_node: NodeId,
        pre_stride: i32,
        main_stride: i32,
        vector_length: i32,
        platform: &Platform,
    ) -> AlignmentSolver {
        debug_assert!(pointer.valid(), "solver needs a valid pointer");
        let element_size = pointer.memory_size(graph);
        let vector_width = vector_length * element_size;
        AlignmentSolver {
            mem_ref: pointer.mem(),
            base: pointer.base(),
            scale: pointer.scale(),
            offset: pointer.offset(),
            invar: pointer.invar(),
            invar_factor: pointer.invar_factor(graph),
            init_node,
            pre_stride,
            main_stride,
            vector_width,
            aw: vector_width.min(platform.object_alignment_in_bytes),
        }
    }

    #[inline]
    pub fn vector_width(&self) -> i32 {
        self.vector_width
    }

    #[inline]
    pub fn aw(&self) -> i32 {
        self.aw
    }

    pub fn solve(&self, graph: &Graph) -> AlignmentSolution {
        // Out of simplicity: non power-of-2 stride not supported.
        if !is_power_of_2(self.pre_stride.abs()) {
            return AlignmentSolution::Empty {
                reason: "non power-of-2 stride not supported",
            };
        }
        debug_assert!(
            is_power_of_2(self.main_stride.abs()),
            "main stride is pre stride times a power-of-2 unroll factor"
        );
        debug_assert!(self.aw > 0 && is_power_of_2(self.aw), "aw must be power of 2");

        // Out of simplicity: non power-of-2 scale not supported.
        if self.scale == 0 || !is_power_of_2(self.scale.abs()) {
            return AlignmentSolution::Empty {
                reason: "non power-of-2 scale not supported",
            };
        }

        // Attribute init either to the constant term or to its own term.
        let init_con = graph.node(self.init_node).as_con_i();
        let c_const_init = init_con.unwrap_or(0);
        let c_const = self.offset.wrapping_add(c_const_init.wrapping_mul(self.scale));

        let c_invar = if self.invar.is_some() {
            self.invar_factor.abs()
        } else {
            0
        };
        let c_init = if init_con.is_some() { 0 } else { self.scale };
        let c_pre = self.scale * self.pre_stride;
        let c_main = self.scale * self.main_stride;

        trace!(
            "AlignmentSolver: C_const={} C_invar={} C_init={} C_pre={} C_main={} aw={}",
            c_const,
            c_invar,
            c_init,
            c_pre,
            c_main,
            self.aw
        );

        // Alignment must hold for every main-loop iteration.
        if AlignmentSolution::mod_pos(c_main, self.aw) != 0 {
            return AlignmentSolution::Empty {
                reason: "cannot align across main-loop iterations",
            };
        }

        // Strengthen the single equation into three independent ones, so the
        // const, invar and init terms can be aligned individually by a choice
        // of pre-loop trip count.
        let eq4 = Eq4::new(c_const, c_invar, c_init, c_pre, self.aw);
        let (a, b, c) = (eq4.const_state(), eq4.invar_state(), eq4.init_state());

        if a == Eq4State::Trivial && b == Eq4State::Trivial && c == Eq4State::Trivial {
            return AlignmentSolution::Trivial;
        }
        if a == Eq4State::Empty || b == Eq4State::Empty || c == Eq4State::Empty {
            return AlignmentSolution::Empty {
                reason: "cannot align const, invar and init terms individually",
            };
        }

        // All three constrained, which implies |C_pre| < aw and exact
        // divisibility of each term by |C_pre|.
        debug_assert!(c_pre.abs() < self.aw);
        debug_assert!(AlignmentSolution::mod_pos(c_const, c_pre.abs()) == 0);
        debug_assert!(AlignmentSolution::mod_pos(c_invar, c_pre.abs()) == 0);
        debug_assert!(AlignmentSolution::mod_pos(c_init, c_pre.abs()) == 0);

        let q = self.aw / c_pre.abs();
        debug_assert!(q >= 2, "implied by the constrained state");

        // The division is exact; scale and pre_stride carry their signs.
        let r = AlignmentSolution::mod_pos(-c_const / (self.scale * self.pre_stride), q);

        AlignmentSolution::Constrained {
            mem_ref: self.mem_ref,
            q,
            r,
            invar: self.invar,
            scale: self.scale,
        }
    }

    /// The object base this reference is relative to.
    #[inline]
    pub fn base(&self) -> NodeId {
        self.base
    }
}

// =============================================================================
// The three strengthened equations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eq4State {
    Trivial,
    Constrained,
    Empty,
}

/// State of `(C + C_pre * pre_iter_C) % aw = 0` for each of the three
/// coefficient terms.
struct Eq4 {
    c_const: i32,
    c_invar: i32,
    c_init: i32,
    c_pre: i32,
    aw: i32,
}

impl Eq4 {
    fn new(c_const: i32, c_invar: i32, c_init: i32, c_pre: i32, aw: i32) -> Eq4 {
        Eq4 {
            c_const,
            c_invar,
            c_init,
            c_pre,
            aw,
        }
    }

    fn state_for(&self, c: i32) -> Eq4State {
        if self.c_pre.abs() >= self.aw {
            // C_pre alone aligns every step; only the term itself matters.
            if AlignmentSolution::mod_pos(c, self.aw) == 0 {
                Eq4State::Trivial
            } else {
                Eq4State::Empty
            }
        } else if AlignmentSolution::mod_pos(c, self.c_pre.abs()) == 0 {
            Eq4State::Constrained
        } else {
            Eq4State::Empty
        }
    }

    fn const_state(&self) -> Eq4State {
        self.state_for(self.c_const)
    }

    fn invar_state(&self) -> Eq4State {
        self.state_for(self.c_invar)
    }

    fn init_state(&self) -> Eq4State {
        self.state_for(self.c_init)
    }
}

#[inline]
fn is_power_of_2(v: i32) -> bool {
    v > 0 && (v & (v - 1)) == 0
}

// =============================================================================
// Tests
// =============================================================================
