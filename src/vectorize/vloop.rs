//! Loop-level gatekeeping.
//!
//! [`VLoop`] wraps one counted loop together with its raw membership set and
//! the target capabilities, and checks the preconditions every later analysis
//! step relies on. Each rejection is a distinct [`PreconditionFailure`].

use log::trace;

use crate::ir::arena::BitSet;
use crate::ir::graph::{Graph, LoopKind};
use crate::ir::node::{input, NodeId};
use crate::ir::operators::Opcode;
use crate::ir::types::ValueType;

use super::Platform;

// =============================================================================
// Failure reasons
// =============================================================================

/// Why a loop cannot even be considered for vectorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionFailure {
    /// Vector width is not a power of two of at least 2 bytes.
    VectorWidth,
    /// Not a valid counted integer loop.
    NotCountedLoop,
    /// Loop was already vectorized.
    AlreadyVectorized,
    /// Loop is marked unroll-only.
    UnrollOnly,
    /// Control flow inside the loop body.
    ControlFlow,
    /// The backedge has more than one control user.
    Backedge,
    /// Main loop without a rewritable (opaque) pre-loop limit.
    PreLoopLimit,
}

impl PreconditionFailure {
    pub const fn description(self) -> &'static str {
        match self {
            PreconditionFailure::VectorWidth => "vector width not power of 2 or too small",
            PreconditionFailure::NotCountedLoop => "not a valid counted int loop",
            PreconditionFailure::AlreadyVectorized => "loop already vectorized",
            PreconditionFailure::UnrollOnly => "loop is unroll-only",
            PreconditionFailure::ControlFlow => "control flow in loop body",
            PreconditionFailure::Backedge => "extra control users of backedge",
            PreconditionFailure::PreLoopLimit => "no opaque pre-loop limit to rewrite",
        }
    }
}

// =============================================================================
// VLoop
// =============================================================================

/// One counted loop under vectorization analysis.
pub struct VLoop {
    cl: NodeId,
    raw_body: Vec<NodeId>,
    member: BitSet,
    platform: Platform,
    allow_cfg: bool,
    // Filled in by check_preconditions.
    iv: NodeId,
    cl_exit: NodeId,
    kind: LoopKind,
    pre_loop_head: Option<NodeId>,
}

impl VLoop {
    /// Wrap a loop head and its raw membership list (as reported by the loop
    /// tree). Call [`VLoop::check_preconditions`] before anything else.
    pub fn new(cl: NodeId, raw_body: Vec<NodeId>, platform: Platform, allow_cfg: bool) -> Self {
        let mut member = BitSet::new();
        for &n in &raw_body {
            member.insert(n.as_usize());
        }
        VLoop {
            cl,
            raw_body,
            member,
            platform,
            allow_cfg,
            iv: NodeId::INVALID,
            cl_exit: NodeId::INVALID,
            kind: LoopKind::Normal,
            pre_loop_head: None,
        }
    }

    /// Validate the loop shape. On success the iv phi, exit test and loop
    /// kind are cached for the rest of the analysis.
    pub fn check_preconditions(&mut self, graph: &Graph) -> Result<(), PreconditionFailure> {
        let result = self.check_preconditions_helper(graph);
        if let Err(reason) = result {
            trace!("VLoop::check_preconditions failed: {}", reason.description());
        }
        result
    }

    fn check_preconditions_helper(&mut self, graph: &Graph) -> Result<(), PreconditionFailure> {
        let vw = self.platform.vector_width_in_bytes;
        if vw < 2 || vw.count_ones() != 1 {
            return Err(PreconditionFailure::VectorWidth);
        }

        if !matches!(graph.node(self.cl).op, Opcode::CountedLoop) {
            return Err(PreconditionFailure::NotCountedLoop);
        }
        let meta = graph
            .loop_meta(self.cl)
            .ok_or(PreconditionFailure::NotCountedLoop)?;
        let iv = meta.iv;
        if !iv.is_valid()
            || !graph.node(iv).is_phi()
            || graph.node(iv).ty != ValueType::Int
            || !meta.loop_end.is_valid()
            || !matches!(graph.node(meta.loop_end).op, Opcode::CountedLoopEnd)
        {
            return Err(PreconditionFailure::NotCountedLoop);
        }

        if meta.vectorized {
            return Err(PreconditionFailure::AlreadyVectorized);
        }
        if meta.unroll_only {
            return Err(PreconditionFailure::UnrollOnly);
        }

        let cl_exit = meta.loop_end;
        let has_cfg = graph.node(cl_exit).in_at(input::CTRL) != self.cl;
        if has_cfg && !self.allow_cfg {
            return Err(PreconditionFailure::ControlFlow);
        }

        let back = graph.node(self.cl).in_at(input::LOOP_BACKEDGE);
        if graph.use_count(back) != 1 {
            return Err(PreconditionFailure::Backedge);
        }

        // Aligning main-loop accesses requires rewriting the pre-loop limit.
        if meta.kind == LoopKind::Main {
            let pre_end = meta.pre_loop_end.ok_or(PreconditionFailure::PreLoopLimit)?;
            let limit = graph.loop_end_limit(pre_end);
            if !limit.is_valid() || !matches!(graph.node(limit).op, Opcode::Opaque1) {
                return Err(PreconditionFailure::PreLoopLimit);
            }
            self.pre_loop_head = meta.pre_loop_head;
        }

        self.iv = iv;
        self.cl_exit = cl_exit;
        self.kind = meta.kind;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn cl(&self) -> NodeId {
        self.cl
    }

    /// Induction-variable phi. Only valid after successful preconditions.
    #[inline]
    pub fn iv(&self) -> NodeId {
        self.iv
    }

    #[inline]
    pub fn cl_exit(&self) -> NodeId {
        self.cl_exit
    }

    #[inline]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    #[inline]
    pub fn is_main_loop(&self) -> bool {
        self.kind == LoopKind::Main
    }

    /// Head of the matching pre-loop (main loops only).
    #[inline]
    pub fn pre_loop_head(&self) -> Option<NodeId> {
        self.pre_loop_head
    }

    /// Raw body list as provided by the loop tree.
    #[inline]
    pub fn raw_body(&self) -> &[NodeId] {
        &self.raw_body
    }

    /// Is `n` one of the loop's own nodes?
    #[inline]
    pub fn in_body(&self, n: NodeId) -> bool {
        n.is_valid() && self.member.contains(n.as_usize())
    }

    /// Is `n` executed under the loop, judged by its controlling cfg node?
    pub fn is_loop_member(&self, graph: &Graph, n: NodeId) -> bool {
        let c = graph.ctrl_of(n);
        c.is_valid() && self.member.contains(c.as_usize())
    }

    /// Can `n` be used as a loop-invariant term of an address?
    ///
    /// For main loops the value must additionally dominate the pre-loop head:
    /// a value computed between the pre- and main loop cannot feed the
    /// pre-loop's rewritten exit check.
    pub fn is_invariant(&self, graph: &Graph, n: NodeId) -> bool {
        let is_not_member = !self.is_loop_member(graph, n);
        if is_not_member && self.kind == LoopKind::Main {
            let n_c = graph.ctrl_of(n);
            return match self.pre_loop_head {
                Some(head) => graph.is_dominator(n_c, head),
                None => false,
            };
        }
        is_not_member
    }
}

// =============================================================================
// Tests
// =============================================================================
