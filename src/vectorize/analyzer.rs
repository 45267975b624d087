//! Analysis pipeline.
//!
//! [`VLoopAnalyzer::analyze`] runs the whole sequence on one loop:
//! preconditions, reduction marking, memory slices, body construction,
//! element-type inference, dependence graph. It fails early with a typed
//! reason, including when the loop has neither a reduction nor a store (in
//! which case vectorizing it would be pointless). On success it owns the
//! validated analysis bundle the code generator consumes.

use log::trace;

use crate::ir::graph::Graph;
use crate::ir::node::{input, NodeId};

use super::alignment::{AlignmentSolution, AlignmentSolver};
use super::body::{BodyFailure, VLoopBody};
use super::dependence::VLoopDependenceGraph;
use super::reduction::VLoopReductions;
use super::slices::VLoopMemorySlices;
use super::velt::VLoopTypes;
use super::vloop::{PreconditionFailure, VLoop};
use super::vpointer::VPointer;

// =============================================================================
// Failure reasons
// =============================================================================

/// Why the full analysis could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeFailure {
    Precondition(PreconditionFailure),
    /// Unroll analysis never assigned a maximum unroll factor.
    NoMaxUnroll,
    /// Neither a reduction nor a store: nothing to vectorize.
    NoReductionOrStore,
    Body(BodyFailure),
}

impl AnalyzeFailure {
    pub const fn description(self) -> &'static str {
        match self {
            AnalyzeFailure::Precondition(p) => p.description(),
            AnalyzeFailure::NoMaxUnroll => "no max unroll assigned",
            AnalyzeFailure::NoReductionOrStore => "no reduction or store in loop",
            AnalyzeFailure::Body(b) => b.description(),
        }
    }
}

// =============================================================================
// VLoopAnalyzer
// =============================================================================

/// The validated analysis bundle of one loop.
pub struct VLoopAnalyzer {
    vloop: VLoop,
    reductions: VLoopReductions,
    memory_slices: VLoopMemorySlices,
    body: VLoopBody,
    types: VLoopTypes,
    dependence_graph: VLoopDependenceGraph,
}

impl VLoopAnalyzer {
    /// Run the pipeline. Consumes the `VLoop` and returns the bundle on
    /// success.
    pub fn analyze(graph: &mut Graph, mut vloop: VLoop) -> Result<VLoopAnalyzer, AnalyzeFailure> {
        vloop
            .check_preconditions(graph)
            .map_err(AnalyzeFailure::Precondition)?;

        // Skip loops the unroll analysis never sized.
        let slp_max_unroll = graph
            .loop_meta(vloop.cl())
            .map(|m| m.slp_max_unroll)
            .unwrap_or(0);
        if slp_max_unroll == 0 {
            return Err(AnalyzeFailure::NoMaxUnroll);
        }

        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(graph, &vloop);

        let mut memory_slices = VLoopMemorySlices::new();
        memory_slices.analyze(graph, &vloop);

        // No memory slice means no store in the loop.
        if !reductions.is_marked_reduction_loop() && memory_slices.is_empty() {
            return Err(AnalyzeFailure::NoReductionOrStore);
        }

        let mut body = VLoopBody::new();
        body.construct(graph, &vloop).map_err(AnalyzeFailure::Body)?;

        let mut types = VLoopTypes::new();
        types.compute_vector_element_type(graph, &vloop, &body);

        let mut dependence_graph = VLoopDependenceGraph::new();
        dependence_graph.build(graph, &vloop, &memory_slices, &body);

        trace!(
            "VLoopAnalyzer: loop {:?} analyzed, {} body node(s), {} slice(s)",
            vloop.cl(),
            body.body().len(),
            memory_slices.len()
        );

        Ok(VLoopAnalyzer {
            vloop,
            reductions,
            memory_slices,
            body,
            types,
            dependence_graph,
        })
    }

    // =========================================================================
    // Bundle accessors
    // =========================================================================

    #[inline]
    pub fn vloop(&self) -> &VLoop {
        &self.vloop
    }

    #[inline]
    pub fn reductions(&self) -> &VLoopReductions {
        &self.reductions
    }

    #[inline]
    pub fn memory_slices(&self) -> &VLoopMemorySlices {
        &self.memory_slices
    }

    #[inline]
    pub fn body(&self) -> &VLoopBody {
        &self.body
    }

    #[inline]
    pub fn types(&self) -> &VLoopTypes {
        &self.types
    }

    #[inline]
    pub fn dependence_graph(&self) -> &VLoopDependenceGraph {
        &self.dependence_graph
    }

    // =========================================================================
    // Per-reference services for the code generator
    // =========================================================================

    /// Decompose one memory reference of the analyzed loop.
    pub fn vpointer(&self, graph: &mut Graph, mem: NodeId) -> VPointer {
        VPointer::new(graph, &self.vloop, mem)
    }

    /// Alignment solution for one candidate vector memory reference.
    ///
    /// Strides are read off the loop structure: the pre-loop supplies the
    /// scalar stride, the analyzed main loop the unrolled one; the iv's
    /// entry value is the init term. Only meaningful on main loops.
    pub fn alignment_solution(
        &self,
        graph: &mut Graph,
        mem: NodeId,
        vector_length: i32,
    ) -> AlignmentSolution {
        let pointer = VPointer::new(graph, &self.vloop, mem);
        if !pointer.valid() {
            return AlignmentSolution::Empty {
                reason: "address not in linear form",
            };
        }
        let Some(pre_head) = self.vloop.pre_loop_head() else {
            return AlignmentSolution::Empty {
                reason: "loop has no adjustable pre-loop",
            };
        };
        let (Some(pre_stride), Some(main_stride)) = (
            graph.counted_loop_stride(pre_head),
            graph.counted_loop_stride(self.vloop.cl()),
        ) else {
            return AlignmentSolution::Empty {
                reason: "loop stride is not a compile-time constant",
            };
        };
        let init_node = graph.node(self.vloop.iv()).in_at(input::LOOP_ENTRY);

        let solver = AlignmentSolver::new(
            graph,
            &pointer,
            init_node,
            pre_stride,
            main_stride,
            vector_length,
            self.vloop.platform(),
        );
        solver.solve(graph)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{CountedLoopParts, LoopGraphBuilder};
    use crate::ir::graph::LoopKind;
    use crate::ir::operators::{MemKind, Opcode};
    use crate::ir::types::ValueType;
    use crate::vectorize::Platform;

    fn store_loop() -> (LoopGraphBuilder, CountedLoopParts, NodeId) {
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let start = b.graph.start;
        let lp = b.counted_loop(start, init, limit, 1, LoopKind::Normal);
        let phi = b.mem_phi(lp.cl, mem0, 1);
        let addr = b.index_addr(base, lp.iv, 2, 16);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);
        (b, lp, st)
    }

    #[test]
    fn test_pipeline_succeeds_on_store_loop() {
        let (mut b, lp, st) = store_loop();
        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        let analyzer = VLoopAnalyzer::analyze(&mut b.graph, vloop).unwrap();

        assert_eq!(analyzer.memory_slices().len(), 1);
        assert_eq!(analyzer.body().body()[0], lp.cl);
        assert!(!analyzer.reductions().is_marked_reduction_loop());
        assert_eq!(analyzer.types().velt_type(st), ValueType::Int);
        let p = analyzer.vpointer(&mut b.graph, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
    }

    #[test]
    fn test_no_reduction_or_store_fails() {
        // Loads only: no slice, no reduction.
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let start = b.graph.start;
        let lp = b.counted_loop(start, init, limit, 1, LoopKind::Normal);
        let addr = b.index_addr(base, lp.iv, 2, 16);
        let _ld = b.load(lp.cl, mem0, addr, MemKind::Int, 1);

        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        assert!(matches!(
            VLoopAnalyzer::analyze(&mut b.graph, vloop),
            Err(AnalyzeFailure::NoReductionOrStore)
        ));
    }

    #[test]
    fn test_reduction_only_loop_passes_gate() {
        // sum += x with no store still analyzes.
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let start = b.graph.start;
        let lp = b.counted_loop(start, init, limit, 1, LoopKind::Normal);
        let sum0 = b.con_i(0);
        let phi = b
            .graph
            .new_node(Opcode::Phi, &[lp.cl, sum0, NodeId::INVALID], ValueType::Int);
        b.graph.set_ctrl(phi, lp.cl);
        let x = b.parm(1, ValueType::Int);
        let add = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, phi, x], ValueType::Int);
        b.graph.set_ctrl(add, lp.cl);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, add);
        b.graph
            .new_node(Opcode::Proj { cfg: false }, &[phi], ValueType::Int);

        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        let analyzer = VLoopAnalyzer::analyze(&mut b.graph, vloop).unwrap();
        assert!(analyzer.reductions().is_marked_reduction(add));
        assert!(analyzer.memory_slices().is_empty());
    }

    #[test]
    fn test_atomic_in_body_fails_with_node_not_allowed() {
        let (mut b, lp, st) = store_loop();
        let addr = b.graph.node(st).in_at(crate::ir::node::input::MEM_ADDRESS);
        let zero = b.con_i(0);
        let atomic =
            b.graph
                .new_node(Opcode::LoadStore, &[lp.cl, st, addr, zero], ValueType::Int);
        b.graph.set_ctrl(atomic, lp.cl);

        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        assert!(matches!(
            VLoopAnalyzer::analyze(&mut b.graph, vloop),
            Err(AnalyzeFailure::Body(BodyFailure::NodeNotAllowed))
        ));
    }

    #[test]
    fn test_no_max_unroll_fails() {
        let (mut b, lp, _st) = store_loop();
        b.graph.loop_meta_mut(lp.cl).unwrap().slp_max_unroll = 0;
        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        assert!(matches!(
            VLoopAnalyzer::analyze(&mut b.graph, vloop),
            Err(AnalyzeFailure::NoMaxUnroll)
        ));
    }

    #[test]
    fn test_precondition_failure_wrapped() {
        let (mut b, lp, _st) = store_loop();
        b.graph.loop_meta_mut(lp.cl).unwrap().vectorized = true;
        let vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        assert!(matches!(
            VLoopAnalyzer::analyze(&mut b.graph, vloop),
            Err(AnalyzeFailure::Precondition(
                PreconditionFailure::AlreadyVectorized
            ))
        ));
    }

    #[test]
    fn test_alignment_solution_on_main_loop() {
        // Split loop writing an int array with a 32-byte aligned header.
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let (_pre, main) = b.pre_main_loops(init, limit, 1, 8);
        let phi = b.mem_phi(main.cl, mem0, 1);
        let addr = b.index_addr(base, main.iv, 2, 32);
        let zero = b.con_i(0);
        let st = b.store(main.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let mut platform = Platform::default();
        platform.object_alignment_in_bytes = 32;
        let vloop = VLoop::new(main.cl, b.loop_body(main.cl), platform, false);
        let analyzer = VLoopAnalyzer::analyze(&mut b.graph, vloop).unwrap();

        match analyzer.alignment_solution(&mut b.graph, st, 8) {
            AlignmentSolution::Constrained { q, r, .. } => {
                assert_eq!(q, 8);
                assert_eq!(r, 0);
            }
            other => panic!("expected constrained solution, got {:?}", other),
        }
    }

    #[test]
    fn test_alignment_solution_non_power_of_two_stride() {
        // i += 3 cannot be aligned.
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let (_pre, main) = b.pre_main_loops(init, limit, 3, 8);
        let phi = b.mem_phi(main.cl, mem0, 1);
        let addr = b.index_addr(base, main.iv, 2, 32);
        let zero = b.con_i(0);
        let st = b.store(main.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = VLoop::new(main.cl, b.loop_body(main.cl), Platform::default(), false);
        let analyzer = VLoopAnalyzer::analyze(&mut b.graph, vloop).unwrap();
        assert_eq!(
            analyzer.alignment_solution(&mut b.graph, st, 8),
            AlignmentSolution::Empty {
                reason: "non power-of-2 stride not supported"
            }
        );
    }
}
