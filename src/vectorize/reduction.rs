//! Reduction cycle detection.
//!
//! A reduction is a chain of same-opcode arithmetic nodes that carries a
//! value from a header phi's backedge input back to the phi, e.g. the four
//! `AddI` copies of `sum += a[i]` after unrolling by four. All participants
//! must use the same input-edge index (modulo recorded commutative swaps),
//! and no intermediate value may be used elsewhere in the loop. Marked nodes
//! may later be turned into vector reductions; everything else must treat
//! them as ordered.

use crate::ir::arena::BitSet;
use crate::ir::graph::Graph;
use crate::ir::node::{input, NodeId};

use super::vloop::VLoop;

/// Search bound for the standalone cycle query, matching the deepest
/// reduction chain unrolling can produce.
const LOOP_MAX_UNROLL: usize = 16;

/// Marked reduction nodes of one loop.
pub struct VLoopReductions {
    marked: BitSet,
}

impl VLoopReductions {
    pub fn new() -> Self {
        VLoopReductions {
            marked: BitSet::new(),
        }
    }

    /// Walk all phis on the loop head and mark every complete reduction
    /// cycle found behind them.
    pub fn mark_reductions(&mut self, graph: &Graph, vloop: &VLoop) {
        debug_assert!(self.marked.is_empty(), "must have been reset");

        for &phi in graph.uses(vloop.cl()) {
            if !graph.node(phi).is_phi() || graph.use_count(phi) == 0 || phi == vloop.iv() {
                continue;
            }
            // The phi's backedge input is the last node of the cycle.
            let first = graph.node(phi).in_at(input::LOOP_BACKEDGE);
            if !first.is_valid() || !Self::is_reduction_operator(graph, first) {
                continue;
            }
            // Find the edge index the whole cycle is connected through. All
            // cycle nodes are clones made by unrolling, so one shared index
            // (modulo swapped inputs) is expected.
            let first_op = graph.node(first).op;
            let mut reduction_input = None;
            let mut path_nodes = 0;
            for edge in 1..graph.node(first).req() {
                if let Some((_, count)) = find_in_path(
                    graph,
                    first,
                    edge,
                    vloop.raw_body().len(),
                    |n| graph.node(n).op == first_op && vloop.in_body(n),
                    |n| n == phi,
                ) {
                    reduction_input = Some(edge);
                    path_nodes = count;
                    break;
                }
            }
            let Some(reduction_input) = reduction_input else {
                continue;
            };

            // No cycle node may have another in-loop user.
            let mut current = first;
            let mut succ = phi;
            let mut used_in_loop = false;
            for _ in 0..path_nodes {
                for &u in graph.uses(current) {
                    if vloop.in_body(u) && u != succ {
                        used_in_loop = true;
                        break;
                    }
                }
                if used_in_loop {
                    break;
                }
                succ = current;
                current = original_input(graph, current, reduction_input);
            }
            if used_in_loop {
                continue;
            }

            // Mark the whole cycle.
            let mut current = first;
            for _ in 0..path_nodes {
                self.marked.insert(current.as_usize());
                current = original_input(graph, current, reduction_input);
            }
        }
    }

    #[inline]
    pub fn is_marked_reduction(&self, n: NodeId) -> bool {
        n.is_valid() && self.marked.contains(n.as_usize())
    }

    /// Does this loop contain any reduction at all?
    #[inline]
    pub fn is_marked_reduction_loop(&self) -> bool {
        !self.marked.is_empty()
    }

    /// Are `s1` and `s2` consecutive nodes of one marked cycle?
    pub fn is_marked_reduction_pair(&self, graph: &Graph, s1: NodeId, s2: NodeId) -> bool {
        self.is_marked_reduction(s1)
            && self.is_marked_reduction(s2)
            && graph.uses(s1).contains(&s2)
    }

    /// Standalone query: is `n` part of some reduction cycle? Used outside a
    /// full analysis, so the search is bounded by the unroll limit instead of
    /// the body size.
    pub fn is_reduction(graph: &Graph, n: NodeId) -> bool {
        if !Self::is_reduction_operator(graph, n) {
            return false;
        }
        for edge in 1..graph.node(n).req() {
            if in_reduction_cycle(graph, n, edge) {
                return true;
            }
        }
        false
    }

    /// Does the opcode have a vector-reduction counterpart for its type?
    pub fn is_reduction_operator(graph: &Graph, n: NodeId) -> bool {
        let node = graph.node(n);
        node.op.reduction_opcode_exists(node.ty)
    }
}

impl Default for VLoopReductions {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Path search
// =============================================================================

/// Follow input edge `edge` from `start` while `filter` holds, up to
/// `max_depth` steps, and return the node where `stop` fired together with
/// the number of traversed nodes.
fn find_in_path(
    graph: &Graph,
    start: NodeId,
    edge: usize,
    max_depth: usize,
    filter: impl Fn(NodeId) -> bool,
    stop: impl Fn(NodeId) -> bool,
) -> Option<(NodeId, usize)> {
    let mut current = start;
    let mut count = 0;
    for _ in 0..=max_depth {
        if !current.is_valid() {
            return None;
        }
        if stop(current) {
            return Some((current, count));
        }
        if !filter(current) {
            return None;
        }
        current = original_input(graph, current, edge);
        count += 1;
    }
    None
}

/// Input `i` of `n`, undoing a recorded commutative swap.
fn original_input(graph: &Graph, n: NodeId, i: usize) -> NodeId {
    let node = graph.node(n);
    if node.has_swapped_edges() {
        debug_assert!(node.op.is_commutative());
        if i == 1 {
            return node.in_at(2);
        } else if i == 2 {
            return node.in_at(1);
        }
    }
    node.in_at(i)
}

/// Is there a reduction path from `n` to a phi and back to `n` through input
/// edge `edge`?
fn in_reduction_cycle(graph: &Graph, n: NodeId, edge: usize) -> bool {
    let n_op = graph.node(n).op;
    let has_my_opcode = |m: NodeId| graph.node(m).op == n_op;
    let Some((phi, _)) = find_in_path(graph, n, edge, LOOP_MAX_UNROLL, has_my_opcode, |m| {
        graph.node(m).is_phi()
    }) else {
        return false;
    };
    let first = graph.node(phi).in_at(input::LOOP_BACKEDGE);
    if !first.is_valid() {
        return false;
    }
    find_in_path(graph, first, edge, LOOP_MAX_UNROLL, has_my_opcode, |m| m == n).is_some()
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

    fn loop_fixture() -> (LoopGraphBuilder, CountedLoopParts) {
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let start = b.graph.start;
        let lp = b.counted_loop(start, init, limit, 1, LoopKind::Normal);
        (b, lp)
    }

    fn vloop_for(b: &LoopGraphBuilder, lp: &CountedLoopParts) -> VLoop {
        let mut vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        vloop.check_preconditions(&b.graph).unwrap();
        vloop
    }

    /// Build `sum += x` unrolled `n` times: phi -> add1 -> ... -> addN, with
    /// the phi's backedge fed by addN and each add chained through input 1.
    fn build_sum_cycle(
        b: &mut LoopGraphBuilder,
        lp: &CountedLoopParts,
        n: usize,
    ) -> (NodeId, Vec<NodeId>) {
        let sum0 = b.con_i(0);
        let phi = b
            .graph
            .new_node(Opcode::Phi, &[lp.cl, sum0, NodeId::INVALID], ValueType::Int);
        b.graph.set_ctrl(phi, lp.cl);

        let mut adds = Vec::new();
        let mut carry = phi;
        for i in 0..n {
            let x = b.parm(10 + i as u16, ValueType::Int);
            let add = b
                .graph
                .new_node(Opcode::AddI, &[NodeId::INVALID, carry, x], ValueType::Int);
            b.graph.set_ctrl(add, lp.cl);
            adds.push(add);
            carry = add;
        }
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, carry);
        // Keep the phi alive like a real accumulator would be.
        b.graph
            .new_node(Opcode::Proj { cfg: false }, &[phi], ValueType::Int);
        (phi, adds)
    }

    #[test]
    fn test_unrolled_sum_cycle_marked() {
        let (mut b, lp) = loop_fixture();
        let (phi, adds) = build_sum_cycle(&mut b, &lp, 4);
        let vloop = vloop_for(&b, &lp);

        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);

        assert!(reductions.is_marked_reduction_loop());
        for &add in &adds {
            assert!(reductions.is_marked_reduction(add));
        }
        // The accumulator phi itself is not part of the marker set.
        assert!(!reductions.is_marked_reduction(phi));
        assert!(!reductions.is_marked_reduction(lp.iv));
        assert_eq!(
            adds.iter()
                .filter(|&&a| reductions.is_marked_reduction(a))
                .count(),
            4
        );
    }

    #[test]
    fn test_marked_reduction_pair() {
        let (mut b, lp) = loop_fixture();
        let (_phi, adds) = build_sum_cycle(&mut b, &lp, 3);
        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);

        assert!(reductions.is_marked_reduction_pair(&b.graph, adds[0], adds[1]));
        assert!(reductions.is_marked_reduction_pair(&b.graph, adds[1], adds[2]));
        assert!(!reductions.is_marked_reduction_pair(&b.graph, adds[0], adds[2]));
    }

    #[test]
    fn test_intermediate_use_in_loop_rejects_cycle() {
        let (mut b, lp) = loop_fixture();
        let (_phi, adds) = build_sum_cycle(&mut b, &lp, 4);
        // Give an intermediate node a second in-loop user.
        let leak = b
            .graph
            .new_node(Opcode::AbsI, &[NodeId::INVALID, adds[1]], ValueType::Int);
        b.graph.set_ctrl(leak, lp.cl);

        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);
        assert!(!reductions.is_marked_reduction_loop());
    }

    #[test]
    fn test_out_of_loop_use_is_allowed() {
        let (mut b, lp) = loop_fixture();
        let (_phi, adds) = build_sum_cycle(&mut b, &lp, 2);
        // The final value escaping the loop does not break the cycle.
        let escape = b
            .graph
            .new_node(Opcode::AbsI, &[NodeId::INVALID, adds[1]], ValueType::Int);
        let exit = lp.exit;
        b.graph.set_ctrl(escape, exit);

        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);
        // adds[1] has an out-of-body user besides the phi, which is fine.
        assert!(reductions.is_marked_reduction(adds[0]));
        assert!(reductions.is_marked_reduction(adds[1]));
    }

    #[test]
    fn test_mixed_opcode_chain_not_marked() {
        let (mut b, lp) = loop_fixture();
        let sum0 = b.con_i(0);
        let phi = b
            .graph
            .new_node(Opcode::Phi, &[lp.cl, sum0, NodeId::INVALID], ValueType::Int);
        b.graph.set_ctrl(phi, lp.cl);
        let x = b.parm(10, ValueType::Int);
        let add = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, phi, x], ValueType::Int);
        b.graph.set_ctrl(add, lp.cl);
        let mul = b
            .graph
            .new_node(Opcode::MulI, &[NodeId::INVALID, add, x], ValueType::Int);
        b.graph.set_ctrl(mul, lp.cl);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, mul);
        b.graph
            .new_node(Opcode::Proj { cfg: false }, &[phi], ValueType::Int);

        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);
        assert!(!reductions.is_marked_reduction_loop());
    }

    #[test]
    fn test_swapped_edges_cycle_marked() {
        let (mut b, lp) = loop_fixture();
        let sum0 = b.con_i(0);
        let phi = b
            .graph
            .new_node(Opcode::Phi, &[lp.cl, sum0, NodeId::INVALID], ValueType::Int);
        b.graph.set_ctrl(phi, lp.cl);

        let x1 = b.parm(10, ValueType::Int);
        let add1 = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, phi, x1], ValueType::Int);
        b.graph.set_ctrl(add1, lp.cl);

        // Canonicalization swapped the second add's inputs.
        let x2 = b.parm(11, ValueType::Int);
        let add2 = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, x2, add1], ValueType::Int);
        b.graph.set_ctrl(add2, lp.cl);
        b.graph.mark_swapped_edges(add2);

        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, add2);
        b.graph
            .new_node(Opcode::Proj { cfg: false }, &[phi], ValueType::Int);

        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);
        assert!(reductions.is_marked_reduction(add1));
        assert!(reductions.is_marked_reduction(add2));
    }

    #[test]
    fn test_memory_phi_not_a_reduction() {
        let (mut b, lp) = loop_fixture();
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let phi = b.mem_phi(lp.cl, mem0, 1);
        let addr = b.index_addr(base, lp.iv, 2, 16);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph
            .set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let mut reductions = VLoopReductions::new();
        reductions.mark_reductions(&b.graph, &vloop);
        assert!(!reductions.is_marked_reduction_loop());
    }

    #[test]
    fn test_standalone_is_reduction_query() {
        let (mut b, lp) = loop_fixture();
        let (_phi, adds) = build_sum_cycle(&mut b, &lp, 4);
        for &add in &adds {
            assert!(VLoopReductions::is_reduction(&b.graph, add));
        }
        // An add with no path back through a phi is not on a cycle.
        let x = b.parm(30, ValueType::Int);
        let y = b.parm(31, ValueType::Int);
        let free = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, x, y], ValueType::Int);
        assert!(!VLoopReductions::is_reduction(&b.graph, free));
        let _ = lp.incr;
    }

    #[test]
    fn test_is_reduction_operator() {
        let (mut b, lp) = loop_fixture();
        let x = b.parm(10, ValueType::Int);
        let add = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, x], ValueType::Int);
        let shift = b
            .graph
            .new_node(Opcode::LShiftI, &[NodeId::INVALID, lp.iv, x], ValueType::Int);
        assert!(VLoopReductions::is_reduction_operator(&b.graph, add));
        assert!(!VLoopReductions::is_reduction_operator(&b.graph, shift));
    }
}
