//! Memory slice analysis.
//!
//! A slice is the chain of memory states of one alias class through the
//! loop: its head is a memory phi on the loop head, its tail the memory node
//! feeding the phi's backedge. Stores of a slice form a straight chain from
//! tail up to head; loads hang off the individual states. Accesses in
//! different slices can never overlap, so all pairwise dependence work
//! happens within one slice at a time.

use log::trace;

use crate::ir::graph::Graph;
use crate::ir::node::{input, NodeId};
use crate::ir::operators::Opcode;

use super::vloop::VLoop;

/// Slice heads and tails of one loop, in matching order.
pub struct VLoopMemorySlices {
    heads: Vec<NodeId>,
    tails: Vec<NodeId>,
}

impl VLoopMemorySlices {
    pub fn new() -> Self {
        VLoopMemorySlices {
            heads: Vec::new(),
            tails: Vec::new(),
        }
    }

    /// Collect one slice per memory phi whose backedge state differs from
    /// its entry state (i.e. the loop actually writes the alias class).
    pub fn analyze(&mut self, graph: &Graph, vloop: &VLoop) {
        debug_assert!(self.heads.is_empty() && self.tails.is_empty(), "reset");

        for &phi in graph.uses(vloop.cl()) {
            let node = graph.node(phi);
            if node.is_memory_phi() && vloop.in_body(phi) {
                let tail = node.in_at(input::LOOP_BACKEDGE);
                if tail.is_valid() && tail != node.in_at(input::LOOP_ENTRY) {
                    self.heads.push(phi);
                    self.tails.push(tail);
                }
            }
        }
        trace!("VLoopMemorySlices: {} slice(s)", self.heads.len());
    }

    #[inline]
    pub fn heads(&self) -> &[NodeId] {
        &self.heads
    }

    #[inline]
    pub fn tails(&self) -> &[NodeId] {
        &self.tails
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Collect the memory operations of one slice into `slice`, walking the
    /// store chain from `tail` up to `head` and picking up every in-body
    /// load hanging off it. The result is ordered tail-first; iterate it
    /// backwards for predecessor-first order.
    pub fn get_slice(
        &self,
        graph: &Graph,
        vloop: &VLoop,
        head: NodeId,
        tail: NodeId,
        slice: &mut Vec<NodeId>,
    ) {
        slice.clear();
        let mut n = tail;
        let mut prev = NodeId::INVALID;
        loop {
            debug_assert!(vloop.in_body(n), "slice walk must stay in the body");
            for &out in graph.uses(n) {
                let out_node = graph.node(out);
                if out_node.is_load() {
                    if vloop.in_body(out) {
                        slice.push(out);
                    }
                } else if matches!(out_node.op, Opcode::MergeMem) && !vloop.in_body(out) {
                    // Unrolling can leave a memory edge to an out-of-loop
                    // merge; harmless for the slice itself.
                } else if out_node.is_memory_phi() && !vloop.in_body(out) {
                    // Ditto for out-of-body memory phis.
                } else if out_node.op == Opcode::StoreCM
                    && out_node.in_at(input::MEM_OOP_STORE) == n
                {
                    // Card-mark precedence edge, not a memory flow edge.
                } else {
                    debug_assert!(
                        out == prev || !prev.is_valid() || out == head,
                        "no branches off of a store slice"
                    );
                }
            }
            if n == head {
                break;
            }
            slice.push(n);
            prev = n;
            debug_assert!(graph.node(n).is_mem(), "store chain expected");
            n = graph.node(n).in_at(input::MEM_MEMORY);
        }
    }

    /// Do two memory nodes belong to the same slice?
    pub fn same_memory_slice(&self, graph: &Graph, n1: NodeId, n2: NodeId) -> bool {
        graph.alias_index(n1) == graph.alias_index(n2)
    }
}

impl Default for VLoopMemorySlices {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
