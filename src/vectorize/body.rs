//! Loop-body ordering.
//!
//! Produces the list of in-loop nodes in reverse postorder of a depth-first
//! walk over use edges starting at the loop head, plus a node-to-position
//! map. Node kinds the vectorizer cannot handle anywhere in the loop
//! (atomics, memory merges, data projections) abort the analysis.

use log::trace;

use crate::ir::arena::{BitSet, SecondaryMap};
use crate::ir::graph::Graph;
use crate::ir::node::{Node, NodeId};
use crate::ir::operators::Opcode;

use super::vloop::VLoop;

// =============================================================================
// Failure reasons
// =============================================================================

/// Why the body could not be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFailure {
    /// The loop contains a node kind the vectorizer cannot handle.
    NodeNotAllowed,
}

impl BodyFailure {
    pub const fn description(self) -> &'static str {
        match self {
            BodyFailure::NodeNotAllowed => "node not allowed in loop body",
        }
    }
}

// =============================================================================
// VLoopBody
// =============================================================================

/// Reverse-postorder body of one loop.
pub struct VLoopBody {
    body: Vec<NodeId>,
    body_idx: SecondaryMap<Node, u32>,
}

impl VLoopBody {
    pub fn new() -> Self {
        VLoopBody {
            body: Vec::new(),
            body_idx: SecondaryMap::new(),
        }
    }

    pub fn construct(&mut self, graph: &Graph, vloop: &VLoop) -> Result<(), BodyFailure> {
        debug_assert!(self.body.is_empty(), "must have been reset");

        // First pass: reject unhandled node kinds and count members.
        let mut body_count = 0usize;
        for &n in vloop.raw_body() {
            body_count += 1;
            let node = graph.node(n);
            let disallowed = matches!(node.op, Opcode::LoadStore | Opcode::MergeMem)
                || matches!(node.op, Opcode::Proj { cfg: false });
            if disallowed {
                trace!("VLoopBody: unhandled node {:?} ({:?})", n, node.op);
                return Err(BodyFailure::NodeNotAllowed);
            }
        }

        // Depth-first walk over use edges, emitting reverse postorder. Phi
        // uses are only entered from the loop head itself so the walk never
        // crosses the backedge.
        let cl = vloop.cl();
        let mut visited = BitSet::with_capacity(graph.len());
        let mut post_visited = BitSet::with_capacity(graph.len());
        let mut stack = vec![cl];
        visited.insert(cl.as_usize());

        self.body.resize(body_count, NodeId::INVALID);
        let mut rpo_idx = body_count as isize - 1;

        while let Some(&n) = stack.last() {
            if !visited.contains(n.as_usize()) {
                // Forward arc: leave the node on the stack.
                visited.insert(n.as_usize());
            } else if !post_visited.contains(n.as_usize()) {
                let old_len = stack.len();
                for &use_n in graph.uses(n) {
                    if vloop.in_body(use_n)
                        && !visited.contains(use_n.as_usize())
                        && (!graph.node(use_n).is_phi() || n == cl)
                    {
                        stack.push(use_n);
                    }
                }
                if stack.len() == old_len {
                    // No unvisited uses left: post-visit.
                    stack.pop();
                    debug_assert!(rpo_idx >= 0, "more body members than counted");
                    self.body[rpo_idx as usize] = n;
                    rpo_idx -= 1;
                    post_visited.insert(n.as_usize());
                }
            } else {
                stack.pop();
            }
        }
        debug_assert!(rpo_idx == -1, "all body members must be reached");

        for (i, &n) in self.body.iter().enumerate() {
            self.body_idx.set(n, i as u32);
        }
        Ok(())
    }

    /// Body nodes in reverse postorder; the loop head sits at index 0.
    #[inline]
    pub fn body(&self) -> &[NodeId] {
        &self.body
    }

    /// Position of an in-body node in the reverse postorder.
    #[inline]
    pub fn body_idx(&self, n: NodeId) -> usize {
        self.body_idx.value(n) as usize
    }
}

impl Default for VLoopBody {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
