//! Memory dependence graph.
//!
//! One dependence node per in-body memory node, plus a global root/sink pair
//! and one synthetic sink per slice. Within a slice, every pair of accesses
//! that is not provably disjoint (by VPointer comparison) gets an ordering
//! edge; load-after-load pairs are skipped. Data inputs and dependence edges
//! are traversed uniformly through [`PredsIterator`], which lets the depth
//! fixpoint and the independence queries treat memory and data dependences
//! as one graph.
//!
//! Edges are arena-allocated `(pred, succ)` records chained into intrusive
//! per-node in/out lists; nothing owns anything.

use log::trace;

use crate::ir::arena::{Arena, BitSet, Id, SecondaryMap};
use crate::ir::graph::Graph;
use crate::ir::node::{input, Node, NodeId};

use super::body::VLoopBody;
use super::slices::VLoopMemorySlices;
use super::vloop::VLoop;
use super::vpointer::VPointer;

// =============================================================================
// Graph storage
// =============================================================================

/// Dependence-graph node; `node` is invalid for sentinels (root, sink,
/// per-slice sinks).
pub struct DependenceNode {
    node: NodeId,
    in_head: DepEdgeId,
    out_head: DepEdgeId,
}

/// One ordering edge, threaded into the succ's in-list and the pred's
/// out-list.
pub struct DependenceEdge {
    pred: DepNodeId,
    succ: DepNodeId,
    next_in: DepEdgeId,
    next_out: DepEdgeId,
}

pub type DepNodeId = Id<DependenceNode>;
pub type DepEdgeId = Id<DependenceEdge>;

// =============================================================================
// VLoopDependenceGraph
// =============================================================================

pub struct VLoopDependenceGraph {
    nodes: Arena<DependenceNode>,
    edges: Arena<DependenceEdge>,
    map: SecondaryMap<Node, DepNodeId>,
    root: DepNodeId,
    sink: DepNodeId,
    depth: SecondaryMap<Node, i32>,
}

impl VLoopDependenceGraph {
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let root = nodes.alloc(DependenceNode {
            node: NodeId::INVALID,
            in_head: DepEdgeId::INVALID,
            out_head: DepEdgeId::INVALID,
        });
        let sink = nodes.alloc(DependenceNode {
            node: NodeId::INVALID,
            in_head: DepEdgeId::INVALID,
            out_head: DepEdgeId::INVALID,
        });
        VLoopDependenceGraph {
            nodes,
            edges: Arena::new(),
            map: SecondaryMap::new(),
            root,
            sink,
            depth: SecondaryMap::new(),
        }
    }

    /// Build the per-slice dependences and the depth table.
    ///
    /// Needs mutable graph access because VPointer construction may
    /// materialize combined invariant nodes.
    pub fn build(
        &mut self,
        graph: &mut Graph,
        vloop: &VLoop,
        memory_slices: &VLoopMemorySlices,
        body: &VLoopBody,
    ) {
        // One dependence node per in-body memory node.
        for &n in body.body() {
            let node = graph.node(n);
            if node.is_mem() || node.is_memory_phi() {
                self.make_node(n);
            }
        }

        let mut slice_nodes = Vec::new();
        for i in 0..memory_slices.len() {
            let head = memory_slices.heads()[i];
            let tail = memory_slices.tails()[i];

            // Slice members in tail-first order; iterate backwards for
            // predecessor-first.
            memory_slices.get_slice(graph, vloop, head, tail, &mut slice_nodes);

            let slice_head = self.get_node(head);
            let root = self.root;
            self.make_edge(root, slice_head);

            let slice_sink = self.make_sentinel();
            let sink = self.sink;
            self.make_edge(slice_sink, sink);

            for j in (0..slice_nodes.len()).rev() {
                let s1 = slice_nodes[j];
                let d1 = self.get_node(s1);

                // Nothing orders s1 yet: anchor it at the slice head.
                if self.in_cnt(d1) == 0 {
                    self.make_edge(slice_head, d1);
                }

                let p1 = VPointer::new(graph, vloop, s1);
                let mut sink_dependent = true;
                for k in (0..j).rev() {
                    let s2 = slice_nodes[k];
                    if graph.node(s1).is_load() && graph.node(s2).is_load() {
                        continue;
                    }
                    let p2 = VPointer::new(graph, vloop, s2);
                    if !p1.cmp(graph, &p2).is_not_equal() {
                        // Possibly the same address: order s1 before s2.
                        let d2 = self.get_node(s2);
                        self.make_edge(d1, d2);
                        sink_dependent = false;
                    }
                }
                if sink_dependent {
                    self.make_edge(d1, slice_sink);
                }
            }
        }

        self.compute_max_depth(graph, vloop, body);
    }

    // =========================================================================
    // Structure accessors
    // =========================================================================

    #[inline]
    pub fn root(&self) -> DepNodeId {
        self.root
    }

    #[inline]
    pub fn sink(&self) -> DepNodeId {
        self.sink
    }

    /// Dependence node of an in-body memory node.
    #[inline]
    pub fn get_node(&self, n: NodeId) -> DepNodeId {
        let d = self.map.value(n);
        debug_assert!(d.is_valid(), "memory node without dependence node");
        d
    }

    pub fn in_cnt(&self, d: DepNodeId) -> usize {
        let mut count = 0;
        let mut e = self.nodes[d].in_head;
        while e.is_valid() {
            count += 1;
            e = self.edges[e].next_in;
        }
        count
    }

    pub fn out_cnt(&self, d: DepNodeId) -> usize {
        let mut count = 0;
        let mut e = self.nodes[d].out_head;
        while e.is_valid() {
            count += 1;
            e = self.edges[e].next_out;
        }
        count
    }

    /// Successor dependence nodes of `d`, most recently added first.
    pub fn succs(&self, d: DepNodeId) -> Vec<DepNodeId> {
        let mut result = Vec::new();
        let mut e = self.nodes[d].out_head;
        while e.is_valid() {
            result.push(self.edges[e].succ);
            e = self.edges[e].next_out;
        }
        result
    }

    /// IR node behind a dependence node; invalid for sentinels.
    #[inline]
    pub fn dep_ir_node(&self, d: DepNodeId) -> NodeId {
        self.nodes[d].node
    }

    fn make_node(&mut self, n: NodeId) -> DepNodeId {
        debug_assert!(!self.map.value(n).is_valid(), "one init only");
        let d = self.nodes.alloc(DependenceNode {
            node: n,
            in_head: DepEdgeId::INVALID,
            out_head: DepEdgeId::INVALID,
        });
        self.map.set(n, d);
        d
    }

    fn make_sentinel(&mut self) -> DepNodeId {
        self.nodes.alloc(DependenceNode {
            node: NodeId::INVALID,
            in_head: DepEdgeId::INVALID,
            out_head: DepEdgeId::INVALID,
        })
    }

    fn make_edge(&mut self, pred: DepNodeId, succ: DepNodeId) -> DepEdgeId {
        let e = self.edges.alloc(DependenceEdge {
            pred,
            succ,
            next_in: self.nodes[succ].in_head,
            next_out: self.nodes[pred].out_head,
        });
        self.nodes[succ].in_head = e;
        self.nodes[pred].out_head = e;
        e
    }

    // =========================================================================
    // Depth
    // =========================================================================

    /// Longest path from the root; phis stay at depth zero.
    #[inline]
    pub fn depth(&self, n: NodeId) -> i32 {
        self.depth.value(n)
    }

    fn compute_max_depth(&mut self, graph: &Graph, vloop: &VLoop, body: &VLoopBody) {
        for &n in body.body() {
            self.depth.set(n, 0);
        }

        let mut iterations = 0;
        loop {
            let mut again = false;
            for &n in body.body() {
                if graph.node(n).is_phi() {
                    continue;
                }
                let d_orig = self.depth(n);
                let d_in = {
                    let mut d = 0;
                    let mut preds = PredsIterator::new(graph, self, n);
                    while !preds.done() {
                        let p = preds.current();
                        if vloop.in_body(p) {
                            d = d.max(self.depth(p));
                        }
                        preds.next();
                    }
                    d
                };
                if d_in + 1 != d_orig {
                    self.depth.set(n, d_in + 1);
                    again = true;
                }
            }
            iterations += 1;
            if !again {
                break;
            }
        }
        trace!("VLoopDependenceGraph: depth fixpoint in {} pass(es)", iterations);
    }

    // =========================================================================
    // Independence queries
    // =========================================================================

    /// Is there no dependence path between `s1` and `s2`?
    ///
    /// Nodes at equal depth cannot reach each other; otherwise a backward
    /// BFS from the deeper node, pruned below the smaller depth, looks for
    /// the shallower one.
    pub fn independent(&self, graph: &Graph, vloop: &VLoop, s1: NodeId, s2: NodeId) -> bool {
        let d1 = self.depth(s1);
        let d2 = self.depth(s2);
        if d1 == d2 {
            return s1 != s2;
        }
        let (deep, shallow) = if d1 > d2 { (s1, s2) } else { (s2, s1) };
        let min_d = d1.min(d2);

        let mut worklist = vec![deep];
        let mut enqueued = BitSet::with_capacity(graph.len());
        enqueued.insert(deep.as_usize());
        let mut i = 0;
        while i < worklist.len() {
            let n = worklist[i];
            i += 1;
            let mut preds = PredsIterator::new(graph, self, n);
            while !preds.done() {
                let p = preds.current();
                if vloop.in_body(p) && self.depth(p) >= min_d {
                    if p == shallow {
                        return false;
                    }
                    if !enqueued.contains(p.as_usize()) {
                        enqueued.insert(p.as_usize());
                        worklist.push(p);
                    }
                }
                preds.next();
            }
        }
        true
    }

    /// Are all nodes mutually independent? One BFS from all of them, pruned
    /// below the smallest member depth, must never meet another member;
    /// linear in the graph size instead of quadratic pairwise queries.
    pub fn mutually_independent(
        &self,
        graph: &Graph,
        vloop: &VLoop,
        body: &VLoopBody,
        nodes: &[NodeId],
    ) -> bool {
        debug_assert!(!nodes.is_empty());
        let mut min_d = self.depth(nodes[0]);
        let mut members = BitSet::new();
        let mut worklist = Vec::with_capacity(nodes.len());
        let mut enqueued = BitSet::with_capacity(graph.len());
        for &n in nodes {
            min_d = min_d.min(self.depth(n));
            members.insert(body.body_idx(n));
            if !enqueued.contains(n.as_usize()) {
                enqueued.insert(n.as_usize());
                worklist.push(n);
            }
        }

        let mut i = 0;
        while i < worklist.len() {
            let n = worklist[i];
            i += 1;
            let mut preds = PredsIterator::new(graph, self, n);
            while !preds.done() {
                let p = preds.current();
                if vloop.in_body(p) && self.depth(p) >= min_d {
                    if members.contains(body.body_idx(p)) {
                        return false;
                    }
                    if !enqueued.contains(p.as_usize()) {
                        enqueued.insert(p.as_usize());
                        worklist.push(p);
                    }
                }
                preds.next();
            }
        }
        true
    }
}

impl Default for VLoopDependenceGraph {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Predecessor iterator
// =============================================================================

/// Iterates the combined predecessors of a body node: dependence-graph
/// in-edges for memory nodes, fused with the relevant data inputs. Loads and
/// stores contribute their address (and value) inputs; their memory input is
/// replaced by the dependence edges. Plain data nodes just iterate their
/// inputs.
pub struct PredsIterator<'a> {
    graph: &'a Graph,
    dg: &'a VLoopDependenceGraph,
    n: NodeId,
    next_idx: usize,
    end_idx: usize,
    dep_next: DepEdgeId,
    current: NodeId,
    done: bool,
}

impl<'a> PredsIterator<'a> {
    pub fn new(graph: &'a Graph, dg: &'a VLoopDependenceGraph, n: NodeId) -> Self {
        let node = graph.node(n);
        let (next_idx, end_idx, dep_next) = if node.is_load() || node.is_store() {
            // Memory dependences plus address/value inputs.
            (
                input::MEM_ADDRESS,
                node.req(),
                dg.nodes[dg.get_node(n)].in_head,
            )
        } else if node.is_mem() {
            (0, 0, dg.nodes[dg.get_node(n)].in_head)
        } else {
            (1, node.req(), DepEdgeId::INVALID)
        };
        let mut it = PredsIterator {
            graph,
            dg,
            n,
            next_idx,
            end_idx,
            dep_next,
            current: NodeId::INVALID,
            done: false,
        };
        it.next();
        it
    }

    #[inline]
    pub fn done(&self) -> bool {
        self.done
    }

    #[inline]
    pub fn current(&self) -> NodeId {
        self.current
    }

    pub fn next(&mut self) {
        while self.dep_next.is_valid() {
            let e = &self.dg.edges[self.dep_next];
            let pred = self.dg.nodes[e.pred].node;
            self.dep_next = e.next_in;
            if pred.is_valid() {
                // Sentinel preds (root) carry no IR node.
                self.current = pred;
                return;
            }
        }
        while self.next_idx < self.end_idx {
            let p = self.graph.node(self.n).in_at(self.next_idx);
            self.next_idx += 1;
            if p.is_valid() {
                self.current = p;
                return;
            }
        }
        self.done = true;
    }
}

// =============================================================================
// Tests
// =============================================================================
