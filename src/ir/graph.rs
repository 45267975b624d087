//! Node graph with the oracles the vectorization analysis consumes.
//!
//! Besides node storage and use-def chains, the graph carries:
//!
//! - a **value-numbering table**: the `make_*` builders return an existing
//!   equivalent node instead of allocating a duplicate
//! - a **control oracle**: every node has a controlling cfg node; cfg nodes
//!   control themselves
//! - a **dominance oracle**: cfg nodes form an immediate-dominator chain
//! - an **alias oracle**: memory nodes carry an alias class index; accesses
//!   in different classes can never overlap
//! - **loop metadata**: counted-loop shape facts registered per loop head

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::arena::{Arena, SecondaryMap};
use super::node::{input, flags, InputList, Node, NodeId};
use super::operators::Opcode;
use super::types::ValueType;

// =============================================================================
// Loop metadata
// =============================================================================

/// Role of a counted loop after loop splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Unsplit loop.
    Normal,
    /// Pre-loop whose trip count aligns the main loop.
    Pre,
    /// Main loop, candidate for vectorization.
    Main,
}

/// Shape facts about one counted loop, registered by the loop optimizer.
#[derive(Debug, Clone)]
pub struct LoopMeta {
    pub kind: LoopKind,
    /// Induction-variable phi on the loop head.
    pub iv: NodeId,
    /// The `CountedLoopEnd` exit test.
    pub loop_end: NodeId,
    /// Loop has already been vectorized.
    pub vectorized: bool,
    /// Loop is marked unroll-only; vectorization is forbidden.
    pub unroll_only: bool,
    /// Maximum unroll factor assigned by unroll analysis; zero means the
    /// analysis never ran or rejected the loop.
    pub slp_max_unroll: u32,
    /// Exit test of the matching pre-loop (main loops only).
    pub pre_loop_end: Option<NodeId>,
    /// Head of the matching pre-loop (main loops only).
    pub pre_loop_head: Option<NodeId>,
}

impl LoopMeta {
    pub fn new(kind: LoopKind, iv: NodeId, loop_end: NodeId) -> Self {
        LoopMeta {
            kind,
            iv,
            loop_end,
            vectorized: false,
            unroll_only: false,
            slp_max_unroll: 4,
            pre_loop_end: None,
            pre_loop_head: None,
        }
    }
}

// =============================================================================
// Graph
// =============================================================================

type GvnKey = (Opcode, InputList);

/// The IR graph.
pub struct Graph {
    nodes: Arena<Node>,
    /// Use chains: for each node, the nodes that read it.
    uses: SecondaryMap<Node, Vec<NodeId>>,
    /// Controlling cfg node per node.
    ctrl: SecondaryMap<Node, NodeId>,
    /// Immediate dominator per cfg node.
    idom: SecondaryMap<Node, NodeId>,
    /// Alias class per memory node.
    alias: SecondaryMap<Node, u32>,
    /// Value-numbering table for pure nodes.
    gvn: FxHashMap<GvnKey, NodeId>,
    /// Counted-loop shape facts per loop head.
    loop_meta: FxHashMap<NodeId, LoopMeta>,
    /// Entry control.
    pub start: NodeId,
    top: NodeId,
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = Arena::with_capacity(64);
        let start = nodes.alloc(Node::new(Opcode::Start, SmallVec::new(), ValueType::Control));
        let top = nodes.alloc(Node::new(Opcode::Top, SmallVec::new(), ValueType::Top));

        let mut graph = Graph {
            nodes,
            uses: SecondaryMap::new(),
            ctrl: SecondaryMap::new(),
            idom: SecondaryMap::new(),
            alias: SecondaryMap::new(),
            gvn: FxHashMap::default(),
            loop_meta: FxHashMap::default(),
            start,
            top,
        };
        graph.ctrl.set(start, start);
        graph.ctrl.set(top, start);
        graph
    }

    // =========================================================================
    // Node access
    // =========================================================================

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The shared "unknown value" node.
    #[inline]
    pub fn top(&self) -> NodeId {
        self.top
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.ids()
    }

    // =========================================================================
    // Node creation
    // =========================================================================

    /// Add a node. Cfg nodes control themselves; data nodes start without a
    /// control until [`Graph::set_ctrl`] pins them.
    pub fn new_node(&mut self, op: Opcode, inputs: &[NodeId], ty: ValueType) -> NodeId {
        let inputs: InputList = inputs.iter().copied().collect();
        let id = self.nodes.alloc(Node::new(op, inputs.clone(), ty));
        for &def in &inputs {
            self.add_use(def, id);
        }
        if op.is_cfg() {
            self.ctrl.set(id, id);
        }
        id
    }

    /// Replace an input, keeping use chains consistent.
    pub fn set_input(&mut self, n: NodeId, idx: usize, new_in: NodeId) {
        let old = self.nodes[n].in_at(idx);
        if old == new_in {
            return;
        }
        self.remove_use(old, n);
        while self.nodes[n].inputs.len() <= idx {
            self.nodes[n].inputs.push(NodeId::INVALID);
        }
        self.nodes[n].inputs[idx] = new_in;
        self.add_use(new_in, n);
    }

    /// Record a commutative-input swap performed by canonicalization.
    pub fn mark_swapped_edges(&mut self, n: NodeId) {
        debug_assert!(self.nodes[n].op.is_commutative());
        self.nodes[n].flags |= flags::SWAPPED_EDGES;
    }

    // =========================================================================
    // Use-def chains
    // =========================================================================

    pub fn uses(&self, n: NodeId) -> &[NodeId] {
        self.uses.get(n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn use_count(&self, n: NodeId) -> usize {
        self.uses.get(n).map(|v| v.len()).unwrap_or(0)
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        if def.is_valid() {
            self.uses.entry(def).push(user);
        }
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        if !def.is_valid() {
            return;
        }
        if let Some(uses) = self.uses.get_mut(def) {
            if let Some(pos) = uses.iter().position(|&u| u == user) {
                uses.swap_remove(pos);
            }
        }
    }

    // =========================================================================
    // Control and dominance oracles
    // =========================================================================

    pub fn set_ctrl(&mut self, n: NodeId, c: NodeId) {
        debug_assert!(!self.nodes[n].is_cfg() || n == c);
        self.ctrl.set(n, c);
    }

    /// Controlling cfg node of `n`.
    #[inline]
    pub fn ctrl_of(&self, n: NodeId) -> NodeId {
        self.ctrl.value(n)
    }

    pub fn set_idom(&mut self, c: NodeId, dom: NodeId) {
        debug_assert!(self.nodes[c].is_cfg());
        self.idom.set(c, dom);
    }

    /// Does cfg node `a` dominate cfg node `b`?
    pub fn is_dominator(&self, a: NodeId, b: NodeId) -> bool {
        if !a.is_valid() || !b.is_valid() {
            return false;
        }
        let mut c = b;
        while c.is_valid() {
            if c == a {
                return true;
            }
            c = self.idom.value(c);
        }
        false
    }

    // =========================================================================
    // Alias oracle
    // =========================================================================

    pub fn set_alias_index(&mut self, mem: NodeId, idx: u32) {
        debug_assert!(self.nodes[mem].is_mem() || self.nodes[mem].is_memory_phi());
        self.alias.set(mem, idx);
    }

    /// Alias class of a memory node. Accesses with different classes are
    /// disjoint by construction.
    pub fn alias_index(&self, mem: NodeId) -> u32 {
        self.alias.value(mem)
    }

    // =========================================================================
    // Loop metadata
    // =========================================================================

    pub fn set_loop_meta(&mut self, cl: NodeId, meta: LoopMeta) {
        debug_assert!(matches!(self.nodes[cl].op, Opcode::CountedLoop));
        self.loop_meta.insert(cl, meta);
    }

    pub fn loop_meta(&self, cl: NodeId) -> Option<&LoopMeta> {
        self.loop_meta.get(&cl)
    }

    pub fn loop_meta_mut(&mut self, cl: NodeId) -> Option<&mut LoopMeta> {
        self.loop_meta.get_mut(&cl)
    }

    /// Constant stride of a counted loop, read off its `iv += stride` update.
    pub fn counted_loop_stride(&self, cl: NodeId) -> Option<i32> {
        let meta = self.loop_meta(cl)?;
        let incr = self.node(meta.iv).in_at(input::LOOP_BACKEDGE);
        if !incr.is_valid() {
            return None;
        }
        let incr_node = self.node(incr);
        match incr_node.op {
            Opcode::AddI => self.node(incr_node.in_at(2)).as_con_i(),
            Opcode::SubI => self.node(incr_node.in_at(2)).as_con_i().map(|c| -c),
            _ => None,
        }
    }

    /// Limit operand of a `CountedLoopEnd`: the second input of the compare
    /// under its `Bool` test.
    pub fn loop_end_limit(&self, end: NodeId) -> NodeId {
        let test = self.node(end).in_at(1);
        if !test.is_valid() || !matches!(self.node(test).op, Opcode::Bool) {
            return NodeId::INVALID;
        }
        let cmp = self.node(test).in_at(1);
        if !cmp.is_valid() || !matches!(self.node(cmp).op, Opcode::CmpI) {
            return NodeId::INVALID;
        }
        self.node(cmp).in_at(2)
    }

    // =========================================================================
    // Value numbering and sanctioned builders
    // =========================================================================

    /// Return the existing node for `(op, inputs)` or insert a new one.
    ///
    /// New nodes are pinned at the latest control among their inputs, so a
    /// combination of loop-invariant values stays out of the loop.
    pub fn value_number_or_insert(&mut self, op: Opcode, inputs: &[NodeId], ty: ValueType) -> NodeId {
        let key: GvnKey = (op, inputs.iter().copied().collect());
        if let Some(&existing) = self.gvn.get(&key) {
            return existing;
        }
        let id = self.new_node(op, inputs, ty);
        let c = self.late_ctrl(inputs);
        self.set_ctrl(id, c);
        self.gvn.insert(key, id);
        id
    }

    fn late_ctrl(&self, inputs: &[NodeId]) -> NodeId {
        let mut candidate = self.start;
        for &in_id in inputs {
            if !in_id.is_valid() {
                continue;
            }
            let c = self.ctrl_of(in_id);
            if c.is_valid() && self.is_dominator(candidate, c) {
                candidate = c;
            }
        }
        candidate
    }

    pub fn make_con_i(&mut self, value: i32) -> NodeId {
        self.value_number_or_insert(Opcode::ConI(value), &[], ValueType::Int)
    }

    pub fn make_con_l(&mut self, value: i64) -> NodeId {
        self.value_number_or_insert(Opcode::ConL(value), &[], ValueType::Long)
    }

    /// Zero constant of the given integer kind.
    pub fn make_zero(&mut self, kind: ValueType) -> NodeId {
        match kind {
            ValueType::Long => self.make_con_l(0),
            _ => {
                debug_assert!(kind.is_int_family());
                self.make_con_i(0)
            }
        }
    }

    pub fn make_add(&mut self, a: NodeId, b: NodeId, kind: ValueType) -> NodeId {
        let (op, ty) = if kind == ValueType::Long {
            (Opcode::AddL, ValueType::Long)
        } else {
            (Opcode::AddI, ValueType::Int)
        };
        self.value_number_or_insert(op, &[NodeId::INVALID, a, b], ty)
    }

    pub fn make_sub(&mut self, a: NodeId, b: NodeId, kind: ValueType) -> NodeId {
        let (op, ty) = if kind == ValueType::Long {
            (Opcode::SubL, ValueType::Long)
        } else {
            (Opcode::SubI, ValueType::Int)
        };
        self.value_number_or_insert(op, &[NodeId::INVALID, a, b], ty)
    }

    pub fn make_shift_left(&mut self, x: NodeId, count: NodeId, kind: ValueType) -> NodeId {
        let (op, ty) = if kind == ValueType::Long {
            (Opcode::LShiftL, ValueType::Long)
        } else {
            (Opcode::LShiftI, ValueType::Int)
        };
        self.value_number_or_insert(op, &[NodeId::INVALID, x, count], ty)
    }

    pub fn make_conv_i2l(&mut self, x: NodeId) -> NodeId {
        self.value_number_or_insert(Opcode::ConvI2L, &[NodeId::INVALID, x], ValueType::Long)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph ({} nodes):", self.nodes.len())?;
        for (id, node) in self.nodes.iter() {
            writeln!(f, "  {:?}: {:?} {:?} {:?}", id, node.op, node.inputs, node.ty)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_graph_has_start_and_top() {
        let g = Graph::new();
        assert!(matches!(g.node(g.start).op, Opcode::Start));
        assert!(matches!(g.node(g.top()).op, Opcode::Top));
        assert_eq!(g.ctrl_of(g.start), g.start);
    }

    #[test]
    fn test_use_chains() {
        let mut g = Graph::new();
        let a = g.make_con_i(1);
        let b = g.make_con_i(2);
        let sum = g.new_node(Opcode::AddI, &[NodeId::INVALID, a, b], ValueType::Int);

        assert_eq!(g.uses(a), &[sum]);
        assert_eq!(g.uses(b), &[sum]);
        assert_eq!(g.use_count(sum), 0);
    }

    #[test]
    fn test_set_input_updates_uses() {
        let mut g = Graph::new();
        let a = g.make_con_i(1);
        let b = g.make_con_i(2);
        let sum = g.new_node(Opcode::AddI, &[NodeId::INVALID, a, a], ValueType::Int);

        g.set_input(sum, 2, b);
        assert_eq!(g.node(sum).in_at(2), b);
        assert_eq!(g.use_count(a), 1);
        assert_eq!(g.uses(b), &[sum]);
    }

    #[test]
    fn test_value_numbering_deduplicates() {
        let mut g = Graph::new();
        let a = g.make_con_i(7);
        let b = g.make_con_i(7);
        assert_eq!(a, b);

        let x = g.make_con_i(1);
        let s1 = g.make_add(a, x, ValueType::Int);
        let s2 = g.make_add(a, x, ValueType::Int);
        assert_eq!(s1, s2);

        let s3 = g.make_add(x, a, ValueType::Int);
        assert_ne!(s1, s3); // operand order is part of the value number
    }

    #[test]
    fn test_make_builders_types() {
        let mut g = Graph::new();
        let a = g.make_con_i(1);
        let zero_l = g.make_zero(ValueType::Long);
        assert_eq!(g.node(zero_l).as_con_l(), Some(0));

        let conv = g.make_conv_i2l(a);
        assert_eq!(g.node(conv).ty, ValueType::Long);
        let sum = g.make_add(conv, zero_l, ValueType::Long);
        assert!(matches!(g.node(sum).op, Opcode::AddL));

        let count = g.make_con_i(3);
        let sh = g.make_shift_left(a, count, ValueType::Int);
        assert!(matches!(g.node(sh).op, Opcode::LShiftI));
    }

    #[test]
    fn test_dominance_chain() {
        let mut g = Graph::new();
        let r1 = g.new_node(Opcode::IfTrue, &[], ValueType::Control);
        let r2 = g.new_node(Opcode::IfFalse, &[], ValueType::Control);
        g.set_idom(r1, g.start);
        g.set_idom(r2, r1);

        assert!(g.is_dominator(g.start, r2));
        assert!(g.is_dominator(r1, r2));
        assert!(g.is_dominator(r2, r2));
        assert!(!g.is_dominator(r2, r1));
        assert!(!g.is_dominator(r1, g.start));
    }

    #[test]
    fn test_new_nodes_pinned_at_latest_input_ctrl() {
        let mut g = Graph::new();
        let inner = g.new_node(Opcode::IfTrue, &[], ValueType::Control);
        g.set_idom(inner, g.start);

        let a = g.make_con_i(1); // ctrl = start
        let b = g.new_node(Opcode::Parm(0), &[], ValueType::Int);
        g.set_ctrl(b, inner);

        let sum = g.make_add(a, b, ValueType::Int);
        assert_eq!(g.ctrl_of(sum), inner);
    }

    #[test]
    fn test_alias_oracle() {
        let mut g = Graph::new();
        let load = g.new_node(Opcode::Load(crate::ir::operators::MemKind::Int), &[], ValueType::Int);
        g.set_alias_index(load, 5);
        assert_eq!(g.alias_index(load), 5);
    }

    #[test]
    fn test_counted_loop_stride() {
        let mut g = Graph::new();
        let cl = g.new_node(Opcode::CountedLoop, &[], ValueType::Control);
        let init = g.make_con_i(0);
        let iv = g.new_node(Opcode::Phi, &[cl, init, NodeId::INVALID], ValueType::Int);
        let stride = g.make_con_i(3);
        let incr = g.new_node(Opcode::AddI, &[NodeId::INVALID, iv, stride], ValueType::Int);
        g.set_input(iv, input::LOOP_BACKEDGE, incr);
        let end = g.new_node(Opcode::CountedLoopEnd, &[cl], ValueType::Control);
        g.set_loop_meta(cl, LoopMeta::new(LoopKind::Normal, iv, end));

        assert_eq!(g.counted_loop_stride(cl), Some(3));
    }
}
