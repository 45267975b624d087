//! Construction of counted loops in canonical shape.
//!
//! The vectorization analysis expects the loop form the loop optimizer
//! produces: a `CountedLoop` head whose phis merge the entry value with the
//! backedge value, a `CountedLoopEnd` exit test over `Bool(CmpI(incr,
//! limit))`, an `IfTrue` backedge and an `IfFalse` exit, and, for split
//! loops, a pre-loop whose limit is hidden behind `Opaque1` so it stays
//! rewritable. [`LoopGraphBuilder`] assembles exactly that shape, which makes
//! it both the host-integration surface and the substrate for tests.

use super::graph::{Graph, LoopKind, LoopMeta};
use super::node::{input, NodeId};
use super::operators::{MemKind, Opcode};
use super::types::ValueType;

/// Handles to the nodes of one constructed counted loop.
#[derive(Debug, Clone, Copy)]
pub struct CountedLoopParts {
    pub cl: NodeId,
    pub iv: NodeId,
    pub incr: NodeId,
    pub loop_end: NodeId,
    /// `IfTrue` projection feeding the backedge.
    pub back: NodeId,
    /// `IfFalse` projection leaving the loop.
    pub exit: NodeId,
}

/// Builder for graphs containing counted loops.
pub struct LoopGraphBuilder {
    pub graph: Graph,
}

impl LoopGraphBuilder {
    pub fn new() -> Self {
        LoopGraphBuilder {
            graph: Graph::new(),
        }
    }

    // =========================================================================
    // Leaves
    // =========================================================================

    pub fn con_i(&mut self, value: i32) -> NodeId {
        self.graph.make_con_i(value)
    }

    pub fn con_l(&mut self, value: i64) -> NodeId {
        self.graph.make_con_l(value)
    }

    /// Loop-invariant incoming value (array base, bound, symbolic offset).
    pub fn parm(&mut self, index: u16, ty: ValueType) -> NodeId {
        let n = self.graph.new_node(Opcode::Parm(index), &[], ty);
        let start = self.graph.start;
        self.graph.set_ctrl(n, start);
        n
    }

    /// Initial memory state for one alias class.
    pub fn initial_memory(&mut self, index: u16) -> NodeId {
        let n = self.graph.new_node(Opcode::Parm(index), &[], ValueType::Memory);
        let start = self.graph.start;
        self.graph.set_ctrl(n, start);
        n
    }

    // =========================================================================
    // Loop skeletons
    // =========================================================================

    /// Build one counted loop `for (iv = init; cmp(iv + stride, limit); iv +=
    /// stride)` entered from `entry`. Registers its [`LoopMeta`].
    pub fn counted_loop(
        &mut self,
        entry: NodeId,
        init: NodeId,
        limit: NodeId,
        stride: i32,
        kind: LoopKind,
    ) -> CountedLoopParts {
        let g = &mut self.graph;
        let cl = g.new_node(
            Opcode::CountedLoop,
            &[NodeId::INVALID, entry, NodeId::INVALID],
            ValueType::Control,
        );
        g.set_idom(cl, entry);

        let iv = g.new_node(Opcode::Phi, &[cl, init, NodeId::INVALID], ValueType::Int);
        g.set_ctrl(iv, cl);

        let stride_con = g.make_con_i(stride);
        let incr = g.new_node(Opcode::AddI, &[NodeId::INVALID, iv, stride_con], ValueType::Int);
        g.set_ctrl(incr, cl);

        let cmp = g.new_node(Opcode::CmpI, &[NodeId::INVALID, incr, limit], ValueType::Int);
        g.set_ctrl(cmp, cl);
        let test = g.new_node(Opcode::Bool, &[NodeId::INVALID, cmp], ValueType::Int);
        g.set_ctrl(test, cl);

        let loop_end = g.new_node(Opcode::CountedLoopEnd, &[cl, test], ValueType::Control);
        g.set_idom(loop_end, cl);
        let back = g.new_node(Opcode::IfTrue, &[loop_end], ValueType::Control);
        g.set_idom(back, loop_end);
        let exit = g.new_node(Opcode::IfFalse, &[loop_end], ValueType::Control);
        g.set_idom(exit, loop_end);

        g.set_input(cl, input::LOOP_BACKEDGE, back);
        g.set_input(iv, input::LOOP_BACKEDGE, incr);

        g.set_loop_meta(cl, LoopMeta::new(kind, iv, loop_end));

        CountedLoopParts {
            cl,
            iv,
            incr,
            loop_end,
            back,
            exit,
        }
    }

    /// Build a pre/main loop pair as produced by loop splitting: the
    /// pre-loop's limit is wrapped in `Opaque1`, the main loop runs with
    /// `pre_stride * unroll` and is linked to its pre-loop.
    pub fn pre_main_loops(
        &mut self,
        init: NodeId,
        limit: NodeId,
        pre_stride: i32,
        unroll: u32,
    ) -> (CountedLoopParts, CountedLoopParts) {
        let start = self.graph.start;
        let opaque = self
            .graph
            .new_node(Opcode::Opaque1, &[NodeId::INVALID, limit], ValueType::Int);
        self.graph.set_ctrl(opaque, start);

        let pre = self.counted_loop(start, init, opaque, pre_stride, LoopKind::Pre);
        let main = self.counted_loop(
            pre.exit,
            init,
            limit,
            pre_stride * unroll as i32,
            LoopKind::Main,
        );

        let meta = self.graph.loop_meta_mut(main.cl).unwrap();
        meta.slp_max_unroll = unroll;
        meta.pre_loop_end = Some(pre.loop_end);
        meta.pre_loop_head = Some(pre.cl);
        (pre, main)
    }

    /// Memory phi merging `entry_mem` with the slice's backedge state.
    pub fn mem_phi(&mut self, cl: NodeId, entry_mem: NodeId, alias: u32) -> NodeId {
        let phi = self.graph.new_node(
            Opcode::Phi,
            &[cl, entry_mem, NodeId::INVALID],
            ValueType::Memory,
        );
        self.graph.set_ctrl(phi, cl);
        self.graph.set_alias_index(phi, alias);
        phi
    }

    // =========================================================================
    // Addresses and memory ops
    // =========================================================================

    /// Canonical array element address:
    /// `AddP(base, AddP(base, base, LShiftL(ConvI2L(index), shift)), header)`.
    pub fn index_addr(&mut self, base: NodeId, index: NodeId, shift: i32, header: i64) -> NodeId {
        let g = &mut self.graph;
        let conv = g.make_conv_i2l(index);
        let count = g.make_con_i(shift);
        let scaled = g.make_shift_left(conv, count, ValueType::Long);
        let inner = g.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, base, scaled],
            ValueType::Object,
        );
        let hdr = g.make_con_l(header);
        g.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, inner, hdr],
            ValueType::Object,
        )
    }

    /// Flat address `AddP(base, base, offset_node)` for invariant offsets.
    pub fn base_offset_addr(&mut self, base: NodeId, offset: NodeId) -> NodeId {
        self.graph.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, base, offset],
            ValueType::Object,
        )
    }

    pub fn load(
        &mut self,
        ctrl: NodeId,
        mem: NodeId,
        addr: NodeId,
        kind: MemKind,
        alias: u32,
    ) -> NodeId {
        let n = self
            .graph
            .new_node(Opcode::Load(kind), &[ctrl, mem, addr], kind.value_type());
        self.graph.set_ctrl(n, ctrl);
        self.graph.set_alias_index(n, alias);
        n
    }

    pub fn store(
        &mut self,
        ctrl: NodeId,
        mem: NodeId,
        addr: NodeId,
        value: NodeId,
        kind: MemKind,
        alias: u32,
    ) -> NodeId {
        let n = self.graph.new_node(
            Opcode::Store(kind),
            &[ctrl, mem, addr, value],
            ValueType::Memory,
        );
        self.graph.set_ctrl(n, ctrl);
        self.graph.set_alias_index(n, alias);
        n
    }

    /// Card-mark store; `oop_store` is its precedence edge.
    pub fn store_cm(
        &mut self,
        ctrl: NodeId,
        mem: NodeId,
        addr: NodeId,
        value: NodeId,
        oop_store: NodeId,
        alias: u32,
    ) -> NodeId {
        let n = self.graph.new_node(
            Opcode::StoreCM,
            &[ctrl, mem, addr, value, oop_store],
            ValueType::Memory,
        );
        self.graph.set_ctrl(n, ctrl);
        self.graph.set_alias_index(n, alias);
        n
    }

    // =========================================================================
    // Loop membership
    // =========================================================================

    /// Raw body of a loop: the head, its exit test and backedge projection,
    /// and every node controlled by the head.
    pub fn loop_body(&self, cl: NodeId) -> Vec<NodeId> {
        let g = &self.graph;
        let meta = g.loop_meta(cl).expect("counted loop");
        let mut body = vec![cl, meta.loop_end, g.node(cl).in_at(input::LOOP_BACKEDGE)];
        for n in g.ids() {
            if n != cl && g.ctrl_of(n) == cl {
                body.push(n);
            }
        }
        body
    }
}

impl Default for LoopGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
