//! Address disassembly.
//!
//! A [`VPointer`] is the canonical linear form of one in-loop memory access:
//!
//! ```text
//! address = base + offset + invar + scale * iv
//! ```
//!
//! where `base` is the loop-invariant object address, `offset` the sum of all
//! constant terms, `invar` an optional aggregated loop-invariant node, and
//! `scale` the factor on the induction variable. Matching is a partial
//! function: anything that does not fit yields an invalid pointer, which must
//! never be used for aliasing or alignment decisions.
//!
//! Aggregating several invariant terms materializes sums, negations and
//! shifts through the graph's value-numbering table. Analyze-only runs (used
//! by unroll analysis) instead record every traversed loop-variant node on a
//! caller-provided stack and never touch the graph.

use log::trace;

use crate::ir::graph::Graph;
use crate::ir::node::{input, NodeId};
use crate::ir::operators::Opcode;
use crate::ir::types::ValueType;

use super::vloop::VLoop;

// =============================================================================
// Comparison result
// =============================================================================

/// Outcome of comparing two decomposed pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerCmp {
    /// Accesses overlap in every iteration.
    Equal,
    /// Provably disjoint, left strictly below right.
    Less,
    /// Provably disjoint, left strictly above right.
    Greater,
    /// Provably different addresses without a known order.
    NotEqual,
    /// Nothing can be concluded; must be treated as may-alias.
    Unknown,
}

impl PointerCmp {
    /// Provably not the same address.
    #[inline]
    pub const fn is_not_equal(self) -> bool {
        matches!(self, PointerCmp::Less | PointerCmp::Greater | PointerCmp::NotEqual)
    }
}

// =============================================================================
// VPointer
// =============================================================================

/// Decomposed address of one memory node.
#[derive(Debug, Clone)]
pub struct VPointer {
    mem: NodeId,
    base: NodeId,
    adr: NodeId,
    scale: i32,
    offset: i32,
    invar: Option<NodeId>,
    valid: bool,
}

impl VPointer {
    /// Disassemble the address of `mem`. May create (value-numbered) nodes
    /// when several invariant terms have to be combined.
    pub fn new(graph: &mut Graph, vloop: &VLoop, mem: NodeId) -> VPointer {
        PointerParser {
            graph: GraphCtx::Mutable(graph),
            vloop,
            scale: 0,
            offset: 0,
            invar: None,
            stack: None,
        }
        .parse(mem)
    }

    /// Analyze-only disassembly: traversed loop-variant nodes are pushed on
    /// `stack`, and the graph is never mutated.
    pub fn analyze(graph: &Graph, vloop: &VLoop, mem: NodeId, stack: &mut Vec<NodeId>) -> VPointer {
        PointerParser {
            graph: GraphCtx::ReadOnly(graph),
            vloop,
            scale: 0,
            offset: 0,
            invar: None,
            stack: Some(stack),
        }
        .parse(mem)
    }

    fn invalid(mem: NodeId) -> VPointer {
        VPointer {
            mem,
            base: NodeId::INVALID,
            adr: NodeId::INVALID,
            scale: 0,
            offset: 0,
            invar: None,
            valid: false,
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn mem(&self) -> NodeId {
        self.mem
    }

    #[inline]
    pub fn base(&self) -> NodeId {
        self.base
    }

    #[inline]
    pub fn adr(&self) -> NodeId {
        self.adr
    }

    /// Factor on the induction variable; zero when the address is
    /// loop-invariant.
    #[inline]
    pub fn scale(&self) -> i32 {
        self.scale
    }

    #[inline]
    pub fn offset(&self) -> i32 {
        self.offset
    }

    #[inline]
    pub fn invar(&self) -> Option<NodeId> {
        self.invar
    }

    #[inline]
    pub fn has_iv(&self) -> bool {
        self.scale != 0
    }

    /// Access width of the underlying memory node in bytes.
    pub fn memory_size(&self, graph: &Graph) -> i32 {
        match graph.node(self.mem).op {
            Opcode::Load(k) | Opcode::Store(k) => k.size_in_bytes(),
            Opcode::StoreCM => 1,
            _ => 0,
        }
    }

    /// Biggest detectable constant factor of the invariant: `2^k` for a
    /// constant left shift, 1 for any other invariant, 0 when absent.
    pub fn invar_factor(&self, graph: &Graph) -> i32 {
        let Some(inv) = self.invar else {
            return 0;
        };
        let n = graph.node(inv);
        if matches!(n.op, Opcode::LShiftI | Opcode::LShiftL) {
            if let Some(c) = graph.node(n.in_at(2)).as_con_i() {
                return 1 << c;
            }
        }
        1
    }

    /// Compare two pointers. They are comparable only when `base`, `adr`,
    /// `invar` and `scale` agree; the order then follows from the offsets and
    /// access sizes.
    pub fn cmp(&self, graph: &Graph, other: &VPointer) -> PointerCmp {
        let comparable = self.valid
            && other.valid
            && (self.adr == other.adr || (self.base == self.adr && other.base == other.adr))
            && self.scale == other.scale
            && self.invar == other.invar;
        if !comparable {
            return PointerCmp::Unknown;
        }
        let overlap = other.offset < self.offset + self.memory_size(graph)
            && self.offset < other.offset + other.memory_size(graph);
        if overlap {
            PointerCmp::Equal
        } else if self.offset < other.offset {
            PointerCmp::Less
        } else {
            PointerCmp::Greater
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

enum GraphCtx<'g> {
    Mutable(&'g mut Graph),
    ReadOnly(&'g Graph),
}

impl<'g> GraphCtx<'g> {
    #[inline]
    fn get(&self) -> &Graph {
        match self {
            GraphCtx::Mutable(g) => g,
            GraphCtx::ReadOnly(g) => g,
        }
    }
}

struct PointerParser<'a, 's> {
    graph: GraphCtx<'a>,
    vloop: &'a VLoop,
    scale: i32,
    offset: i32,
    invar: Option<NodeId>,
    stack: Option<&'s mut Vec<NodeId>>,
}

impl<'a, 's> PointerParser<'a, 's> {
    fn parse(mut self, mem: NodeId) -> VPointer {
        let mut adr = self.in_at(mem, input::MEM_ADDRESS);
        if !adr.is_valid() || self.op(adr) != Opcode::AddP {
            return VPointer::invalid(mem);
        }
        // Match AddP(base, AddP(ptr, k*iv [+ invariant]), constant).
        let base = self.in_at(adr, input::ADDP_BASE);
        if !base.is_valid() {
            return VPointer::invalid(mem);
        }
        if self.is_member(base) {
            // Base address must be loop invariant.
            return VPointer::invalid(mem);
        }
        let base_is_top = self.op(base) == Opcode::Top;
        if base_is_top && !self.vloop.platform().misaligned_vectors_ok {
            // Unsafe references require misaligned vector access support.
            return VPointer::invalid(mem);
        }

        loop {
            let off = self.in_at(adr, input::ADDP_OFFSET);
            if !self.scaled_iv_plus_offset(off) {
                trace!("VPointer: address of {:?} too complex at {:?}", mem, off);
                return VPointer::invalid(mem);
            }
            adr = self.in_at(adr, input::ADDP_ADDRESS);
            if base == adr || !adr.is_valid() || self.op(adr) != Opcode::AddP {
                break;
            }
        }
        if !adr.is_valid() {
            return VPointer::invalid(mem);
        }

        if self.is_member(adr) {
            return VPointer::invalid(mem);
        }
        if !base_is_top && adr != base {
            return VPointer::invalid(mem);
        }

        VPointer {
            mem,
            base,
            adr,
            scale: self.scale,
            offset: self.offset,
            invar: self.invar,
            valid: true,
        }
    }

    // -------------------------------------------------------------------------
    // Matchers
    // -------------------------------------------------------------------------

    /// Match `k*iv + offset` where `k` may be zero and `offset` is
    /// `(k2 [+/- invariant])`.
    fn scaled_iv_plus_offset(&mut self, n: NodeId) -> bool {
        if !n.is_valid() {
            return false;
        }
        if self.scaled_iv(n) {
            return true;
        }
        if self.offset_plus_k(n, false) {
            return true;
        }
        match self.op(n) {
            Opcode::AddI => {
                if self.offset_plus_k(self.in_at(n, 2), false)
                    && self.scaled_iv_plus_offset(self.in_at(n, 1))
                {
                    return true;
                }
                if self.offset_plus_k(self.in_at(n, 1), false)
                    && self.scaled_iv_plus_offset(self.in_at(n, 2))
                {
                    return true;
                }
            }
            Opcode::SubI | Opcode::SubL => {
                if self.offset_plus_k(self.in_at(n, 2), true)
                    && self.scaled_iv_plus_offset(self.in_at(n, 1))
                {
                    return true;
                }
                if self.offset_plus_k(self.in_at(n, 1), false)
                    && self.scaled_iv_plus_offset(self.in_at(n, 2))
                {
                    // Scaled term sits on the right of the subtraction.
                    self.scale = -self.scale;
                    return true;
                }
            }
            _ => {}
        }
        false
    }

    /// Match `k*iv` where `k` is a non-zero constant.
    fn scaled_iv(&mut self, n: NodeId) -> bool {
        if !n.is_valid() {
            return false;
        }
        if self.scale != 0 {
            // Already found a scaled term.
            return false;
        }
        if n == self.vloop.iv() {
            self.scale = 1;
            return true;
        }
        self.maybe_record(n);

        match self.op(n) {
            Opcode::MulI => {
                let (a, b) = (self.in_at(n, 1), self.in_at(n, 2));
                if a == self.vloop.iv() {
                    if let Some(c) = self.con_i(b) {
                        self.scale = c;
                        return true;
                    }
                } else if b == self.vloop.iv() {
                    if let Some(c) = self.con_i(a) {
                        self.scale = c;
                        return true;
                    }
                }
            }
            Opcode::LShiftI => {
                if self.in_at(n, 1) == self.vloop.iv() {
                    if let Some(c) = self.con_i(self.in_at(n, 2)) {
                        self.scale = 1 << c;
                        return true;
                    }
                }
            }
            Opcode::ConvI2L | Opcode::CastII => {
                return self.scaled_iv_plus_offset(self.in_at(n, 1));
            }
            Opcode::LShiftL => {
                if let Some(shift) = self.con_i(self.in_at(n, 2)) {
                    if !self.has_iv() {
                        return self.scaled_iv_under_shift(n, shift);
                    }
                }
            }
            _ => {}
        }
        false
    }

    /// `(scaled_iv_plus_offset(x)) << shift`: match the subtree with a clean
    /// state, then scale the discovered terms by `2^shift` and fold them into
    /// the enclosing expression.
    fn scaled_iv_under_shift(&mut self, n: NodeId, shift: i32) -> bool {
        let saved_scale = self.scale;
        let saved_offset = self.offset;
        let saved_invar = self.invar;
        self.scale = 0;
        self.offset = 0;
        self.invar = None;

        if !self.scaled_iv_plus_offset(self.in_at(n, 1)) {
            self.scale = saved_scale;
            self.offset = saved_offset;
            self.invar = saved_invar;
            return false;
        }

        let sub_scale = self.scale;
        let sub_offset = self.offset;
        let sub_invar = self.invar;
        self.scale = saved_scale;
        self.offset = saved_offset;
        self.invar = saved_invar;

        self.scale = sub_scale.wrapping_shl(shift as u32);
        self.offset = self
            .offset
            .wrapping_add(sub_offset.wrapping_shl(shift as u32));
        if let Some(inv) = sub_invar {
            let count = self.in_at(n, 2);
            let shifted = self.shift_invar(inv, count);
            self.add_to_invar(shifted, false);
        }
        true
    }

    /// Match `k [+/- invariant]` where `k` may be zero and the invariant is
    /// optional, but not both absent.
    fn offset_plus_k(&mut self, n: NodeId, negate: bool) -> bool {
        if !n.is_valid() {
            return false;
        }
        match self.op(n) {
            Opcode::ConI(v) => {
                self.offset = self
                    .offset
                    .wrapping_add(if negate { v.wrapping_neg() } else { v });
                return true;
            }
            Opcode::ConL(v) => {
                // Acceptable only if the value fits into 32 bits.
                if let Ok(off) = i32::try_from(v) {
                    self.offset = self
                        .offset
                        .wrapping_add(if negate { off.wrapping_neg() } else { off });
                    return true;
                }
                return false;
            }
            _ => {}
        }
        self.maybe_record(n);

        let op = self.op(n);
        if op == Opcode::AddI {
            let (a, b) = (self.in_at(n, 1), self.in_at(n, 2));
            if let Some(c) = self.con_i(b) {
                if self.invariant(a) {
                    self.add_to_invar(a, negate);
                    self.offset = self
                        .offset
                        .wrapping_add(if negate { c.wrapping_neg() } else { c });
                    return true;
                }
            }
            if let Some(c) = self.con_i(a) {
                if self.invariant(b) {
                    self.offset = self
                        .offset
                        .wrapping_add(if negate { c.wrapping_neg() } else { c });
                    self.add_to_invar(b, negate);
                    return true;
                }
            }
        }
        if op == Opcode::SubI {
            let (a, b) = (self.in_at(n, 1), self.in_at(n, 2));
            if let Some(c) = self.con_i(b) {
                if self.invariant(a) {
                    self.add_to_invar(a, negate);
                    self.offset = self
                        .offset
                        .wrapping_add(if !negate { c.wrapping_neg() } else { c });
                    return true;
                }
            }
            if let Some(c) = self.con_i(a) {
                if self.invariant(b) {
                    self.offset = self
                        .offset
                        .wrapping_add(if negate { c.wrapping_neg() } else { c });
                    self.add_to_invar(b, !negate);
                    return true;
                }
            }
        }

        if !self.is_member(n) {
            // A bare invariant, possibly behind one ConvI2L and one CastII.
            let mut m = n;
            if self.op(m) == Opcode::ConvI2L {
                m = self.in_at(m, 1);
            }
            if m.is_valid() && self.op(m) == Opcode::CastII {
                m = self.in_at(m, 1);
            }
            if m.is_valid() && self.invariant(m) {
                self.add_to_invar(m, negate);
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Invariant aggregation
    // -------------------------------------------------------------------------

    fn add_to_invar(&mut self, new_invar: NodeId, negate: bool) {
        let new_invar = self.maybe_negate_invar(negate, new_invar);
        let Some(current) = self.invar else {
            self.invar = Some(new_invar);
            return;
        };
        match &mut self.graph {
            // Analysis-only runs never mutate the graph; the first recorded
            // invariant stands in for the aggregate.
            GraphCtx::ReadOnly(_) => {}
            GraphCtx::Mutable(g) => {
                let g = &mut **g;
                let current_kind = invar_kind(g, current);
                let new_kind = invar_kind(g, new_invar);
                // Widen to long when either side is long.
                let kind = if current_kind == ValueType::Long || new_kind == ValueType::Long {
                    ValueType::Long
                } else {
                    ValueType::Int
                };
                let mut current = current;
                let mut new_invar = new_invar;
                if current_kind != kind {
                    current = g.make_conv_i2l(current);
                }
                if new_kind != kind {
                    new_invar = g.make_conv_i2l(new_invar);
                }
                self.invar = Some(g.make_add(current, new_invar, kind));
            }
        }
    }

    fn maybe_negate_invar(&mut self, negate: bool, invar: NodeId) -> NodeId {
        if !negate {
            return invar;
        }
        match &mut self.graph {
            GraphCtx::ReadOnly(_) => invar,
            GraphCtx::Mutable(g) => {
                let g = &mut **g;
                let kind = invar_kind(g, invar);
                let zero = g.make_zero(kind);
                g.make_sub(zero, invar, kind)
            }
        }
    }

    fn shift_invar(&mut self, invar: NodeId, count: NodeId) -> NodeId {
        match &mut self.graph {
            GraphCtx::ReadOnly(_) => invar,
            GraphCtx::Mutable(g) => {
                let g = &mut **g;
                let kind = invar_kind(g, invar);
                g.make_shift_left(invar, count, kind)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Graph access helpers
    // -------------------------------------------------------------------------

    #[inline]
    fn op(&self, n: NodeId) -> Opcode {
        self.graph.get().node(n).op
    }

    #[inline]
    fn in_at(&self, n: NodeId, i: usize) -> NodeId {
        self.graph.get().node(n).in_at(i)
    }

    #[inline]
    fn con_i(&self, n: NodeId) -> Option<i32> {
        if n.is_valid() {
            self.graph.get().node(n).as_con_i()
        } else {
            None
        }
    }

    #[inline]
    fn is_member(&self, n: NodeId) -> bool {
        self.vloop.is_loop_member(self.graph.get(), n)
    }

    #[inline]
    fn invariant(&self, n: NodeId) -> bool {
        self.vloop.is_invariant(self.graph.get(), n)
    }

    #[inline]
    fn has_iv(&self) -> bool {
        self.scale != 0
    }

    /// Analyze-only runs record every traversed loop-variant node.
    fn maybe_record(&mut self, n: NodeId) {
        if self.stack.is_some() && self.is_member(n) {
            self.stack.as_mut().unwrap().push(n);
        }
    }
}

/// Integer kind of an invariant term. Everything in the int family counts as
/// `Int`; `Long` stands alone.
fn invar_kind(graph: &Graph, n: NodeId) -> ValueType {
    let ty = graph.node(n).ty;
    debug_assert!(ty.is_integral(), "invariant must be int or long");
    if ty == ValueType::Long {
        ValueType::Long
    } else {
        ValueType::Int
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
    use crate::ir::operators::MemKind;
    use crate::vectorize::Platform;

    const HEADER: i64 = 16;

    fn loop_with_store() -> (LoopGraphBuilder, CountedLoopParts, NodeId, NodeId) {
        let mut b = LoopGraphBuilder::new();
        let init = b.con_i(0);
        let limit = b.parm(0, ValueType::Int);
        let base = b.parm(1, ValueType::Object);
        let mem0 = b.initial_memory(2);
        let start = b.graph.start;
        let lp = b.counted_loop(start, init, limit, 1, LoopKind::Normal);
        let phi = b.mem_phi(lp.cl, mem0, 1);
        (b, lp, base, phi)
    }

    fn vloop_for(b: &LoopGraphBuilder, lp: &CountedLoopParts) -> VLoop {
        let mut vloop = VLoop::new(lp.cl, b.loop_body(lp.cl), Platform::default(), false);
        vloop.check_preconditions(&b.graph).unwrap();
        vloop
    }

    #[test]
    fn test_array_element_address() {
        // a[i] with 4-byte elements and a 16-byte header.
        let (mut b, lp, base, phi) = loop_with_store();
        let addr = b.index_addr(base, lp.iv, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.base(), base);
        assert_eq!(p.adr(), base);
        assert_eq!(p.scale(), 4);
        assert_eq!(p.offset(), 16);
        assert_eq!(p.invar(), None);
        assert!(p.has_iv());
        assert_eq!(p.memory_size(&b.graph), 4);
        assert_eq!(p.invar_factor(&b.graph), 0);
    }

    #[test]
    fn test_constant_index_offset_is_scaled() {
        // a[i + 3]: the constant rides up through the element shift.
        let (mut b, lp, base, phi) = loop_with_store();
        let three = b.con_i(3);
        let idx = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, three], ValueType::Int);
        b.graph.set_ctrl(idx, lp.cl);
        let addr = b.index_addr(base, idx, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
        assert_eq!(p.offset(), 16 + 3 * 4);
    }

    #[test]
    fn test_invariant_index_term() {
        // a[i + k]: the invariant is wrapped in the element shift.
        let (mut b, lp, base, phi) = loop_with_store();
        let k = b.parm(3, ValueType::Int);
        let idx = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, k], ValueType::Int);
        b.graph.set_ctrl(idx, lp.cl);
        let addr = b.index_addr(base, idx, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
        assert_eq!(p.offset(), 16);
        let inv = p.invar().expect("invariant expected");
        assert!(matches!(b.graph.node(inv).op, Opcode::LShiftI));
        assert_eq!(p.invar_factor(&b.graph), 4);
    }

    #[test]
    fn test_mul_scaled_iv() {
        // Flat address base + 16 + ConvI2L(iv * 8).
        let (mut b, lp, base, phi) = loop_with_store();
        let eight = b.con_i(8);
        let mul = b
            .graph
            .new_node(Opcode::MulI, &[NodeId::INVALID, lp.iv, eight], ValueType::Int);
        b.graph.set_ctrl(mul, lp.cl);
        let conv = b.graph.make_conv_i2l(mul);
        let inner = b.base_offset_addr(base, conv);
        let hdr = b.con_l(HEADER);
        let addr = b.graph.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, inner, hdr],
            ValueType::Object,
        );
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Long, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 8);
        assert_eq!(p.offset(), 16);

        // Constant on the left commutes.
        let mul2 = b
            .graph
            .new_node(Opcode::MulI, &[NodeId::INVALID, eight, lp.iv], ValueType::Int);
        b.graph.set_ctrl(mul2, lp.cl);
        let conv2 = b.graph.make_conv_i2l(mul2);
        let inner2 = b.base_offset_addr(base, conv2);
        let addr2 = b.graph.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, inner2, hdr],
            ValueType::Object,
        );
        let ld = b.load(lp.cl, phi, addr2, MemKind::Long, 1);
        let p2 = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(p2.valid());
        assert_eq!(p2.scale(), 8);
    }

    #[test]
    fn test_sub_negates_scale() {
        // a[k - i]: scale becomes negative, invariant carries k.
        let (mut b, lp, base, phi) = loop_with_store();
        let k = b.parm(3, ValueType::Int);
        let idx = b
            .graph
            .new_node(Opcode::SubI, &[NodeId::INVALID, k, lp.iv], ValueType::Int);
        b.graph.set_ctrl(idx, lp.cl);
        let addr = b.index_addr(base, idx, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), -4);
        assert!(p.invar().is_some());
    }

    #[test]
    fn test_combined_invariants_build_sum() {
        // a[i + k1 + k2]: both invariants aggregate into one node.
        let (mut b, lp, base, phi) = loop_with_store();
        let k1 = b.parm(3, ValueType::Int);
        let k2 = b.parm(4, ValueType::Int);
        let t = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, k1], ValueType::Int);
        b.graph.set_ctrl(t, lp.cl);
        let idx = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, t, k2], ValueType::Int);
        b.graph.set_ctrl(idx, lp.cl);
        let addr = b.index_addr(base, idx, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
        let inv = p.invar().expect("aggregated invariant");
        // The aggregate sits under the element shift.
        assert!(matches!(b.graph.node(inv).op, Opcode::LShiftI));
        let sum = b.graph.node(inv).in_at(1);
        assert!(matches!(b.graph.node(sum).op, Opcode::AddI));
    }

    #[test]
    fn test_large_long_constant_rejected() {
        let (mut b, lp, base, phi) = loop_with_store();
        let conv = b.graph.make_conv_i2l(lp.iv);
        let inner = b.base_offset_addr(base, conv);
        let huge = b.con_l(1 << 40);
        let addr = b.graph.value_number_or_insert(
            Opcode::AddP,
            &[NodeId::INVALID, base, inner, huge],
            ValueType::Object,
        );
        let ld = b.load(lp.cl, phi, addr, MemKind::Byte, 1);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(!p.valid());
    }

    #[test]
    fn test_non_addp_address_rejected() {
        let (mut b, lp, base, phi) = loop_with_store();
        let ld = b.load(lp.cl, phi, base, MemKind::Int, 1);
        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(!p.valid());
    }

    #[test]
    fn test_loop_variant_base_rejected() {
        let (mut b, lp, _base, phi) = loop_with_store();
        let variant_base = b.graph.new_node(Opcode::Parm(9), &[], ValueType::Object);
        b.graph.set_ctrl(variant_base, lp.cl);
        let addr = b.index_addr(variant_base, lp.iv, 2, HEADER);
        let ld = b.load(lp.cl, phi, addr, MemKind::Int, 1);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(!p.valid());
    }

    #[test]
    fn test_top_base_needs_misaligned_support() {
        let (mut b, lp, _base, phi) = loop_with_store();
        let top = b.graph.top();
        let addr = b.index_addr(top, lp.iv, 0, 0);
        let ld = b.load(lp.cl, phi, addr, MemKind::Byte, 1);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(p.valid());
        assert_eq!(p.scale(), 1);

        let mut strict = Platform::default();
        strict.misaligned_vectors_ok = false;
        let mut vloop2 = VLoop::new(lp.cl, b.loop_body(lp.cl), strict, false);
        vloop2.check_preconditions(&b.graph).unwrap();
        let p2 = VPointer::new(&mut b.graph, &vloop2, ld);
        assert!(!p2.valid());
    }

    #[test]
    fn test_cmp_orders_disjoint_accesses() {
        let (mut b, lp, base, phi) = loop_with_store();
        let addr_a = b.index_addr(base, lp.iv, 2, HEADER);
        let one = b.con_i(1);
        let idx1 = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, one], ValueType::Int);
        b.graph.set_ctrl(idx1, lp.cl);
        let addr_b = b.index_addr(base, idx1, 2, HEADER);

        let ld_a = b.load(lp.cl, phi, addr_a, MemKind::Int, 1);
        let ld_a2 = b.load(lp.cl, phi, addr_a, MemKind::Int, 1);
        let ld_b = b.load(lp.cl, phi, addr_b, MemKind::Int, 1);

        let vloop = vloop_for(&b, &lp);
        let pa = VPointer::new(&mut b.graph, &vloop, ld_a);
        let pa2 = VPointer::new(&mut b.graph, &vloop, ld_a2);
        let pb = VPointer::new(&mut b.graph, &vloop, ld_b);

        assert_eq!(pa.cmp(&b.graph, &pa2), PointerCmp::Equal);
        assert_eq!(pa.cmp(&b.graph, &pb), PointerCmp::Less);
        assert_eq!(pb.cmp(&b.graph, &pa), PointerCmp::Greater);
        assert!(pa.cmp(&b.graph, &pb).is_not_equal());
        assert!(!pa.cmp(&b.graph, &pa2).is_not_equal());
    }

    #[test]
    fn test_cmp_different_bases_unknown() {
        let (mut b, lp, base, phi) = loop_with_store();
        let other = b.parm(7, ValueType::Object);
        let addr_a = b.index_addr(base, lp.iv, 2, HEADER);
        let addr_b = b.index_addr(other, lp.iv, 2, HEADER);
        let ld_a = b.load(lp.cl, phi, addr_a, MemKind::Int, 1);
        let ld_b = b.load(lp.cl, phi, addr_b, MemKind::Int, 2);

        let vloop = vloop_for(&b, &lp);
        let pa = VPointer::new(&mut b.graph, &vloop, ld_a);
        let pb = VPointer::new(&mut b.graph, &vloop, ld_b);
        assert_eq!(pa.cmp(&b.graph, &pb), PointerCmp::Unknown);
    }

    #[test]
    fn test_cmp_different_scale_unknown() {
        let (mut b, lp, base, phi) = loop_with_store();
        let addr_a = b.index_addr(base, lp.iv, 2, HEADER);
        let addr_b = b.index_addr(base, lp.iv, 3, HEADER);
        let ld_a = b.load(lp.cl, phi, addr_a, MemKind::Int, 1);
        let ld_b = b.load(lp.cl, phi, addr_b, MemKind::Long, 1);

        let vloop = vloop_for(&b, &lp);
        let pa = VPointer::new(&mut b.graph, &vloop, ld_a);
        let pb = VPointer::new(&mut b.graph, &vloop, ld_b);
        assert_eq!(pa.cmp(&b.graph, &pb), PointerCmp::Unknown);
    }

    #[test]
    fn test_analyze_only_records_and_does_not_mutate() {
        let (mut b, lp, base, phi) = loop_with_store();
        let k = b.parm(3, ValueType::Int);
        let idx = b
            .graph
            .new_node(Opcode::AddI, &[NodeId::INVALID, lp.iv, k], ValueType::Int);
        b.graph.set_ctrl(idx, lp.cl);
        let addr = b.index_addr(base, idx, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let before = b.graph.len();
        let mut stack = Vec::new();
        let p = VPointer::analyze(&b.graph, &vloop, st, &mut stack);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
        assert_eq!(b.graph.len(), before, "analyze-only must not create nodes");
        assert!(!stack.is_empty(), "traversed loop-variant nodes are recorded");
        assert!(stack.iter().all(|&n| vloop.is_loop_member(&b.graph, n)));
    }

    #[test]
    fn test_cast_and_conversion_peeled() {
        // Range-check elimination leaves a CastII between the iv and the
        // address chain; the matcher looks straight through it.
        let (mut b, lp, base, phi) = loop_with_store();
        let cast = b
            .graph
            .new_node(Opcode::CastII, &[NodeId::INVALID, lp.iv], ValueType::Int);
        b.graph.set_ctrl(cast, lp.cl);
        let addr = b.index_addr(base, cast, 2, HEADER);
        let zero = b.con_i(0);
        let st = b.store(lp.cl, phi, addr, zero, MemKind::Int, 1);
        b.graph.set_input(phi, crate::ir::node::input::LOOP_BACKEDGE, st);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, st);
        assert!(p.valid());
        assert_eq!(p.scale(), 4);
        assert_eq!(p.offset(), 16);
    }

    #[test]
    fn test_invariant_address_has_zero_scale() {
        // a[k]: no iv term at all.
        let (mut b, lp, base, phi) = loop_with_store();
        let k = b.parm(3, ValueType::Int);
        let addr = b.index_addr(base, k, 2, HEADER);
        let ld = b.load(lp.cl, phi, addr, MemKind::Int, 1);

        let vloop = vloop_for(&b, &lp);
        let p = VPointer::new(&mut b.graph, &vloop, ld);
        assert!(p.valid());
        assert_eq!(p.scale(), 0);
        assert!(!p.has_iv());
        assert!(p.invar().is_some());
    }
}
