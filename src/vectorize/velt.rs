//! Vector element type inference.
//!
//! Each body node gets the narrowest scalar type it can be vectorized at.
//! Memory nodes start from their declared access type; integer arithmetic
//! starts at full int and is narrowed backwards from its users, so a chain
//! feeding a short store can be packed at 16 bits. Operations that read
//! higher-order bits (right shifts, abs, byte reversal) only narrow when the
//! bits are known precise, i.e. when the input is a typed load.

use log::trace;

use crate::ir::arena::SecondaryMap;
use crate::ir::graph::Graph;
use crate::ir::node::{input, Node, NodeId};
use crate::ir::operators::{MemKind, Opcode};
use crate::ir::types::ValueType;

use super::body::VLoopBody;
use super::vloop::VLoop;

/// Inferred vector element types for one loop body.
pub struct VLoopTypes {
    velt: SecondaryMap<Node, ValueType>,
}

impl VLoopTypes {
    pub fn new() -> Self {
        VLoopTypes {
            velt: SecondaryMap::new(),
        }
    }

    pub fn compute_vector_element_type(
        &mut self,
        graph: &Graph,
        vloop: &VLoop,
        body: &VLoopBody,
    ) {
        // Initial types from the container each value lives in.
        for &n in body.body() {
            self.velt.set(n, container_type(graph, n));
        }

        // Propagate narrowed integer types backwards through operations that
        // do not depend on higher-order bits.
        for i in (0..body.body().len()).rev() {
            let n = body.body()[i];
            let vtn = self.velt_type(n);
            if !vtn.is_int_family() {
                continue;
            }
            let (start, end) = vector_operands(graph, n);
            for j in start..end {
                let in_n = graph.node(n).in_at(j);
                if !in_n.is_valid() {
                    continue;
                }
                // Never narrow through a memory node.
                if graph.node(in_n).is_mem()
                    || !vloop.in_body(in_n)
                    || !self.velt_type(in_n).is_int_family()
                    || self.data_size(n) >= self.data_size(in_n)
                {
                    continue;
                }
                // Narrowing is only sound when every in-body user agrees.
                let mut same_type = true;
                for &use_n in graph.uses(in_n) {
                    if !vloop.in_body(use_n) || !self.same_velt_type(use_n, n) {
                        same_type = false;
                        break;
                    }
                }
                if !same_type {
                    continue;
                }

                let mut vt = vtn;
                let in_op = graph.node(in_n).op;
                if in_op.is_shift() || matches!(in_op, Opcode::AbsI | Opcode::ReverseBytesI) {
                    // These need the higher-order bits of their first
                    // operand. A typed load tells us exactly which bits are
                    // set; anything else forces full int. Left shifts only
                    // produce low bits and stay narrowed.
                    let load = graph.node(in_n).in_at(1);
                    if load.is_valid()
                        && graph.node(load).is_load()
                        && vloop.in_body(load)
                        && self.velt_type(load).is_int_family()
                    {
                        vt = self.velt_type(load);
                    } else if in_op != Opcode::LShiftI {
                        vt = ValueType::Int;
                    }
                }
                trace!("VLoopTypes: narrow {:?} to {:?}", in_n, vt);
                self.velt.set(in_n, vt);
            }
        }

        // Bool -> Cmp -> x: a vectorized test mask has the size of the
        // compared values.
        for &n in body.body() {
            let mut nn = n;
            let node = graph.node(nn);
            if node.op == Opcode::Bool && !node.in_at(input::CTRL).is_valid() {
                nn = node.in_at(1);
                debug_assert!(
                    nn.is_valid() && graph.node(nn).op == Opcode::CmpI,
                    "Bool always sits on a Cmp"
                );
            }
            if !nn.is_valid() {
                continue;
            }
            let nn_node = graph.node(nn);
            if nn_node.op == Opcode::CmpI && !nn_node.in_at(input::CTRL).is_valid() {
                let a = nn_node.in_at(1);
                let b = nn_node.in_at(2);
                if vloop.in_body(a) {
                    let t = self.velt_type(a);
                    self.velt.set(n, t);
                } else if vloop.in_body(b) {
                    let t = self.velt_type(b);
                    self.velt.set(n, t);
                }
            }
        }
    }

    /// Inferred element type of a body node.
    #[inline]
    pub fn velt_type(&self, n: NodeId) -> ValueType {
        self.velt.value(n)
    }

    #[inline]
    pub fn same_velt_type(&self, n1: NodeId, n2: NodeId) -> bool {
        self.velt_type(n1) == self.velt_type(n2)
    }

    /// Element size in bytes of a body node's inferred type.
    #[inline]
    pub fn data_size(&self, n: NodeId) -> i32 {
        self.velt_type(n).data_size()
    }
}

impl Default for VLoopTypes {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Declared type of the container a node's value lives in.
fn container_type(graph: &Graph, n: NodeId) -> ValueType {
    let node = graph.node(n);
    match node.op {
        Opcode::Load(kind) => {
            if kind == MemKind::UByte {
                // Unsigned byte loads stay sign-insensitive so right shifts
                // over them remain exact.
                ValueType::Boolean
            } else {
                kind.memory_type()
            }
        }
        Opcode::Store(kind) => {
            if kind == MemKind::Char {
                // Any arithmetic feeding a 16-bit store has been promoted
                // through signed int, so treat the slot as signed short.
                ValueType::Short
            } else {
                kind.memory_type()
            }
        }
        _ => {
            // Narrowing of arithmetic comes later from the memory types.
            if node.ty.is_int_family() {
                ValueType::Int
            } else {
                node.ty
            }
        }
    }
}

/// Input range of `n` holding vector operands.
fn vector_operands(graph: &Graph, n: NodeId) -> (usize, usize) {
    let node = graph.node(n);
    match node.op {
        Opcode::Load(_) => (0, 0),
        Opcode::Store(_) | Opcode::StoreCM => (input::MEM_VALUE, input::MEM_VALUE + 1),
        // Shift counts are scalar.
        Opcode::LShiftI | Opcode::RShiftI | Opcode::URShiftI | Opcode::LShiftL => (1, 2),
        _ => (1, node.req()),
    }
}

// =============================================================================
// Tests
// =============================================================================
