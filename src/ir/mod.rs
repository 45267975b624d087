//! Sea-of-Nodes intermediate representation.
//!
//! - **Arena** (`arena.rs`): index-based storage, secondary maps, bit sets
//! - **Types** (`types.rs`): scalar value types with byte sizes
//! - **Operators** (`operators.rs`): opcode definitions
//! - **Node** (`node.rs`): IR node and input-slot conventions
//! - **Graph** (`graph.rs`): node graph, use-def chains, value numbering,
//!   control/dominance oracles, loop metadata
//! - **Builder** (`builder.rs`): canonical counted-loop construction
//!
//! Nodes are referenced by [`NodeId`] indices rather than pointers; all side
//! tables are dense arrays keyed by the same indices.

pub mod arena;
pub mod builder;
pub mod graph;
pub mod node;
pub mod operators;
pub mod types;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::LoopGraphBuilder;
pub use graph::{Graph, LoopKind, LoopMeta};
pub use node::{InputList, Node, NodeId};
pub use operators::{MemKind, Opcode};
pub use types::ValueType;
