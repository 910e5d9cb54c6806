//! Graph definition: named nodes joined by conditional edges.
//!
//! A workflow is built with a `GraphBuilder`: nodes are registered by name,
//! each non-terminal node gets one routing table (a router function plus a
//! label → target map), and selected nodes are marked as terminal or as
//! interrupt points. `compile()` validates the structure once and returns an
//! immutable `CompiledGraph` that the `ExecutionEngine` walks.
//!
//! The node named `error_handler` is reserved: the engine routes every node
//! failure there. If the builder does not register one, a default fallback
//! node is installed at compile time.

pub mod builder;
pub mod compiled;
pub mod edge;
pub mod node;

pub use builder::GraphBuilder;
pub use compiled::CompiledGraph;
pub use edge::{EdgeTable, RouterFn};
pub use node::{node_fn, ErrorHandlerNode, FnNode, Node, NodeResult};

/// Reserved name of the node every failure is routed to.
pub const ERROR_HANDLER: &str = "error_handler";
