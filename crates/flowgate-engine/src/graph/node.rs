use futures::future::BoxFuture;
use serde_json::json;

use flowgate_core::state::WorkflowState;
use flowgate_core::types::{Message, NodeError};

/// What a node body returns: the next state, or an error the engine records
/// and routes to the error handler.
pub type NodeResult = std::result::Result<WorkflowState, NodeError>;

/// A named unit of work in the graph.
///
/// A node receives the current state by value and returns a new state. It
/// may append messages, replace its own `active_step_context` entry, and set
/// the approval context. Everything else is engine-owned and checked after
/// each run.
pub trait Node: Send + Sync + 'static {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult>;
}

/// Adapter that turns an async closure into a `Node`.
pub struct FnNode<F> {
    f: F,
}

impl<F> Node for FnNode<F>
where
    F: Fn(WorkflowState) -> BoxFuture<'static, NodeResult> + Send + Sync + 'static,
{
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        (self.f)(state)
    }
}

/// Wrap a closure returning a boxed future as a node.
///
/// ```ignore
/// builder.add_node("greet", node_fn(|state| Box::pin(async move {
///     Ok(state.with_message(Message::assistant("hello")))
/// })))?;
/// ```
pub fn node_fn<F>(f: F) -> FnNode<F>
where
    F: Fn(WorkflowState) -> BoxFuture<'static, NodeResult> + Send + Sync + 'static,
{
    FnNode { f }
}

/// Default failure sink installed when a graph does not define its own.
///
/// Appends a single assistant message so the caller always has something to
/// show, tagged with `source = error_handler`.
pub struct ErrorHandlerNode {
    message: String,
}

impl ErrorHandlerNode {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for ErrorHandlerNode {
    fn default() -> Self {
        Self::new("Sorry, something went wrong while handling your request. Please try again.")
    }
}

impl Node for ErrorHandlerNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let last = state.errors.last().map(|e| e.code.clone());
            let msg = Message::assistant(self.message.clone())
                .with_meta("source", json!(super::ERROR_HANDLER))
                .with_meta("error_code", json!(last));
            Ok(state.with_message(msg))
        })
    }
}
