use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::state::WorkflowState;

use super::compiled::CompiledGraph;
use super::edge::EdgeTable;
use super::node::{ErrorHandlerNode, Node};
use super::ERROR_HANDLER;

/// Label used by `add_edge` for unconditional edges.
pub const NEXT_LABEL: &str = "next";

/// Mutable graph definition. Call `compile()` to validate and freeze it.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, EdgeTable>,
    entry_point: Option<String>,
    terminal: BTreeSet<String>,
    interrupt_before: BTreeSet<String>,
    interrupt_after: BTreeSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under a unique name.
    ///
    /// `error_handler` may be registered once to replace the default fallback.
    pub fn add_node<N: Node>(&mut self, name: impl Into<String>, node: N) -> Result<&mut Self> {
        self.add_shared_node(name, Arc::new(node))
    }

    pub fn add_shared_node(
        &mut self,
        name: impl Into<String>,
        node: Arc<dyn Node>,
    ) -> Result<&mut Self> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(FlowgateError::DuplicateNode(name));
        }
        debug!(node = %name, "Registered graph node");
        self.nodes.insert(name, node);
        Ok(self)
    }

    /// Attach the routing table of `source`.
    ///
    /// The router's returned label is looked up in `targets` at run time.
    /// Targets may name `error_handler` before it is registered.
    pub fn add_conditional_edge<R, I, L, T>(
        &mut self,
        source: &str,
        router: R,
        targets: I,
    ) -> Result<&mut Self>
    where
        R: Fn(&WorkflowState) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        let targets: BTreeMap<String, String> = targets
            .into_iter()
            .map(|(l, t)| (l.into(), t.into()))
            .collect();
        self.insert_table(source, EdgeTable::new(Arc::new(router), targets))
    }

    /// Unconditional edge from `source` to `target`.
    pub fn add_edge(&mut self, source: &str, target: &str) -> Result<&mut Self> {
        self.insert_table(source, EdgeTable::fixed(NEXT_LABEL, target))
    }

    fn insert_table(&mut self, source: &str, table: EdgeTable) -> Result<&mut Self> {
        self.require_node(source)?;
        for target in table.targets.values() {
            if target != ERROR_HANDLER {
                self.require_node(target)?;
            }
        }
        if self.edges.contains_key(source) {
            return Err(FlowgateError::GraphValidation(format!(
                "node '{}' already has an edge table",
                source
            )));
        }
        self.edges.insert(source.to_string(), table);
        Ok(self)
    }

    pub fn set_entry_point(&mut self, name: &str) -> Result<&mut Self> {
        self.require_node(name)?;
        self.entry_point = Some(name.to_string());
        Ok(self)
    }

    pub fn mark_terminal(&mut self, name: &str) -> Result<&mut Self> {
        self.terminal.insert(name.to_string());
        Ok(self)
    }

    /// Pause before `name` runs; the node executes on the next resume.
    pub fn mark_interrupt_before(&mut self, name: &str) -> Result<&mut Self> {
        self.interrupt_before.insert(name.to_string());
        Ok(self)
    }

    /// Pause after `name` has run and been checkpointed.
    pub fn mark_interrupt_after(&mut self, name: &str) -> Result<&mut Self> {
        self.interrupt_after.insert(name.to_string());
        Ok(self)
    }

    fn require_node(&self, name: &str) -> Result<()> {
        if self.nodes.contains_key(name) {
            Ok(())
        } else {
            Err(FlowgateError::UnknownNode(name.to_string()))
        }
    }

    /// Validate the definition and freeze it.
    pub fn compile(mut self) -> Result<CompiledGraph> {
        if !self.nodes.contains_key(ERROR_HANDLER) {
            debug!("No error_handler registered, installing default fallback");
            self.nodes
                .insert(ERROR_HANDLER.to_string(), Arc::new(ErrorHandlerNode::default()));
        }
        self.terminal.insert(ERROR_HANDLER.to_string());

        let entry = self
            .entry_point
            .clone()
            .ok_or_else(|| FlowgateError::GraphValidation("no entry point set".into()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(FlowgateError::GraphValidation(format!(
                "entry point '{}' is not registered",
                entry
            )));
        }

        let marked = self
            .terminal
            .iter()
            .chain(self.interrupt_before.iter())
            .chain(self.interrupt_after.iter());
        for name in marked {
            if !self.nodes.contains_key(name) {
                return Err(FlowgateError::GraphValidation(format!(
                    "marked node '{}' is not registered",
                    name
                )));
            }
        }

        if self.interrupt_before.contains(ERROR_HANDLER)
            || self.interrupt_after.contains(ERROR_HANDLER)
        {
            return Err(FlowgateError::GraphValidation(
                "error_handler cannot be an interrupt point".into(),
            ));
        }

        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        for name in names {
            let terminal = self.terminal.contains(name);
            let has_table = self.edges.contains_key(name);
            if terminal && has_table {
                return Err(FlowgateError::GraphValidation(format!(
                    "terminal node '{}' has an edge table",
                    name
                )));
            }
            if !terminal && !has_table {
                return Err(FlowgateError::GraphValidation(format!(
                    "non-terminal node '{}' has no outgoing edges",
                    name
                )));
            }
        }

        Ok(CompiledGraph::new(
            self.nodes,
            self.edges,
            entry,
            self.terminal,
            self.interrupt_before,
            self.interrupt_after,
        ))
    }
}
