use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use super::edge::EdgeTable;
use super::node::Node;

/// A validated, immutable graph ready for execution.
pub struct CompiledGraph {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, EdgeTable>,
    entry_point: String,
    terminal: BTreeSet<String>,
    interrupt_before: BTreeSet<String>,
    interrupt_after: BTreeSet<String>,
}

impl CompiledGraph {
    pub(crate) fn new(
        nodes: HashMap<String, Arc<dyn Node>>,
        edges: HashMap<String, EdgeTable>,
        entry_point: String,
        terminal: BTreeSet<String>,
        interrupt_before: BTreeSet<String>,
        interrupt_after: BTreeSet<String>,
    ) -> Self {
        Self {
            nodes,
            edges,
            entry_point,
            terminal,
            interrupt_before,
            interrupt_after,
        }
    }

    /// Registered node names, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.into_iter()
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.terminal.contains(name)
    }

    pub fn is_interrupt_before(&self, name: &str) -> bool {
        self.interrupt_before.contains(name)
    }

    pub fn is_interrupt_after(&self, name: &str) -> bool {
        self.interrupt_after.contains(name)
    }

    pub fn edges_from(&self, name: &str) -> Option<&EdgeTable> {
        self.edges.get(name)
    }

    /// Nodes reachable from the entry point through edge tables, in BFS order.
    ///
    /// `error_handler` is not included unless an edge names it explicitly.
    pub fn reachable_nodes(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self.entry_point.clone()]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(table) = self.edges.get(&name) {
                for target in table.targets.values() {
                    if !seen.contains(target) {
                        queue.push_back(target.clone());
                    }
                }
            }
            order.push(name);
        }
        order
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes().collect::<Vec<_>>())
            .field("entry_point", &self.entry_point)
            .field("terminal", &self.terminal)
            .field("interrupt_before", &self.interrupt_before)
            .field("interrupt_after", &self.interrupt_after)
            .finish()
    }
}
