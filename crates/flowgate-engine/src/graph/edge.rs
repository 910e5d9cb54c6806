use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use flowgate_core::state::WorkflowState;

/// Routing function: looks at the state a node produced and returns a label.
pub type RouterFn = Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>;

/// The single outgoing routing table of a node.
///
/// The router returns a label; the label is looked up in `targets` to find
/// the next node. A label missing from the table is an execution error.
#[derive(Clone)]
pub struct EdgeTable {
    pub router: RouterFn,
    pub targets: BTreeMap<String, String>,
}

impl EdgeTable {
    pub fn new(router: RouterFn, targets: BTreeMap<String, String>) -> Self {
        Self { router, targets }
    }

    /// A table that always follows `label` to `target`.
    pub fn fixed(label: impl Into<String>, target: impl Into<String>) -> Self {
        let label = label.into();
        let returned = label.clone();
        let mut targets = BTreeMap::new();
        targets.insert(label, target.into());
        Self {
            router: Arc::new(move |_| returned.clone()),
            targets,
        }
    }

    /// Evaluate the router and resolve its label.
    ///
    /// Returns the label and, if the table maps it, the target node.
    pub fn route(&self, state: &WorkflowState) -> (String, Option<&str>) {
        let label = (self.router)(state);
        let target = self.targets.get(&label).map(String::as_str);
        (label, target)
    }
}

impl fmt::Debug for EdgeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeTable")
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}
