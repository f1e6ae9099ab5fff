//! Evaluates nodes whose inputs are all initializers and replaces them
//! with the resulting constants.
//!
//! The candidate node is executed directly through its kernel over a
//! one-node plan; no subgraph object is materialised. A node that fails
//! to evaluate (no kernel, unsupported dtype) is skipped, never fatal.

use std::sync::Arc;

use crate::error::Result;
use crate::graph::{Graph, NodeIndex};
use crate::provider::ExecutionProvider;
use crate::session::SessionState;

use super::RewriteRule;

pub struct ConstantFolding {
    provider: Arc<dyn ExecutionProvider>,
}

impl ConstantFolding {
    /// Folding executes kernels from the given provider, normally the CPU
    /// provider.
    pub fn new(provider: Arc<dyn ExecutionProvider>) -> Self {
        Self { provider }
    }
}

impl RewriteRule for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn satisfies(&self, graph: &Graph, index: NodeIndex) -> bool {
        let Some(node) = graph.node(index) else {
            return false;
        };
        if node.inputs.is_empty() || node.subgraph_attrs().next().is_some() {
            return false;
        }
        node.all_inputs()
            .all(|name| name.is_empty() || graph.is_initializer(name))
    }

    fn apply(&self, graph: &mut Graph, index: NodeIndex) -> Result<bool> {
        let node = match graph.node(index) {
            Some(node) => node.clone(),
            None => return Ok(false),
        };

        // One-node graph over clones of the consumed initializers.
        let mut fold = Graph::new(format!("fold_{}", node.name));
        for name in node.all_inputs() {
            if name.is_empty() {
                continue;
            }
            let Some(value) = graph.initializer(name) else {
                return Ok(false);
            };
            fold.add_initializer(name.clone(), value.clone());
        }
        for output in &node.outputs {
            fold.add_output(output.clone());
        }
        let outputs = node.outputs.clone();
        fold.add_node(node);

        let folded = SessionState::build(fold, vec![self.provider.clone()])
            .map(Arc::new)
            .and_then(|state| {
                crate::executor::run_nested(
                    &state,
                    Vec::new(),
                    None,
                    &crate::logging::RunLogger::disabled(),
                )
            });
        let values = match folded {
            Ok(values) => values,
            Err(err) => {
                crate::warning!("constant folding skipped node: {}", err);
                return Ok(false);
            }
        };

        graph.remove_node(index)?;
        for (name, value) in outputs.into_iter().zip(values.into_iter()) {
            let tensor = value.as_tensor()?.clone();
            graph.add_initializer(name, tensor);
        }
        Ok(true)
    }
}
