//! Removes `Identity` nodes, splicing their consumers onto the input.

use crate::error::Result;
use crate::graph::{Graph, NodeIndex};

use super::RewriteRule;

pub struct EliminateIdentity;

impl RewriteRule for EliminateIdentity {
    fn name(&self) -> &str {
        "eliminate-identity"
    }

    fn satisfies(&self, graph: &Graph, index: NodeIndex) -> bool {
        let Some(node) = graph.node(index) else {
            return false;
        };
        node.inputs.len() == 1
            && !node.inputs[0].is_empty()
            && node.outputs.len() == 1
            && !graph.node_output_is_graph_output(node)
    }

    fn apply(&self, graph: &mut Graph, index: NodeIndex) -> Result<bool> {
        graph.remove_single_in_single_out(index)?;
        Ok(true)
    }
}
