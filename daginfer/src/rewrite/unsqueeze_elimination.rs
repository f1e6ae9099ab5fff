//! Folds `Unsqueeze` nodes whose input is an initializer: the reshaped
//! constant replaces the node at plan time.

use crate::error::Result;
use crate::graph::{AttrLookup, Graph, NodeIndex};
use crate::kernels::cpu::unsqueezed_shape;

use super::GraphTransformer;

pub struct UnsqueezeElimination;

impl GraphTransformer for UnsqueezeElimination {
    fn name(&self) -> &str {
        "unsqueeze-elimination"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        let order = graph.topo_order()?.to_vec();
        let mut modified = false;
        for index in order {
            if fold_one(graph, index)? {
                modified = true;
            }
        }
        if modified {
            graph.resolve()?;
        }
        Ok(modified)
    }
}

fn fold_one(graph: &mut Graph, index: NodeIndex) -> Result<bool> {
    let Some(node) = graph.node(index) else {
        return Ok(false);
    };
    if node.op_type != "Unsqueeze" || !node.domain.is_empty() {
        return Ok(false);
    }
    // Versions below 13 carry `axes` as an attribute; 13 and later move it
    // to a second input, which this fold does not read.
    if node.since_version >= 13 {
        return Ok(false);
    }
    if node.inputs.len() != 1 || node.outputs.len() != 1 {
        return Ok(false);
    }
    let Some(axes) = node.attr_ints("axes").map(|a| a.to_vec()) else {
        return Ok(false);
    };
    let input_name = node.inputs[0].clone();
    let output_name = node.outputs[0].clone();
    let Some(value) = graph.initializer(&input_name) else {
        return Ok(false);
    };
    let Ok(shape) = unsqueezed_shape(value.shape(), &axes) else {
        return Ok(false);
    };
    let bytes = value.to_bytes();
    let reshaped = crate::tensor::TensorValue::from_bytes(value.dtype(), shape, &bytes)?;
    graph.remove_node(index)?;
    graph.add_initializer(output_name, reshaped);
    Ok(true)
}
