//! Merges `Conv` with a following activation into one `FusedConv` node
//! carrying the activation kind as an attribute.

use crate::error::Result;
use crate::graph::{AttrLookup, AttrValue, Graph, Node, NodeIndex};
use crate::kernels::cpu::ActivationKind;

use super::GraphTransformer;

pub struct ConvActivationFusion;

impl GraphTransformer for ConvActivationFusion {
    fn name(&self) -> &str {
        "conv-activation-fusion"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        let order = graph.topo_order()?.to_vec();
        let mut modified = false;
        for index in order {
            if fuse_one(graph, index)? {
                modified = true;
                graph.resolve()?;
            }
        }
        Ok(modified)
    }
}

fn fuse_one(graph: &mut Graph, conv_index: NodeIndex) -> Result<bool> {
    let Some(conv) = graph.node(conv_index) else {
        return Ok(false);
    };
    if !Graph::is_supported_op(conv, "Conv", "", 1) {
        return Ok(false);
    }
    let Some(conv_output) = conv.outputs.first().cloned() else {
        return Ok(false);
    };
    if graph.outputs().contains(&conv_output) {
        return Ok(false);
    }
    let consumers = graph.consumers_of(&conv_output);
    if consumers.len() != 1 {
        return Ok(false);
    }
    let act_index = consumers[0];
    let Some(act) = graph.node(act_index) else {
        return Ok(false);
    };
    let Some(kind) = ActivationKind::from_op_type(&act.op_type) else {
        return Ok(false);
    };
    if !act.domain.is_empty() || act.inputs.len() != 1 {
        return Ok(false);
    }

    let conv = conv.clone();
    let act = act.clone();
    let mut fused = Node::new(
        format!("{}_{}", conv.name, act.op_type.to_ascii_lowercase()),
        "FusedConv",
        conv.inputs.clone(),
        act.outputs.clone(),
    );
    fused.attrs = conv.attrs.clone();
    fused
        .attrs
        .insert("activation".to_string(), AttrValue::Str(kind.op_type().to_string()));
    if kind == ActivationKind::LeakyRelu {
        let alpha = act.attr_f32("alpha").unwrap_or(0.01);
        fused.attrs.insert("alpha".to_string(), AttrValue::Float(alpha));
    }

    graph.remove_node(conv_index)?;
    graph.remove_node(act_index)?;
    graph.add_node(fused);
    Ok(true)
}
