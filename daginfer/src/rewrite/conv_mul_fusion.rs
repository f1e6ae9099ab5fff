//! Folds a constant `Mul` following a `Conv` into the convolution
//! weights (and bias, when present).
//!
//! The scale must be an initializer of rank 0, or of rank `rank(W) − 1`
//! whose leading dimension equals the output-channel count with every
//! other dimension 1.

use crate::error::Result;
use crate::graph::{Graph, NodeIndex};
use crate::tensor::TensorValue;

use super::{GraphTransformer, Initializer};

pub struct ConvMulFusion;

impl GraphTransformer for ConvMulFusion {
    fn name(&self) -> &str {
        "conv-mul-fusion"
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

/// Scale shape admissible for folding into weights shaped `w_shape`.
pub(super) fn scale_shape_matches(w_shape: &[usize], scale_shape: &[usize]) -> bool {
    if scale_shape.is_empty() {
        return true;
    }
    scale_shape.len() == w_shape.len() - 1
        && scale_shape[0] == w_shape[0]
        && scale_shape[1..].iter().all(|&d| d == 1)
}

pub(super) struct ConvEpilogue {
    pub conv_index: NodeIndex,
    pub next_index: NodeIndex,
    pub w_name: String,
    pub bias_name: Option<String>,
    pub operand_name: String,
}

/// Match `Conv -> <op>` where the conv feeds only `<op>`, `<op>` is not a
/// graph output, and `<op>`'s second operand is a constant.
pub(super) fn match_conv_epilogue(
    graph: &Graph,
    conv_index: NodeIndex,
    op_type: &str,
) -> Option<ConvEpilogue> {
    let conv = graph.node(conv_index)?;
    if !Graph::is_supported_op(conv, "Conv", "", 1) {
        return None;
    }
    let conv_output = conv.outputs.first()?.clone();
    if graph.outputs().contains(&conv_output) {
        return None;
    }
    let consumers = graph.consumers_of(&conv_output);
    if consumers.len() != 1 {
        return None;
    }
    let next_index = consumers[0];
    let next = graph.node(next_index)?;
    if next.op_type != op_type || !next.domain.is_empty() {
        return None;
    }
    if graph.node_output_is_graph_output(next) {
        return None;
    }
    if next.inputs.len() != 2 || next.inputs[0] != conv_output {
        return None;
    }
    let operand_name = next.inputs[1].clone();
    if !graph.is_initializer(&operand_name) {
        return None;
    }
    let w_name = conv.inputs.get(1)?.clone();
    let bias_name = conv.inputs.get(2).filter(|n| !n.is_empty()).cloned();
    Some(ConvEpilogue {
        conv_index,
        next_index,
        w_name,
        bias_name,
        operand_name,
    })
}

/// Splice the epilogue node's consumers onto the conv output and drop it.
pub(super) fn splice_out_epilogue(graph: &mut Graph, m: &ConvEpilogue) -> Result<()> {
    let conv_output = graph
        .node(m.conv_index)
        .and_then(|n| n.outputs.first().cloned())
        .ok_or_else(|| crate::error::Error::internal("conv node disappeared"))?;
    let next_output = graph
        .node(m.next_index)
        .and_then(|n| n.outputs.first().cloned())
        .ok_or_else(|| crate::error::Error::internal("epilogue node disappeared"))?;
    graph.replace_uses(&next_output, &conv_output);
    graph.remove_node(m.next_index)?;
    Ok(())
}

fn fuse_one(graph: &mut Graph, conv_index: NodeIndex) -> Result<bool> {
    let Some(m) = match_conv_epilogue(graph, conv_index, "Mul") else {
        return Ok(false);
    };
    let (Some(w_value), Some(scale_value)) = (
        graph.initializer(&m.w_name),
        graph.initializer(&m.operand_name),
    ) else {
        return Ok(false);
    };
    if !Initializer::supported(w_value)
        || !Initializer::supported(scale_value)
        || w_value.dtype() != scale_value.dtype()
        || w_value.rank() < 4
        || !scale_shape_matches(w_value.shape(), scale_value.shape())
    {
        return Ok(false);
    }
    let bias_value: Option<&TensorValue> = match &m.bias_name {
        Some(name) => match graph.initializer(name) {
            Some(value)
                if Initializer::supported(value)
                    && value.dtype() == w_value.dtype()
                    && value.rank() == 1
                    && (scale_value.rank() == 0
                        || value.shape()[0] == scale_value.shape()[0]) =>
            {
                Some(value)
            }
            _ => return Ok(false),
        },
        None => None,
    };

    let mut w = Initializer::try_from_value(w_value)?;
    let scale = Initializer::try_from_value(scale_value)?;
    let bias = bias_value.map(Initializer::try_from_value).transpose()?;

    w.scale_by_axis(&scale, 1)?;
    let new_bias = match bias {
        Some(mut b) => {
            // Per-channel or scalar scale applies directly to the bias.
            b.scale_by_axis(&scale, if scale.numel() == 1 { 0 } else { 1 })?;
            Some(b.to_tensor()?)
        }
        None => None,
    };

    let new_w = w.to_tensor()?;
    graph.remove_initializer(&m.w_name);
    graph.add_initializer(m.w_name.clone(), new_w);
    if let (Some(name), Some(value)) = (&m.bias_name, new_bias) {
        graph.remove_initializer(name);
        graph.add_initializer(name.clone(), value);
    }
    splice_out_epilogue(graph, &m)?;
    Ok(true)
}
