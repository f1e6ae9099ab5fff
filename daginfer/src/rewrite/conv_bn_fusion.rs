//! Folds `BatchNormalization` (version 7) into the preceding `Conv`.
//!
//! With BN parameters γ, β, μ, σ² and ε, let `s = γ / sqrt(σ² + ε)`; the
//! convolution weights become `W · s` broadcast along output channels and
//! the bias becomes `(b − μ) · s + β`, synthesised from β − μ·s when the
//! convolution had none.

use crate::error::Result;
use crate::graph::{AttrLookup, Graph, NodeIndex};

use super::{GraphTransformer, Initializer};

pub struct ConvBnFusion;

impl GraphTransformer for ConvBnFusion {
    fn name(&self) -> &str {
        "conv-bn-fusion"
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
    let conv_output = match conv.outputs.first() {
        Some(output) => output.clone(),
        None => return Ok(false),
    };
    let consumers = graph.consumers_of(&conv_output);
    if consumers.len() != 1 || graph.outputs().contains(&conv_output) {
        return Ok(false);
    }
    let bn_index = consumers[0];
    let Some(bn) = graph.node(bn_index) else {
        return Ok(false);
    };
    if !Graph::is_supported_op(bn, "BatchNormalization", "", 7) {
        return Ok(false);
    }
    if graph.node_output_is_graph_output(bn) {
        return Ok(false);
    }
    // The conv output must be BN's only edge from another node.
    let bn_produced_inputs = bn
        .inputs
        .iter()
        .filter(|name| graph.producer_of(name).is_some())
        .count();
    if bn_produced_inputs != 1 || bn.inputs.first() != Some(&conv_output) {
        return Ok(false);
    }

    let group = conv.attr_i64("group").unwrap_or(1);
    if group != 1 {
        return Ok(false);
    }
    let Some(epsilon) = bn.attr_f32("epsilon") else {
        return Ok(false);
    };
    if bn.inputs.len() < 5 {
        return Ok(false);
    }

    let conv = conv.clone();
    let bn = bn.clone();
    let names = [
        conv.inputs.get(1).cloned().unwrap_or_default(), // W
        bn.inputs[1].clone(),                            // γ
        bn.inputs[2].clone(),                            // β
        bn.inputs[3].clone(),                            // μ
        bn.inputs[4].clone(),                            // σ²
    ];
    let mut tensors = Vec::with_capacity(names.len());
    for name in &names {
        let Some(value) = graph.initializer(name) else {
            return Ok(false);
        };
        if !Initializer::supported(value) {
            return Ok(false);
        }
        tensors.push(value);
    }
    let (w_value, scale_value, b_value, mean_value, var_value) =
        (tensors[0], tensors[1], tensors[2], tensors[3], tensors[4]);

    let channels = match scale_value.shape() {
        [c] => *c,
        _ => return Ok(false),
    };
    for value in [b_value, mean_value, var_value] {
        if value.shape() != [channels] {
            return Ok(false);
        }
    }
    let same_dtype = [scale_value, b_value, mean_value, var_value, w_value]
        .windows(2)
        .all(|pair| pair[0].dtype() == pair[1].dtype());
    if !same_dtype {
        return Ok(false);
    }
    if w_value.rank() <= 2 || w_value.shape()[0] != channels {
        return Ok(false);
    }

    let conv_bias_name = conv.inputs.get(2).filter(|n| !n.is_empty()).cloned();
    let conv_bias = match &conv_bias_name {
        Some(name) => {
            let Some(value) = graph.initializer(name) else {
                return Ok(false);
            };
            if !Initializer::supported(value)
                || value.shape() != [channels]
                || value.dtype() != b_value.dtype()
            {
                return Ok(false);
            }
            Some(Initializer::try_from_value(value)?)
        }
        None => None,
    };

    let mut var = Initializer::try_from_value(var_value)?;
    let mut scale = Initializer::try_from_value(scale_value)?;
    let mut bn_b = Initializer::try_from_value(b_value)?;
    let mut mean = Initializer::try_from_value(mean_value)?;
    let mut w = Initializer::try_from_value(w_value)?;

    // s = γ / sqrt(σ² + ε); W ← W · s along output channels.
    var.add_scalar(epsilon as f64);
    var.sqrt();
    scale.div(&var)?;
    w.scale_by_axis(&scale, 1)?;

    let (bias_name, new_bias) = match conv_bias {
        Some(mut bias) => {
            // b ← (b − μ) · s + β
            bias.sub(&mean)?;
            bias.mul(&scale)?;
            bias.add(&bn_b)?;
            (
                conv_bias_name.clone().unwrap_or_default(),
                bias.to_tensor()?,
            )
        }
        None => {
            // b ← β − μ · s, stored under the β name and wired as input 2.
            mean.mul(&scale)?;
            bn_b.sub(&mean)?;
            (names[2].clone(), bn_b.to_tensor()?)
        }
    };

    let w_name = names[0].clone();
    let new_w = w.to_tensor()?;
    graph.remove_initializer(&w_name);
    graph.add_initializer(w_name, new_w);
    graph.remove_initializer(&bias_name);
    graph.add_initializer(bias_name.clone(), new_bias);
    if conv_bias_name.is_none() {
        let node = graph
            .node_mut(conv_index)
            .ok_or_else(|| crate::error::Error::internal("conv node disappeared"))?;
        if node.inputs.len() == 2 {
            node.inputs.push(bias_name);
        } else {
            node.inputs.resize(3, String::new());
            node.inputs[2] = bias_name;
        }
    }

    let bn_output = bn.outputs[0].clone();
    graph.replace_uses(&bn_output, &conv_output);
    graph.remove_node(bn_index)?;
    Ok(true)
}
