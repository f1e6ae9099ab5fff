//! Folds a constant `Add` following a `Conv` into the convolution bias,
//! synthesising the bias when the convolution had none.

use crate::error::Result;
use crate::graph::{Graph, NodeIndex};

use super::conv_mul_fusion::{match_conv_epilogue, scale_shape_matches, splice_out_epilogue};
use super::{GraphTransformer, Initializer};

pub struct ConvAddFusion;

impl GraphTransformer for ConvAddFusion {
    fn name(&self) -> &str {
        "conv-add-fusion"
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
    let Some(m) = match_conv_epilogue(graph, conv_index, "Add") else {
        return Ok(false);
    };
    let (Some(w_value), Some(addend_value)) = (
        graph.initializer(&m.w_name),
        graph.initializer(&m.operand_name),
    ) else {
        return Ok(false);
    };
    if !Initializer::supported(w_value)
        || !Initializer::supported(addend_value)
        || w_value.dtype() != addend_value.dtype()
        || w_value.rank() < 4
        || !scale_shape_matches(w_value.shape(), addend_value.shape())
    {
        return Ok(false);
    }
    let channels = w_value.shape()[0];
    let addend = Initializer::try_from_value(addend_value)?;

    match &m.bias_name {
        Some(name) => {
            let Some(bias_value) = graph.initializer(name) else {
                return Ok(false);
            };
            if !Initializer::supported(bias_value)
                || bias_value.dtype() != w_value.dtype()
                || bias_value.shape() != [channels]
            {
                return Ok(false);
            }
            let mut bias = Initializer::try_from_value(bias_value)?;
            if addend.numel() == 1 {
                bias.add_scalar(addend.scalar()?);
            } else {
                let flat = addend.to_tensor_with_shape(vec![channels])?;
                bias.add(&Initializer::try_from_value(&flat)?)?;
            }
            let value = bias.to_tensor()?;
            graph.remove_initializer(name);
            graph.add_initializer(name.clone(), value);
        }
        None => {
            // Synthesise the bias from the addend, flattened to [C_out].
            let value = if addend.numel() == 1 {
                crate::tensor::TensorValue::from_f64_vec(
                    addend.dtype(),
                    vec![channels],
                    &vec![addend.scalar()?; channels],
                )?
            } else {
                addend.to_tensor_with_shape(vec![channels])?
            };
            graph.remove_initializer(&m.operand_name);
            graph.add_initializer(m.operand_name.clone(), value);
            let node = graph
                .node_mut(m.conv_index)
                .ok_or_else(|| crate::error::Error::internal("conv node disappeared"))?;
            if node.inputs.len() == 2 {
                node.inputs.push(m.operand_name.clone());
            } else {
                node.inputs.resize(3, String::new());
                node.inputs[2] = m.operand_name.clone();
            }
        }
    }

    splice_out_epilogue(graph, &m)?;
    Ok(true)
}
