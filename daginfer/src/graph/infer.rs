//! Dtype propagation used by `Graph::resolve`.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tensor::DType;

use super::{AttrLookup, Node};

/// Output dtypes of a node given the dtypes resolved so far.
///
/// Most operators produce their first input's dtype; the exceptions are
/// listed explicitly. Unknown operators fall back to the first-input rule
/// so externally registered kernels participate without a schema.
pub(super) fn infer_node_dtypes(
    node: &Node,
    dtypes: &HashMap<String, DType>,
) -> Result<Vec<DType>> {
    let input_dtype = |index: usize| -> Result<DType> {
        let name = node.inputs.get(index).ok_or_else(|| {
            Error::invalid_model(format!(
                "node '{}' ({}) expects at least {} inputs",
                node.name,
                node.op_type,
                index + 1
            ))
        })?;
        dtypes.get(name).copied().ok_or_else(|| {
            Error::invalid_model(format!(
                "node '{}' reads '{}' whose dtype is unknown",
                node.name, name
            ))
        })
    };

    match node.op_type.as_str() {
        "Cast" => {
            let to = node.require_dtype("to")?;
            Ok(vec![to; node.outputs.len()])
        }
        "If" => {
            // Branch outputs dictate the node outputs; when both branches
            // are present their output dtype lists must agree.
            let then_dtypes = node
                .attr_graph("then_branch")
                .map(branch_output_dtypes)
                .transpose()?;
            let else_dtypes = node
                .attr_graph("else_branch")
                .map(branch_output_dtypes)
                .transpose()?;
            match (then_dtypes, else_dtypes) {
                (Some(then_dtypes), Some(else_dtypes)) => {
                    if then_dtypes != else_dtypes {
                        return Err(Error::invalid_model(format!(
                            "If node '{}' branches disagree on outputs: \
                             then {:?}, else {:?}",
                            node.name, then_dtypes, else_dtypes
                        )));
                    }
                    Ok(then_dtypes)
                }
                (Some(dtypes), None) | (None, Some(dtypes)) => Ok(dtypes),
                (None, None) => Err(Error::invalid_model(format!(
                    "If node '{}' has no branch subgraph",
                    node.name
                ))),
            }
        }
        _ => {
            let dtype = input_dtype(0)?;
            Ok(vec![dtype; node.outputs.len()])
        }
    }
}

/// Resolved output dtypes of one branch subgraph.
fn branch_output_dtypes(subgraph: &super::Graph) -> Result<Vec<DType>> {
    let resolved;
    let sub: &super::Graph = if subgraph.is_resolved() {
        subgraph
    } else {
        let mut clone = subgraph.clone();
        clone.resolve()?;
        resolved = clone;
        &resolved
    };
    sub.outputs()
        .iter()
        .map(|name| {
            sub.dtype_of(name).ok_or_else(|| {
                Error::invalid_model(format!(
                    "subgraph output '{}' has unknown dtype",
                    name
                ))
            })
        })
        .collect()
}
