//! Control-flow kernels. `If` selects a branch subgraph, runs it through
//! the nested sequential executor, and forwards the branch outputs.

use crate::error::{Error, Result};
use crate::tensor::TensorValue;

use super::super::{Kernel, KernelContext};

pub(super) struct IfKernel;

impl Kernel for IfKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let cond = match ctx.input(0)? {
            TensorValue::Bool(t) => {
                *t.as_slice().first().ok_or_else(|| {
                    Error::invalid_argument("If condition tensor is empty")
                })?
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "If condition must be a bool tensor, got {}",
                    other.dtype()
                )))
            }
        };
        let branch = if cond { "then_branch" } else { "else_branch" };
        let outputs = ctx.execute_subgraph(branch)?;
        if outputs.len() != ctx.output_count() {
            return Err(Error::invalid_model(format!(
                "If branch '{}' produced {} outputs, node expects {}",
                branch,
                outputs.len(),
                ctx.output_count()
            )));
        }
        for (index, value) in outputs.into_iter().enumerate() {
            ctx.set_output_value(index, value)?;
        }
        Ok(())
    }
}

pub(super) fn make_if(
    node: &crate::graph::Node,
) -> Result<Box<dyn Kernel>> {
    for attr in ["then_branch", "else_branch"] {
        if !node.attrs.contains_key(attr) {
            return Err(Error::invalid_model(format!(
                "If node '{}' is missing the '{}' subgraph",
                node.name, attr
            )));
        }
    }
    Ok(Box::new(IfKernel))
}
