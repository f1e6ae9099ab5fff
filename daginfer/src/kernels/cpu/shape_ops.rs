//! Identity, Cast, Unsqueeze, and attribute-form Slice.

use crate::error::{Error, Result};
use crate::graph::{AttrLookup, Node};
use crate::tensor::shape::{compute_strides, linear_to_indices, numel};
use crate::tensor::{DType, TensorValue};

use super::super::{Kernel, KernelContext};

/// Pass-through; the shared value handle is republished unchanged.
pub(super) fn identity(ctx: &mut KernelContext<'_>) -> Result<()> {
    let value = ctx.input_value(0)?;
    ctx.set_output_value(0, value)
}

pub(super) struct CastKernel {
    to: DType,
}

impl CastKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        Ok(Self {
            to: node.require_dtype("to")?,
        })
    }
}

impl Kernel for CastKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let out = ctx.input(0)?.cast_to(self.to)?;
        ctx.set_output(0, out)
    }
}

pub(super) struct UnsqueezeKernel {
    axes: Vec<i64>,
}

impl UnsqueezeKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        let axes = node
            .attr_ints("axes")
            .ok_or_else(|| Error::invalid_model("Unsqueeze requires an 'axes' attribute"))?
            .to_vec();
        Ok(Self { axes })
    }
}

/// Shape of `input` with size-1 axes inserted at `axes` (indices into the
/// output shape).
pub(crate) fn unsqueezed_shape(input: &[usize], axes: &[i64]) -> Result<Vec<usize>> {
    let out_rank = input.len() + axes.len();
    let mut marks = vec![false; out_rank];
    for &axis in axes {
        let axis = if axis < 0 { axis + out_rank as i64 } else { axis };
        if axis < 0 || axis as usize >= out_rank {
            return Err(Error::invalid_model(format!(
                "Unsqueeze axis {} out of range for output rank {}",
                axis, out_rank
            )));
        }
        if marks[axis as usize] {
            return Err(Error::invalid_model(format!(
                "Unsqueeze axis {} repeated",
                axis
            )));
        }
        marks[axis as usize] = true;
    }
    let mut shape = Vec::with_capacity(out_rank);
    let mut src = input.iter();
    for mark in marks {
        if mark {
            shape.push(1);
        } else {
            shape.push(*src.next().ok_or_else(|| {
                Error::invalid_model("Unsqueeze axes exceed input rank")
            })?);
        }
    }
    Ok(shape)
}

impl Kernel for UnsqueezeKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let shape = unsqueezed_shape(input.shape(), &self.axes)?;
        let bytes = input.to_bytes();
        let out = TensorValue::from_bytes(input.dtype(), shape, &bytes)?;
        ctx.set_output(0, out)
    }
}

/// Attribute-form Slice. An end of `i64::MAX` or `-1` means the end of the
/// dimension (the reading the slice-elimination rewrite relies on); other
/// negative ends count from the back.
pub(super) struct SliceKernel {
    starts: Vec<i64>,
    ends: Vec<i64>,
    axes: Option<Vec<i64>>,
}

impl SliceKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        let starts = node
            .attr_ints("starts")
            .ok_or_else(|| Error::invalid_model("Slice requires 'starts'"))?
            .to_vec();
        let ends = node
            .attr_ints("ends")
            .ok_or_else(|| Error::invalid_model("Slice requires 'ends'"))?
            .to_vec();
        if starts.len() != ends.len() {
            return Err(Error::invalid_model(
                "Slice 'starts' and 'ends' lengths differ",
            ));
        }
        let axes = node.attr_ints("axes").map(|a| a.to_vec());
        if let Some(axes) = &axes {
            if axes.len() != starts.len() {
                return Err(Error::invalid_model(
                    "Slice 'axes' length does not match 'starts'",
                ));
            }
        }
        Ok(Self { starts, ends, axes })
    }

    fn resolve_bounds(&self, shape: &[usize]) -> Result<(Vec<usize>, Vec<usize>)> {
        let rank = shape.len();
        let mut starts = vec![0usize; rank];
        let mut ends: Vec<usize> = shape.to_vec();
        for (i, (&start, &end)) in self.starts.iter().zip(self.ends.iter()).enumerate() {
            let axis = match &self.axes {
                Some(axes) => axes[i],
                None => i as i64,
            };
            let axis = if axis < 0 { axis + rank as i64 } else { axis };
            if axis < 0 || axis as usize >= rank {
                return Err(Error::invalid_argument(format!(
                    "Slice axis {} out of range for rank {}",
                    axis, rank
                )));
            }
            let dim = shape[axis as usize] as i64;
            let mut s = if start < 0 { start + dim } else { start };
            s = s.clamp(0, dim);
            let mut e = if end == i64::MAX || end == -1 {
                dim
            } else if end < 0 {
                end + dim
            } else {
                end
            };
            e = e.clamp(s, dim);
            starts[axis as usize] = s as usize;
            ends[axis as usize] = e as usize;
        }
        Ok((starts, ends))
    }
}

impl Kernel for SliceKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let shape = input.shape().to_vec();
        let (starts, ends) = self.resolve_bounds(&shape)?;
        let out_shape: Vec<usize> = starts
            .iter()
            .zip(ends.iter())
            .map(|(&s, &e)| e - s)
            .collect();

        let elem = input.dtype().size_of();
        let bytes = input.to_bytes();
        let strides = compute_strides(&shape);
        let out_len = numel(&out_shape);
        let mut out_bytes = Vec::with_capacity(out_len * elem);
        for linear in 0..out_len {
            let out_idx = linear_to_indices(linear, &out_shape);
            let mut offset = 0usize;
            for (axis, &index) in out_idx.iter().enumerate() {
                offset += (starts[axis] + index) * strides[axis];
            }
            out_bytes.extend_from_slice(&bytes[offset * elem..(offset + 1) * elem]);
        }
        let out = TensorValue::from_bytes(input.dtype(), out_shape, &out_bytes)?;
        ctx.set_output(0, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsqueeze_inserts_unit_axes() {
        assert_eq!(unsqueezed_shape(&[3, 4], &[0]).unwrap(), vec![1, 3, 4]);
        assert_eq!(unsqueezed_shape(&[3, 4], &[1, 3]).unwrap(), vec![3, 1, 4, 1]);
        assert!(unsqueezed_shape(&[3], &[0, 0]).is_err());
    }
}
