//! ReverseSequence (`ext` domain): reverses the first `seq_lengths[b]`
//! positions along the sequence axis of each batch entry and copies the
//! remainder verbatim.

use crate::error::{Error, Result};
use crate::graph::{AttrLookup, Node};
use crate::tensor::{Tensor, TensorValue};

use super::super::{Kernel, KernelContext};

pub(super) struct ReverseSequenceKernel {
    batch_axis: usize,
    seq_axis: usize,
}

impl ReverseSequenceKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        let batch_axis = node.attr_i64("batch_axis").unwrap_or(1);
        let seq_axis = node.attr_i64("seq_axis").unwrap_or(0);
        for (name, axis) in [("batch_axis", batch_axis), ("seq_axis", seq_axis)] {
            if !(0..=1).contains(&axis) {
                return Err(Error::invalid_model(format!(
                    "ReverseSequence '{}' must be 0 or 1, got {}",
                    name, axis
                )));
            }
        }
        if batch_axis == seq_axis {
            return Err(Error::invalid_model(
                "ReverseSequence batch_axis and seq_axis must differ",
            ));
        }
        Ok(Self {
            batch_axis: batch_axis as usize,
            seq_axis: seq_axis as usize,
        })
    }
}

fn reverse_sequence<T: Copy>(
    input: &Tensor<T>,
    seq_lengths: &[i64],
    batch_axis: usize,
    seq_axis: usize,
) -> Result<Tensor<T>> {
    let shape = input.shape();
    if shape.len() < 2 {
        return Err(Error::invalid_argument(
            "ReverseSequence expects a rank >= 2 input",
        ));
    }
    let batch = shape[batch_axis];
    let max_seq = shape[seq_axis];
    if seq_lengths.len() != batch {
        return Err(Error::invalid_argument(format!(
            "seq_lengths has {} entries for batch size {}",
            seq_lengths.len(),
            batch
        )));
    }
    for &len in seq_lengths {
        if len < 0 || len as usize > max_seq {
            return Err(Error::invalid_argument(format!(
                "sequence length {} outside [0, {}]",
                len, max_seq
            )));
        }
    }

    // With the two leading axes fixed, the remaining dims are one block.
    let block: usize = shape[2..].iter().product();
    let data = input.as_slice();
    let mut out = data.to_vec();
    for b in 0..batch {
        let len = seq_lengths[b] as usize;
        for s in 0..len {
            let src_s = len - 1 - s;
            let (dst, src) = if batch_axis == 0 {
                ((b * max_seq + s) * block, (b * max_seq + src_s) * block)
            } else {
                ((s * batch + b) * block, (src_s * batch + b) * block)
            };
            out[dst..dst + block].copy_from_slice(&data[src..src + block]);
        }
    }
    Tensor::from_vec(out, shape.to_vec())
}

impl Kernel for ReverseSequenceKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let seq_lengths = ctx.input(1)?.to_i64_vec()?;
        macro_rules! run {
            ($tensor:expr, $variant:ident) => {
                TensorValue::$variant(reverse_sequence(
                    $tensor,
                    &seq_lengths,
                    self.batch_axis,
                    self.seq_axis,
                )?)
            };
        }
        let out = match ctx.input(0)? {
            TensorValue::F32(t) => run!(t, F32),
            TensorValue::F64(t) => run!(t, F64),
            TensorValue::I32(t) => run!(t, I32),
            TensorValue::I64(t) => run!(t, I64),
            TensorValue::U8(t) => run!(t, U8),
            other => {
                return Err(Error::invalid_argument(format!(
                    "ReverseSequence does not support {}",
                    other.dtype()
                )))
            }
        };
        ctx.set_output(0, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_major_reversal_matches_reference() {
        // [batch=4, max_seq=5, block=2], lengths [1, 3, 5, 4]
        #[rustfmt::skip]
        let input: Vec<i32> = vec![
            111, 112, 0, 0, 0, 0, 0, 0, 0, 0,
            211, 212, 221, 222, 231, 232, 0, 0, 0, 0,
            311, 312, 321, 322, 331, 332, 341, 342, 351, 352,
            411, 412, 421, 422, 431, 432, 441, 442, 0, 0,
        ];
        #[rustfmt::skip]
        let expected: Vec<i32> = vec![
            111, 112, 0, 0, 0, 0, 0, 0, 0, 0,
            231, 232, 221, 222, 211, 212, 0, 0, 0, 0,
            351, 352, 341, 342, 331, 332, 321, 322, 311, 312,
            441, 442, 431, 432, 421, 422, 411, 412, 0, 0,
        ];
        let tensor = Tensor::from_vec(input, vec![4, 5, 2]).unwrap();
        let out = reverse_sequence(&tensor, &[1, 3, 5, 4], 0, 1).unwrap();
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    fn seq_major_reversal() {
        // [max_seq=2, batch=2] with block 1
        let tensor = Tensor::from_vec(vec![1i32, 2, 3, 4], vec![2, 2]).unwrap();
        let out = reverse_sequence(&tensor, &[2, 1], 1, 0).unwrap();
        assert_eq!(out.as_slice(), &[3, 2, 1, 4]);
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        let tensor = Tensor::from_vec(vec![0i32; 4], vec![2, 2]).unwrap();
        assert!(reverse_sequence(&tensor, &[3, 0], 0, 1).is_err());
    }
}
