//! Elementwise arithmetic kernels with NumPy-style broadcasting.

use crate::error::{Error, Result};
use crate::tensor::shape::{broadcast_offset, broadcast_shapes, linear_to_indices, numel};
use crate::tensor::{Tensor, TensorValue};

use super::super::KernelContext;

pub(super) fn binary_map<T, F>(a: &Tensor<T>, b: &Tensor<T>, f: F) -> Result<Tensor<T>>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    if a.shape() == b.shape() {
        let out = a
            .as_slice()
            .iter()
            .zip(b.as_slice().iter())
            .map(|(&x, &y)| f(x, y))
            .collect();
        return Tensor::from_vec(out, a.shape().to_vec());
    }
    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    let len = numel(&out_shape);
    let mut out = Vec::with_capacity(len);
    let a_data = a.as_slice();
    let b_data = b.as_slice();
    for linear in 0..len {
        let indices = linear_to_indices(linear, &out_shape);
        let x = a_data[broadcast_offset(a.shape(), &indices)];
        let y = b_data[broadcast_offset(b.shape(), &indices)];
        out.push(f(x, y));
    }
    Tensor::from_vec(out, out_shape)
}

macro_rules! binary_arith {
    ($ctx:expr, $f:expr) => {{
        let a = $ctx.input(0)?;
        let b = $ctx.input(1)?;
        let out = match (a, b) {
            (TensorValue::F32(x), TensorValue::F32(y)) => TensorValue::F32(binary_map(x, y, $f)?),
            (TensorValue::F64(x), TensorValue::F64(y)) => TensorValue::F64(binary_map(x, y, $f)?),
            (TensorValue::I32(x), TensorValue::I32(y)) => TensorValue::I32(binary_map(x, y, $f)?),
            (TensorValue::I64(x), TensorValue::I64(y)) => TensorValue::I64(binary_map(x, y, $f)?),
            (a, b) => {
                return Err(Error::invalid_argument(format!(
                    "unsupported operand dtypes {} and {}",
                    a.dtype(),
                    b.dtype()
                )))
            }
        };
        $ctx.set_output(0, out)
    }};
}

macro_rules! unary_arith {
    ($ctx:expr, $f:expr) => {{
        let out = match $ctx.input(0)? {
            TensorValue::F32(x) => {
                TensorValue::F32(Tensor::from_vec(
                    x.as_slice().iter().map(|&v| $f(v)).collect(),
                    x.shape().to_vec(),
                )?)
            }
            TensorValue::F64(x) => {
                TensorValue::F64(Tensor::from_vec(
                    x.as_slice().iter().map(|&v| $f(v)).collect(),
                    x.shape().to_vec(),
                )?)
            }
            TensorValue::I32(x) => {
                TensorValue::I32(Tensor::from_vec(
                    x.as_slice().iter().map(|&v| $f(v)).collect(),
                    x.shape().to_vec(),
                )?)
            }
            TensorValue::I64(x) => {
                TensorValue::I64(Tensor::from_vec(
                    x.as_slice().iter().map(|&v| $f(v)).collect(),
                    x.shape().to_vec(),
                )?)
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported operand dtype {}",
                    other.dtype()
                )))
            }
        };
        $ctx.set_output(0, out)
    }};
}

pub(super) fn add(ctx: &mut KernelContext<'_>) -> Result<()> {
    binary_arith!(ctx, |x, y| x + y)
}

pub(super) fn sub(ctx: &mut KernelContext<'_>) -> Result<()> {
    binary_arith!(ctx, |x, y| x - y)
}

pub(super) fn mul(ctx: &mut KernelContext<'_>) -> Result<()> {
    binary_arith!(ctx, |x, y| x * y)
}

fn abs_val<T: PartialOrd + std::ops::Neg<Output = T> + Default>(v: T) -> T {
    if v < T::default() {
        -v
    } else {
        v
    }
}

pub(super) fn abs(ctx: &mut KernelContext<'_>) -> Result<()> {
    unary_arith!(ctx, abs_val)
}

/// Variadic elementwise maximum, folded pairwise with broadcasting.
pub(super) fn max(ctx: &mut KernelContext<'_>) -> Result<()> {
    if ctx.input_count() == 0 {
        return Err(Error::invalid_argument("Max expects at least one input"));
    }
    let mut acc = ctx.input(0)?.clone();
    for index in 1..ctx.input_count() {
        let next = ctx.input(index)?;
        acc = match (&acc, next) {
            (TensorValue::F32(x), TensorValue::F32(y)) => {
                TensorValue::F32(binary_map(x, y, |a, b| if a > b { a } else { b })?)
            }
            (TensorValue::F64(x), TensorValue::F64(y)) => {
                TensorValue::F64(binary_map(x, y, |a, b| if a > b { a } else { b })?)
            }
            (TensorValue::I32(x), TensorValue::I32(y)) => {
                TensorValue::I32(binary_map(x, y, |a, b| if a > b { a } else { b })?)
            }
            (TensorValue::I64(x), TensorValue::I64(y)) => {
                TensorValue::I64(binary_map(x, y, |a, b| if a > b { a } else { b })?)
            }
            (a, b) => {
                return Err(Error::invalid_argument(format!(
                    "unsupported operand dtypes {} and {}",
                    a.dtype(),
                    b.dtype()
                )))
            }
        };
    }
    ctx.set_output(0, acc)
}
