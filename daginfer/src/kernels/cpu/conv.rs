//! Direct 2-D convolution, the fused convolution+activation variant, and
//! inference-form batch normalization.

use crate::error::{Error, Result};
use crate::graph::{AttrLookup, Node};
use crate::tensor::{Tensor, TensorValue};

use super::super::{Kernel, KernelContext};
use super::activation::{apply_activation_f32, apply_activation_f64, ActivationKind};

pub(super) struct ConvKernel {
    strides: [usize; 2],
    pads: [usize; 4],
    dilations: [usize; 2],
    group: usize,
    activation: Option<(ActivationKind, f32)>,
}

fn ints_or<const N: usize>(node: &Node, name: &str, default: [usize; N]) -> Result<[usize; N]> {
    match node.attr_ints(name) {
        None => Ok(default),
        Some(values) => {
            if values.len() != N {
                return Err(Error::invalid_model(format!(
                    "attribute '{}' expects {} values, got {}",
                    name,
                    N,
                    values.len()
                )));
            }
            let mut out = [0usize; N];
            for (slot, &v) in out.iter_mut().zip(values.iter()) {
                if v < 0 {
                    return Err(Error::invalid_model(format!(
                        "attribute '{}' must be non-negative",
                        name
                    )));
                }
                *slot = v as usize;
            }
            Ok(out)
        }
    }
}

impl ConvKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        let strides = ints_or(node, "strides", [1, 1])?;
        let pads = ints_or(node, "pads", [0, 0, 0, 0])?;
        let dilations = ints_or(node, "dilations", [1, 1])?;
        let group = node.attr_i64("group").unwrap_or(1);
        if group < 1 {
            return Err(Error::invalid_model("Conv 'group' must be positive"));
        }
        let activation = match node.op_type.as_str() {
            "FusedConv" => {
                let kind = ActivationKind::from_attr(node.attr_str("activation").ok_or_else(
                    || Error::invalid_model("FusedConv requires an 'activation' attribute"),
                )?)?;
                let alpha = node.attr_f32("alpha").unwrap_or(0.01);
                Some((kind, alpha))
            }
            _ => None,
        };
        Ok(Self {
            strides,
            pads,
            dilations,
            group: group as usize,
            activation,
        })
    }
}

macro_rules! impl_conv2d {
    ($name:ident, $ty:ty) => {
        #[allow(clippy::too_many_arguments)]
        fn $name(
            input: &Tensor<$ty>,
            weight: &Tensor<$ty>,
            bias: Option<&Tensor<$ty>>,
            strides: [usize; 2],
            pads: [usize; 4],
            dilations: [usize; 2],
            group: usize,
        ) -> Result<Tensor<$ty>> {
            let ishape = input.shape();
            let wshape = weight.shape();
            if ishape.len() != 4 || wshape.len() != 4 {
                return Err(Error::invalid_argument(format!(
                    "Conv expects NCHW input and OIHW weights, got {:?} and {:?}",
                    ishape, wshape
                )));
            }
            let (n, c_in, h, w) = (ishape[0], ishape[1], ishape[2], ishape[3]);
            let (c_out, c_in_g, kh, kw) = (wshape[0], wshape[1], wshape[2], wshape[3]);
            if c_in_g * group != c_in || c_out % group != 0 {
                return Err(Error::invalid_argument(format!(
                    "Conv channel mismatch: input {} channels, weights {:?}, group {}",
                    c_in, wshape, group
                )));
            }
            if let Some(bias) = bias {
                if bias.shape() != [c_out] {
                    return Err(Error::invalid_argument(format!(
                        "Conv bias shape {:?} does not match {} output channels",
                        bias.shape(),
                        c_out
                    )));
                }
            }
            let [pad_t, pad_l, pad_b, pad_r] = pads;
            let [sh, sw] = strides;
            let [dh, dw] = dilations;
            let eff_kh = (kh - 1) * dh + 1;
            let eff_kw = (kw - 1) * dw + 1;
            if h + pad_t + pad_b < eff_kh || w + pad_l + pad_r < eff_kw {
                return Err(Error::invalid_argument(
                    "Conv kernel does not fit the padded input",
                ));
            }
            let oh = (h + pad_t + pad_b - eff_kh) / sh + 1;
            let ow = (w + pad_l + pad_r - eff_kw) / sw + 1;
            let c_out_g = c_out / group;

            let x = input.as_slice();
            let wt = weight.as_slice();
            let mut out = vec![0 as $ty; n * c_out * oh * ow];
            for b in 0..n {
                for co in 0..c_out {
                    let g = co / c_out_g;
                    let base = bias.map(|t| t.as_slice()[co]).unwrap_or(0.0);
                    for y in 0..oh {
                        for xo in 0..ow {
                            let mut acc = base;
                            for ci in 0..c_in_g {
                                let ic = g * c_in_g + ci;
                                for ky in 0..kh {
                                    let iy = y * sh + ky * dh;
                                    if iy < pad_t || iy - pad_t >= h {
                                        continue;
                                    }
                                    let iy = iy - pad_t;
                                    for kx in 0..kw {
                                        let ix = xo * sw + kx * dw;
                                        if ix < pad_l || ix - pad_l >= w {
                                            continue;
                                        }
                                        let ix = ix - pad_l;
                                        let xi = ((b * c_in + ic) * h + iy) * w + ix;
                                        let wi = ((co * c_in_g + ci) * kh + ky) * kw + kx;
                                        acc += x[xi] * wt[wi];
                                    }
                                }
                            }
                            out[((b * c_out + co) * oh + y) * ow + xo] = acc;
                        }
                    }
                }
            }
            Tensor::from_vec(out, vec![n, c_out, oh, ow])
        }
    };
}

impl_conv2d!(conv2d_f32, f32);
impl_conv2d!(conv2d_f64, f64);

impl Kernel for ConvKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let out = match (ctx.input(0)?, ctx.input(1)?) {
            (TensorValue::F32(x), TensorValue::F32(w)) => {
                let bias = match ctx.opt_input(2)? {
                    Some(TensorValue::F32(b)) => Some(b),
                    Some(other) => {
                        return Err(Error::invalid_argument(format!(
                            "Conv bias dtype {} does not match f32 weights",
                            other.dtype()
                        )))
                    }
                    None => None,
                };
                let mut t = conv2d_f32(
                    x,
                    w,
                    bias,
                    self.strides,
                    self.pads,
                    self.dilations,
                    self.group,
                )?;
                if let Some((kind, alpha)) = self.activation {
                    apply_activation_f32(kind, alpha, t.as_mut_slice());
                }
                TensorValue::F32(t)
            }
            (TensorValue::F64(x), TensorValue::F64(w)) => {
                let bias = match ctx.opt_input(2)? {
                    Some(TensorValue::F64(b)) => Some(b),
                    Some(other) => {
                        return Err(Error::invalid_argument(format!(
                            "Conv bias dtype {} does not match f64 weights",
                            other.dtype()
                        )))
                    }
                    None => None,
                };
                let mut t = conv2d_f64(
                    x,
                    w,
                    bias,
                    self.strides,
                    self.pads,
                    self.dilations,
                    self.group,
                )?;
                if let Some((kind, alpha)) = self.activation {
                    apply_activation_f64(kind, alpha as f64, t.as_mut_slice());
                }
                TensorValue::F64(t)
            }
            (x, w) => {
                return Err(Error::invalid_argument(format!(
                    "Conv supports f32/f64, got {} and {}",
                    x.dtype(),
                    w.dtype()
                )))
            }
        };
        ctx.set_output(0, out)
    }
}

pub(super) struct BatchNormKernel {
    epsilon: f64,
}

impl BatchNormKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        Ok(Self {
            epsilon: node.attr_f32("epsilon").unwrap_or(1e-5) as f64,
        })
    }
}

macro_rules! impl_batch_norm {
    ($name:ident, $ty:ty) => {
        fn $name(
            x: &Tensor<$ty>,
            scale: &Tensor<$ty>,
            bias: &Tensor<$ty>,
            mean: &Tensor<$ty>,
            var: &Tensor<$ty>,
            epsilon: $ty,
        ) -> Result<Tensor<$ty>> {
            let shape = x.shape();
            if shape.len() < 2 {
                return Err(Error::invalid_argument(
                    "BatchNormalization expects a rank >= 2 input",
                ));
            }
            let channels = shape[1];
            for (name, t) in [
                ("scale", scale),
                ("B", bias),
                ("mean", mean),
                ("var", var),
            ] {
                if t.shape() != [channels] {
                    return Err(Error::invalid_argument(format!(
                        "BatchNormalization '{}' shape {:?} does not match {} channels",
                        name,
                        t.shape(),
                        channels
                    )));
                }
            }
            let inner: usize = shape[2..].iter().product();
            let batch = shape[0];
            let xs = x.as_slice();
            let mut out = Vec::with_capacity(xs.len());
            for b in 0..batch {
                for c in 0..channels {
                    let s = scale.as_slice()[c] / (var.as_slice()[c] + epsilon).sqrt();
                    let m = mean.as_slice()[c];
                    let off = bias.as_slice()[c];
                    let base = (b * channels + c) * inner;
                    for i in 0..inner {
                        out.push((xs[base + i] - m) * s + off);
                    }
                }
            }
            Tensor::from_vec(out, shape.to_vec())
        }
    };
}

impl_batch_norm!(batch_norm_f32, f32);
impl_batch_norm!(batch_norm_f64, f64);

impl Kernel for BatchNormKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let out = match (
            ctx.input(0)?,
            ctx.input(1)?,
            ctx.input(2)?,
            ctx.input(3)?,
            ctx.input(4)?,
        ) {
            (
                TensorValue::F32(x),
                TensorValue::F32(scale),
                TensorValue::F32(b),
                TensorValue::F32(mean),
                TensorValue::F32(var),
            ) => TensorValue::F32(batch_norm_f32(
                x,
                scale,
                b,
                mean,
                var,
                self.epsilon as f32,
            )?),
            (
                TensorValue::F64(x),
                TensorValue::F64(scale),
                TensorValue::F64(b),
                TensorValue::F64(mean),
                TensorValue::F64(var),
            ) => TensorValue::F64(batch_norm_f64(x, scale, b, mean, var, self.epsilon)?),
            _ => {
                return Err(Error::invalid_argument(
                    "BatchNormalization expects homogeneous f32 or f64 inputs",
                ))
            }
        };
        ctx.set_output(0, out)
    }
}
