//! Unary activation kernels (float only) and the shared application
//! helper used by the fused convolution kernel.

use crate::error::{Error, Result};
use crate::graph::{AttrLookup, Node};
use crate::tensor::{Tensor, TensorValue};

use super::super::{Kernel, KernelContext};

/// Activation kinds a convolution can absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Softsign,
    Tanh,
    LeakyRelu,
}

impl ActivationKind {
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Relu" => Some(ActivationKind::Relu),
            "Sigmoid" => Some(ActivationKind::Sigmoid),
            "Softsign" => Some(ActivationKind::Softsign),
            "Tanh" => Some(ActivationKind::Tanh),
            "LeakyRelu" => Some(ActivationKind::LeakyRelu),
            _ => None,
        }
    }

    pub fn from_attr(value: &str) -> Result<Self> {
        Self::from_op_type(value).ok_or_else(|| {
            Error::invalid_model(format!("unknown activation kind '{}'", value))
        })
    }

    pub fn op_type(self) -> &'static str {
        match self {
            ActivationKind::Relu => "Relu",
            ActivationKind::Sigmoid => "Sigmoid",
            ActivationKind::Softsign => "Softsign",
            ActivationKind::Tanh => "Tanh",
            ActivationKind::LeakyRelu => "LeakyRelu",
        }
    }
}

macro_rules! impl_apply_activation {
    ($name:ident, $ty:ty) => {
        pub(super) fn $name(kind: ActivationKind, alpha: $ty, data: &mut [$ty]) {
            match kind {
                ActivationKind::Relu => {
                    for v in data.iter_mut() {
                        if *v < 0.0 {
                            *v = 0.0;
                        }
                    }
                }
                ActivationKind::Sigmoid => {
                    for v in data.iter_mut() {
                        *v = 1.0 / (1.0 + (-*v).exp());
                    }
                }
                ActivationKind::Softsign => {
                    for v in data.iter_mut() {
                        *v = *v / (1.0 + v.abs());
                    }
                }
                ActivationKind::Tanh => {
                    for v in data.iter_mut() {
                        *v = v.tanh();
                    }
                }
                ActivationKind::LeakyRelu => {
                    for v in data.iter_mut() {
                        if *v < 0.0 {
                            *v *= alpha;
                        }
                    }
                }
            }
        }
    };
}

impl_apply_activation!(apply_activation_f32, f32);
impl_apply_activation!(apply_activation_f64, f64);

/// Standalone activation kernel; the op type selects the function.
pub(super) struct ActivationKernel {
    kind: ActivationKind,
    alpha: f32,
}

impl ActivationKernel {
    pub(super) fn try_new(node: &Node) -> Result<Self> {
        let kind = ActivationKind::from_attr(&node.op_type)?;
        let alpha = match kind {
            ActivationKind::LeakyRelu => node.attr_f32("alpha").unwrap_or(0.01),
            _ => 0.0,
        };
        Ok(Self { kind, alpha })
    }
}

impl Kernel for ActivationKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let out = match ctx.input(0)? {
            TensorValue::F32(t) => {
                let mut data = t.to_vec();
                apply_activation_f32(self.kind, self.alpha, &mut data);
                TensorValue::F32(Tensor::from_vec(data, t.shape().to_vec())?)
            }
            TensorValue::F64(t) => {
                let mut data = t.to_vec();
                apply_activation_f64(self.kind, self.alpha as f64, &mut data);
                TensorValue::F64(Tensor::from_vec(data, t.shape().to_vec())?)
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "activation expects a float tensor, got {}",
                    other.dtype()
                )))
            }
        };
        ctx.set_output(0, out)
    }
}
