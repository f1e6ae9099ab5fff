//! Type-erased tensor values and the executor-facing value sum type.

use std::any::Any;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::dtype::{DType, F16};
use super::tensor::{MemoryInfo, Tensor};

/// A tensor of any supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    F16(Tensor<F16>),
    F32(Tensor<f32>),
    F64(Tensor<f64>),
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    U8(Tensor<u8>),
    Bool(Tensor<bool>),
}

macro_rules! with_tensor {
    ($value:expr, $tensor:ident => $body:expr) => {
        match $value {
            TensorValue::F16($tensor) => $body,
            TensorValue::F32($tensor) => $body,
            TensorValue::F64($tensor) => $body,
            TensorValue::I32($tensor) => $body,
            TensorValue::I64($tensor) => $body,
            TensorValue::U8($tensor) => $body,
            TensorValue::Bool($tensor) => $body,
        }
    };
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F16(_) => DType::F16,
            TensorValue::F32(_) => DType::F32,
            TensorValue::F64(_) => DType::F64,
            TensorValue::I32(_) => DType::I32,
            TensorValue::I64(_) => DType::I64,
            TensorValue::U8(_) => DType::U8,
            TensorValue::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_tensor!(self, t => t.shape())
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn numel(&self) -> usize {
        with_tensor!(self, t => t.numel())
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype().size_of()
    }

    pub fn location(&self) -> &MemoryInfo {
        with_tensor!(self, t => t.location())
    }

    pub fn set_location(&mut self, location: MemoryInfo) {
        with_tensor!(self, t => t.set_location(location))
    }

    /// Serialize the buffer to little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TensorValue::F16(t) => bytemuck::cast_slice(t.as_slice()).to_vec(),
            TensorValue::F32(t) => bytemuck::cast_slice(t.as_slice()).to_vec(),
            TensorValue::F64(t) => bytemuck::cast_slice(t.as_slice()).to_vec(),
            TensorValue::I32(t) => bytemuck::cast_slice(t.as_slice()).to_vec(),
            TensorValue::I64(t) => bytemuck::cast_slice(t.as_slice()).to_vec(),
            TensorValue::U8(t) => t.as_slice().to_vec(),
            TensorValue::Bool(t) => t.as_slice().iter().map(|&b| b as u8).collect(),
        }
    }

    /// Rebuild a tensor from raw bytes produced by `to_bytes`.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        let expected = super::shape::numel(&shape) * dtype.size_of();
        if bytes.len() != expected {
            return Err(Error::invalid_model(format!(
                "tensor byte length mismatch: expected {}, got {}",
                expected,
                bytes.len()
            )));
        }
        fn cast_vec<T: bytemuck::Pod>(bytes: &[u8]) -> Result<Vec<T>> {
            bytemuck::try_cast_slice::<u8, T>(bytes)
                .map(|s| s.to_vec())
                .map_err(|err| Error::invalid_model(format!("misaligned tensor data: {}", err)))
        }
        Ok(match dtype {
            DType::F16 => TensorValue::F16(Tensor::from_vec(cast_vec(bytes)?, shape)?),
            DType::F32 => TensorValue::F32(Tensor::from_vec(cast_vec(bytes)?, shape)?),
            DType::F64 => TensorValue::F64(Tensor::from_vec(cast_vec(bytes)?, shape)?),
            DType::I32 => TensorValue::I32(Tensor::from_vec(cast_vec(bytes)?, shape)?),
            DType::I64 => TensorValue::I64(Tensor::from_vec(cast_vec(bytes)?, shape)?),
            DType::U8 => TensorValue::U8(Tensor::from_vec(bytes.to_vec(), shape)?),
            DType::Bool => TensorValue::Bool(Tensor::from_vec(
                bytes.iter().map(|&b| b != 0).collect(),
                shape,
            )?),
        })
    }

    /// Elementwise conversion to another dtype. Floating values round-trip
    /// through f64, integral values through i64.
    pub fn cast_to(&self, target: DType) -> Result<TensorValue> {
        if target == self.dtype() {
            return Ok(self.clone());
        }
        let shape = self.shape().to_vec();
        let values = self.to_f64_vec();
        let mut out = TensorValue::from_f64_vec(target, shape, &values)?;
        out.set_location(self.location().clone());
        Ok(out)
    }

    pub(crate) fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            TensorValue::F16(t) => t.as_slice().iter().map(|v| v.to_f32() as f64).collect(),
            TensorValue::F32(t) => t.as_slice().iter().map(|&v| v as f64).collect(),
            TensorValue::F64(t) => t.as_slice().to_vec(),
            TensorValue::I32(t) => t.as_slice().iter().map(|&v| v as f64).collect(),
            TensorValue::I64(t) => t.as_slice().iter().map(|&v| v as f64).collect(),
            TensorValue::U8(t) => t.as_slice().iter().map(|&v| v as f64).collect(),
            TensorValue::Bool(t) => t.as_slice().iter().map(|&v| v as u8 as f64).collect(),
        }
    }

    pub(crate) fn from_f64_vec(dtype: DType, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        Ok(match dtype {
            DType::F16 => TensorValue::F16(Tensor::from_vec(
                values.iter().map(|&v| F16::from_f32(v as f32)).collect(),
                shape,
            )?),
            DType::F32 => TensorValue::F32(Tensor::from_vec(
                values.iter().map(|&v| v as f32).collect(),
                shape,
            )?),
            DType::F64 => TensorValue::F64(Tensor::from_vec(values.to_vec(), shape)?),
            DType::I32 => TensorValue::I32(Tensor::from_vec(
                values.iter().map(|&v| v as i32).collect(),
                shape,
            )?),
            DType::I64 => TensorValue::I64(Tensor::from_vec(
                values.iter().map(|&v| v as i64).collect(),
                shape,
            )?),
            DType::U8 => TensorValue::U8(Tensor::from_vec(
                values.iter().map(|&v| v as u8).collect(),
                shape,
            )?),
            DType::Bool => TensorValue::Bool(Tensor::from_vec(
                values.iter().map(|&v| v != 0.0).collect(),
                shape,
            )?),
        })
    }

    /// Integral view used by attribute-like tensor inputs (`seq_lengths`).
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self {
            TensorValue::I32(t) => Ok(t.as_slice().iter().map(|&v| v as i64).collect()),
            TensorValue::I64(t) => Ok(t.as_slice().to_vec()),
            other => Err(Error::invalid_argument(format!(
                "expected an integral tensor, got {}",
                other.dtype()
            ))),
        }
    }
}

/// Element type that can be converted to/from `TensorValue`.
pub trait TensorElement: Sized + Clone {
    const DTYPE: DType;

    fn from_value(value: &TensorValue) -> Option<&Tensor<Self>>;
    fn into_value(tensor: Tensor<Self>) -> TensorValue;
}

macro_rules! impl_tensor_element {
    ($ty:ty, $variant:ident, $dtype:expr) => {
        impl TensorElement for $ty {
            const DTYPE: DType = $dtype;

            fn from_value(value: &TensorValue) -> Option<&Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor),
                    _ => None,
                }
            }

            fn into_value(tensor: Tensor<Self>) -> TensorValue {
                TensorValue::$variant(tensor)
            }
        }

        impl From<Tensor<$ty>> for TensorValue {
            fn from(tensor: Tensor<$ty>) -> TensorValue {
                TensorValue::$variant(tensor)
            }
        }
    };
}

impl_tensor_element!(F16, F16, DType::F16);
impl_tensor_element!(f32, F32, DType::F32);
impl_tensor_element!(f64, F64, DType::F64);
impl_tensor_element!(i32, I32, DType::I32);
impl_tensor_element!(i64, I64, DType::I64);
impl_tensor_element!(u8, U8, DType::U8);
impl_tensor_element!(bool, Bool, DType::Bool);

/// Value held by an executor slot.
///
/// The executor never inspects `Opaque` payloads; tensors are shared by
/// reference count so hand-off between producer and consumers is zero-copy.
#[derive(Clone)]
pub enum Value {
    Tensor(Arc<TensorValue>),
    Sequence(Vec<Arc<TensorValue>>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn from_tensor(tensor: TensorValue) -> Self {
        Value::Tensor(Arc::new(tensor))
    }

    pub fn as_tensor(&self) -> Result<&TensorValue> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            Value::Sequence(_) => Err(Error::invalid_argument(
                "expected a tensor, got a tensor sequence",
            )),
            Value::Opaque(_) => Err(Error::invalid_argument(
                "expected a tensor, got an opaque value",
            )),
        }
    }

    pub fn tensor_arc(&self) -> Result<Arc<TensorValue>> {
        match self {
            Value::Tensor(tensor) => Ok(tensor.clone()),
            _ => Err(Error::invalid_argument("expected a tensor value")),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Tensor(tensor) => write!(f, "Tensor({}{:?})", tensor.dtype(), tensor.shape()),
            Value::Sequence(items) => write!(f, "Sequence(len={})", items.len()),
            Value::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

impl From<TensorValue> for Value {
    fn from(tensor: TensorValue) -> Self {
        Value::from_tensor(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_preserves_values() {
        let original = TensorValue::F32(
            Tensor::from_vec(vec![1.5f32, -2.0, 0.0, 3.25], vec![2, 2]).unwrap(),
        );
        let bytes = original.to_bytes();
        let restored = TensorValue::from_bytes(DType::F32, vec![2, 2], &bytes).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn bool_bytes_round_trip() {
        let original =
            TensorValue::Bool(Tensor::from_vec(vec![true, false, true], vec![3]).unwrap());
        let restored =
            TensorValue::from_bytes(DType::Bool, vec![3], &original.to_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn cast_f32_to_f16_and_back() {
        let t = TensorValue::F32(Tensor::from_vec(vec![1.0f32, -0.5], vec![2]).unwrap());
        let half = t.cast_to(DType::F16).unwrap();
        assert_eq!(half.dtype(), DType::F16);
        let back = half.cast_to(DType::F32).unwrap();
        assert_eq!(back, t);
    }
}
