//! Arithmetic over initializer tensors, used by the fusion rewrites.
//!
//! Values are widened to f64 for the computation and written back in the
//! source dtype; only f32 and f64 initializers participate in fusions.

use crate::error::{Error, Result};
use crate::tensor::{DType, TensorValue};

pub(crate) struct Initializer {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Initializer {
    pub fn supported(value: &TensorValue) -> bool {
        matches!(value.dtype(), DType::F32 | DType::F64)
    }

    pub fn try_from_value(value: &TensorValue) -> Result<Self> {
        if !Self::supported(value) {
            return Err(Error::invalid_model(format!(
                "initializer arithmetic supports f32/f64 only, got {}",
                value.dtype()
            )));
        }
        Ok(Self {
            dtype: value.dtype(),
            shape: value.shape().to_vec(),
            data: value.to_f64_vec(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    fn check_same_shape(&self, other: &Initializer) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::invalid_model(format!(
                "initializer shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }

    /// The single value of a one-element initializer.
    pub fn scalar(&self) -> Result<f64> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(Error::invalid_model(format!(
                "expected a scalar initializer, got {} values",
                self.data.len()
            ))),
        }
    }

    pub fn add_scalar(&mut self, value: f64) {
        for v in &mut self.data {
            *v += value;
        }
    }

    pub fn sqrt(&mut self) {
        for v in &mut self.data {
            *v = v.sqrt();
        }
    }

    pub fn add(&mut self, other: &Initializer) -> Result<()> {
        self.check_same_shape(other)?;
        for (v, o) in self.data.iter_mut().zip(other.data.iter()) {
            *v += o;
        }
        Ok(())
    }

    pub fn sub(&mut self, other: &Initializer) -> Result<()> {
        self.check_same_shape(other)?;
        for (v, o) in self.data.iter_mut().zip(other.data.iter()) {
            *v -= o;
        }
        Ok(())
    }

    pub fn mul(&mut self, other: &Initializer) -> Result<()> {
        self.check_same_shape(other)?;
        for (v, o) in self.data.iter_mut().zip(other.data.iter()) {
            *v *= o;
        }
        Ok(())
    }

    pub fn div(&mut self, other: &Initializer) -> Result<()> {
        self.check_same_shape(other)?;
        for (v, o) in self.data.iter_mut().zip(other.data.iter()) {
            *v /= o;
        }
        Ok(())
    }

    /// Multiply contiguous blocks by the matching entry of `other`. The
    /// block is the product of the dims from `axis` onward; `other` must
    /// hold one value per block, or a single value broadcast over all.
    pub fn scale_by_axis(&mut self, other: &Initializer, axis: usize) -> Result<()> {
        if axis > self.shape.len() {
            return Err(Error::invalid_model(format!(
                "scale axis {} out of range for rank {}",
                axis,
                self.shape.len()
            )));
        }
        let block: usize = self.shape[axis..].iter().product();
        if block == 0 {
            return Ok(());
        }
        let outer = self.data.len() / block;
        if other.numel() != outer && other.numel() != 1 {
            return Err(Error::invalid_model(format!(
                "scale tensor has {} values for {} blocks",
                other.numel(),
                outer
            )));
        }
        for i in 0..outer {
            let factor = if other.numel() == 1 {
                other.data[0]
            } else {
                other.data[i]
            };
            for v in &mut self.data[i * block..(i + 1) * block] {
                *v *= factor;
            }
        }
        Ok(())
    }

    /// Write the values back out in the original dtype.
    pub fn to_tensor(&self) -> Result<TensorValue> {
        TensorValue::from_f64_vec(self.dtype, self.shape.clone(), &self.data)
    }

    /// Same values under a new shape with equal element count.
    pub fn to_tensor_with_shape(&self, shape: Vec<usize>) -> Result<TensorValue> {
        TensorValue::from_f64_vec(self.dtype, shape, &self.data)
    }
}
