//! Owned tensor container.
//!
//! `Tensor<T>` owns a contiguous flat buffer with shape metadata and the
//! identity of the allocator that produced it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::shape::{numel, offset_for};

/// The kind of memory an allocator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemKind {
    #[default]
    Default,
    /// Host-visible staging memory on a device provider.
    CpuAccessible,
}

/// Identity of the allocator that owns a tensor's buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub provider: String,
    pub device_id: i32,
    pub kind: MemKind,
}

impl MemoryInfo {
    pub fn cpu() -> Self {
        Self {
            provider: "cpu".to_string(),
            device_id: 0,
            kind: MemKind::Default,
        }
    }

    pub fn new(provider: impl Into<String>, device_id: i32, kind: MemKind) -> Self {
        Self {
            provider: provider.into(),
            device_id,
            kind,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.provider == "cpu"
    }
}

impl Default for MemoryInfo {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Owned contiguous tensor with shape metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    data: Vec<T>,
    shape: Vec<usize>,
    location: MemoryInfo,
}

impl<T> Tensor<T> {
    /// Build a tensor from a flat buffer and a shape. The element count of
    /// the shape must match the buffer length.
    pub fn from_vec(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let expected = numel(&shape);
        if expected != data.len() {
            return Err(Error::invalid_argument(format!(
                "tensor shape {:?} expects {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            shape,
            location: MemoryInfo::cpu(),
        })
    }

    /// Rank-1 tensor over the buffer.
    pub fn from_flat(data: Vec<T>) -> Self {
        let shape = vec![data.len()];
        Self {
            data,
            shape,
            location: MemoryInfo::cpu(),
        }
    }

    /// Rank-0 tensor holding one value.
    pub fn from_scalar(value: T) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
            location: MemoryInfo::cpu(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn location(&self) -> &MemoryInfo {
        &self.location
    }

    pub fn set_location(&mut self, location: MemoryInfo) {
        self.location = location;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Access a value by multidimensional indices.
    pub fn at(&self, indices: &[usize]) -> Result<&T> {
        let offset = offset_for(&self.shape, indices)?;
        Ok(&self.data[offset])
    }

    /// Reinterpret the buffer under a new shape with the same element count.
    pub fn reshaped(mut self, shape: Vec<usize>) -> Result<Self> {
        if numel(&shape) != self.data.len() {
            return Err(Error::invalid_argument(format!(
                "cannot reshape {} elements into {:?}",
                self.data.len(),
                shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }
}

impl<T: Clone> Tensor<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.data.clone()
    }

    /// Filled tensor of the given shape.
    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let data = vec![value; numel(&shape)];
        Self {
            data,
            shape,
            location: MemoryInfo::cpu(),
        }
    }
}
