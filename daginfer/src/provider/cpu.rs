//! The default host provider.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kernels::{cpu_kernel_registry, KernelRegistry};
use crate::tensor::{MemKind, MemoryInfo, TensorValue};

use super::{Allocator, ExecutionProvider};

pub struct CpuAllocator {
    info: MemoryInfo,
}

impl CpuAllocator {
    pub fn new() -> Self {
        Self {
            info: MemoryInfo::cpu(),
        }
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for CpuAllocator {
    fn info(&self) -> &MemoryInfo {
        &self.info
    }

    fn allocate(&self, nbytes: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(nbytes)
            .map_err(|_| Error::ResourceExhausted(format!("cpu allocation of {} bytes", nbytes)))?;
        buffer.resize(nbytes, 0);
        Ok(buffer)
    }
}

pub struct CpuExecutionProvider {
    allocator: Arc<CpuAllocator>,
    registry: Arc<KernelRegistry>,
}

impl CpuExecutionProvider {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(CpuAllocator::new()),
            registry: cpu_kernel_registry(),
        }
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_type(&self) -> &str {
        "cpu"
    }

    fn allocator(&self, _device_id: i32, _kind: MemKind) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn copy_tensor(&self, src: &TensorValue, dst: &mut TensorValue) -> Result<()> {
        if src.dtype() != dst.dtype() {
            return Err(Error::invalid_argument(format!(
                "copy_tensor dtype mismatch: {} vs {}",
                src.dtype(),
                dst.dtype()
            )));
        }
        if src.shape() != dst.shape() {
            return Err(Error::invalid_argument(format!(
                "copy_tensor shape mismatch: {:?} vs {:?}",
                src.shape(),
                dst.shape()
            )));
        }
        let location = dst.location().clone();
        let mut copied = src.clone();
        copied.set_location(location);
        *dst = copied;
        Ok(())
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry> {
        self.registry.clone()
    }
}
