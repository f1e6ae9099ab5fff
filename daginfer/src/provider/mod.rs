//! Execution providers: kernel registries, allocators, and cross-device
//! copies for one device family.

mod cpu;
mod fence;

use std::sync::Arc;

pub use cpu::{CpuAllocator, CpuExecutionProvider};
pub use fence::Fence;

use crate::error::Result;
use crate::kernels::KernelRegistry;
use crate::tensor::{MemKind, MemoryInfo, TensorValue};

/// Hands out buffers for one `MemoryInfo` identity.
pub trait Allocator: Send + Sync {
    fn info(&self) -> &MemoryInfo;

    /// Claim a zeroed buffer of `nbytes`. Exhaustion surfaces as
    /// `Error::ResourceExhausted`.
    fn allocate(&self, nbytes: usize) -> Result<Vec<u8>>;
}

/// One device family: a kernel registry, allocators, and staging copies.
///
/// Providers are registered on the session before `initialize`; the
/// registration order is the assignment priority order.
pub trait ExecutionProvider: Send + Sync {
    /// Unique identifier, e.g. `"cpu"`.
    fn provider_type(&self) -> &str;

    fn allocator(&self, device_id: i32, kind: MemKind) -> Arc<dyn Allocator>;

    /// Copy `src` into the caller-owned `dst` buffer. Used for feed
    /// staging and for fetches bound to a buffer on another device.
    fn copy_tensor(&self, src: &TensorValue, dst: &mut TensorValue) -> Result<()>;

    /// Called once per run before any node of this provider fires.
    fn on_run_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once per run after the run drained.
    fn on_run_end(&self) -> Result<()> {
        Ok(())
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry>;

    /// Fence factory for tensors this provider produces across an
    /// asynchronous boundary. Synchronous devices return `None`.
    fn create_fence(&self) -> Option<Arc<dyn Fence>> {
        None
    }
}
