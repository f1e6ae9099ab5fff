//! The kernel interface and the built-in CPU kernel set.

mod context;
pub mod cpu;
mod registry;

use std::sync::Arc;

use once_cell::sync::Lazy;

pub use context::KernelContext;
pub use registry::{KernelDef, KernelDefBuilder, KernelEntry, KernelFactory, KernelRegistry};

use crate::error::Result;
use crate::tensor::TensorValue;

/// A concrete operator implementation for one provider.
pub trait Kernel: Send + Sync {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;

    /// Optional plan-time transformation of an initializer input into a
    /// faster layout. Returns whether the kernel kept the prepacked form;
    /// whatever it keeps lives in the session state alongside the kernel.
    fn prepack(&mut self, _input_index: usize, _initializer: &TensorValue) -> Result<bool> {
        Ok(false)
    }
}

static CPU_REGISTRY: Lazy<Arc<KernelRegistry>> = Lazy::new(|| {
    let mut registry = KernelRegistry::new();
    cpu::register_all(&mut registry);
    Arc::new(registry)
});

/// The process-wide CPU kernel registry, built once on first use.
pub fn cpu_kernel_registry() -> Arc<KernelRegistry> {
    CPU_REGISTRY.clone()
}
