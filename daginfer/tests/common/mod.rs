//! Shared helpers for the integration tests: tensor builders, comparison,
//! and the instrumented test providers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use anyhow::{anyhow, Result};

use daginfer::error::Result as DagResult;
use daginfer::kernels::{Kernel, KernelContext, KernelDef, KernelRegistry};
use daginfer::tensor::{MemKind, MemoryInfo, Tensor};
use daginfer::{
    Allocator, AttrLookup, DType, ExecutionProvider, Fence, TensorValue, Value,
};

pub fn f32_tensor(data: Vec<f32>, shape: Vec<usize>) -> TensorValue {
    TensorValue::F32(Tensor::from_vec(data, shape).expect("test tensor shape"))
}

pub fn i32_tensor(data: Vec<i32>, shape: Vec<usize>) -> TensorValue {
    TensorValue::I32(Tensor::from_vec(data, shape).expect("test tensor shape"))
}

pub fn bool_scalar(value: bool) -> TensorValue {
    TensorValue::Bool(Tensor::from_vec(vec![value], vec![1]).expect("test tensor shape"))
}

pub fn feeds(pairs: Vec<(&str, TensorValue)>) -> HashMap<String, Value> {
    pairs
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), Value::from_tensor(tensor)))
        .collect()
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn fetch_f32(value: &Value) -> Result<Vec<f32>> {
    match value.as_tensor().map_err(|e| anyhow!("{}", e))? {
        TensorValue::F32(t) => Ok(t.to_vec()),
        other => Err(anyhow!("expected f32 tensor, got {}", other.dtype())),
    }
}

pub fn fetch_i32(value: &Value) -> Result<Vec<i32>> {
    match value.as_tensor().map_err(|e| anyhow!("{}", e))? {
        TensorValue::I32(t) => Ok(t.to_vec()),
        other => Err(anyhow!("expected i32 tensor, got {}", other.dtype())),
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let denom = e.abs().max(1.0);
        assert!(
            (a - e).abs() / denom <= tol,
            "index {}: {} vs {} (tol {})",
            i,
            a,
            e,
            tol
        );
    }
}

// ---------------------------------------------------------------------
// Instrumented host provider: extra ops on ordinary CPU memory.

struct PassThroughAllocator {
    info: MemoryInfo,
}

impl Allocator for PassThroughAllocator {
    fn info(&self) -> &MemoryInfo {
        &self.info
    }

    fn allocate(&self, nbytes: usize) -> DagResult<Vec<u8>> {
        Ok(vec![0u8; nbytes])
    }
}

struct ThreadTagKernel {
    seen: Arc<Mutex<Vec<(String, ThreadId)>>>,
    delay: Duration,
}

impl Kernel for ThreadTagKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> DagResult<()> {
        self.seen
            .lock()
            .expect("thread tag mutex")
            .push((ctx.node().name.clone(), std::thread::current().id()));
        std::thread::sleep(self.delay);
        let value = ctx.input_value(0)?;
        ctx.set_output_value(0, value)
    }
}

struct SleepKernel {
    millis: u64,
}

impl Kernel for SleepKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> DagResult<()> {
        std::thread::sleep(Duration::from_millis(self.millis));
        let value = ctx.input_value(0)?;
        ctx.set_output_value(0, value)
    }
}

struct FailKernel;

impl Kernel for FailKernel {
    fn compute(&self, _ctx: &mut KernelContext<'_>) -> DagResult<()> {
        Err(daginfer::Error::invalid_argument("deliberate test failure"))
    }
}

/// Host-memory provider contributing `ThreadTag`, `Sleep`, and `Fail`
/// ops; everything else falls through to the CPU provider.
pub struct TestOpsProvider {
    allocator: Arc<PassThroughAllocator>,
    registry: Arc<KernelRegistry>,
    pub seen_threads: Arc<Mutex<Vec<(String, ThreadId)>>>,
}

impl TestOpsProvider {
    pub fn new() -> Self {
        let seen_threads: Arc<Mutex<Vec<(String, ThreadId)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let mut registry = KernelRegistry::new();
        let seen = seen_threads.clone();
        registry.register(
            KernelDef::build("ThreadTag")
                .provider("testops")
                .type_constraint("T", &[DType::F32])
                .input_bindings(&["T"])
                .finish(),
            Box::new(move |_node| {
                Ok(Box::new(ThreadTagKernel {
                    seen: seen.clone(),
                    delay: Duration::from_millis(40),
                }))
            }),
        );
        registry.register(
            KernelDef::build("Sleep")
                .provider("testops")
                .type_constraint("T", &[DType::F32])
                .input_bindings(&["T"])
                .finish(),
            Box::new(|node| {
                let millis = node.attr_i64("millis").unwrap_or(50) as u64;
                Ok(Box::new(SleepKernel { millis }))
            }),
        );
        registry.register(
            KernelDef::build("Fail")
                .provider("testops")
                .type_constraint("T", &[DType::F32])
                .input_bindings(&["T"])
                .finish(),
            Box::new(|_node| Ok(Box::new(FailKernel))),
        );
        Self {
            allocator: Arc::new(PassThroughAllocator {
                info: MemoryInfo::cpu(),
            }),
            registry: Arc::new(registry),
            seen_threads,
        }
    }
}

impl ExecutionProvider for TestOpsProvider {
    fn provider_type(&self) -> &str {
        "testops"
    }

    fn allocator(&self, _device_id: i32, _kind: MemKind) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn copy_tensor(&self, src: &TensorValue, dst: &mut TensorValue) -> DagResult<()> {
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

// ---------------------------------------------------------------------
// Fenced "device" provider with its own allocator identity.

struct RecordingFence {
    events: Arc<Mutex<Vec<String>>>,
}

impl Fence for RecordingFence {
    fn before_using_as_input(&self, provider_type: &str, queue_id: usize) {
        self.events
            .lock()
            .expect("fence mutex")
            .push(format!("before_input:{}:{}", provider_type, queue_id));
    }

    fn before_using_as_output(&self, provider_type: &str, queue_id: usize) {
        self.events
            .lock()
            .expect("fence mutex")
            .push(format!("before_output:{}:{}", provider_type, queue_id));
    }

    fn after_used_as_input(&self, queue_id: usize) {
        self.events
            .lock()
            .expect("fence mutex")
            .push(format!("after_input:{}", queue_id));
    }

    fn after_used_as_output(&self, queue_id: usize) {
        self.events
            .lock()
            .expect("fence mutex")
            .push(format!("after_output:{}", queue_id));
    }
}

struct DevAbsKernel;

impl Kernel for DevAbsKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> DagResult<()> {
        let input = ctx.input(0)?;
        let out = match input {
            TensorValue::F32(t) => TensorValue::F32(
                Tensor::from_vec(
                    t.as_slice().iter().map(|v| v.abs()).collect(),
                    t.shape().to_vec(),
                )
                .expect("shape preserved"),
            ),
            other => {
                return Err(daginfer::Error::invalid_argument(format!(
                    "DevAbs expects f32, got {}",
                    other.dtype()
                )))
            }
        };
        ctx.set_output(0, out)
    }
}

/// A provider standing in for an asynchronous device: distinct allocator
/// identity, fence factory, and a copy counter.
pub struct TestDeviceProvider {
    allocator: Arc<PassThroughAllocator>,
    registry: Arc<KernelRegistry>,
    pub fence_events: Arc<Mutex<Vec<String>>>,
    pub copies: Arc<AtomicUsize>,
}

impl TestDeviceProvider {
    pub fn new() -> Self {
        let mut registry = KernelRegistry::new();
        registry.register(
            KernelDef::build("DevAbs")
                .provider("testdev")
                .queue(1)
                .type_constraint("T", &[DType::F32])
                .input_bindings(&["T"])
                .finish(),
            Box::new(|_node| Ok(Box::new(DevAbsKernel))),
        );
        Self {
            allocator: Arc::new(PassThroughAllocator {
                info: MemoryInfo::new("testdev", 0, MemKind::Default),
            }),
            registry: Arc::new(registry),
            fence_events: Arc::new(Mutex::new(Vec::new())),
            copies: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ExecutionProvider for TestDeviceProvider {
    fn provider_type(&self) -> &str {
        "testdev"
    }

    fn allocator(&self, _device_id: i32, _kind: MemKind) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn copy_tensor(&self, src: &TensorValue, dst: &mut TensorValue) -> DagResult<()> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let location = dst.location().clone();
        let mut copied = src.clone();
        copied.set_location(location);
        *dst = copied;
        Ok(())
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry> {
        self.registry.clone()
    }

    fn create_fence(&self) -> Option<Arc<dyn Fence>> {
        Some(Arc::new(RecordingFence {
            events: self.fence_events.clone(),
        }))
    }
}
