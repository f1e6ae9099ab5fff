//! Executors: the sequential reference walk and the parallel
//! fire-on-ready scheduler, sharing one per-node dispatch path.

mod frame;
mod parallel;
mod sequential;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use frame::ExecutionFrame;
pub use parallel::ParallelExecutor;
pub use sequential::SequentialExecutor;

use crate::error::{Error, Result};
use crate::graph::NodeIndex;
use crate::kernels::KernelContext;
use crate::logging::RunLogger;
use crate::profiler::{event_args, EventCategory, Profiler};
use crate::session::SessionState;
use crate::tensor::Value;

/// Fence calls, kernel dispatch, and profiler events for one node.
///
/// Kernel panics are captured and surfaced as `Internal` so a failing
/// kernel cannot take down the worker pool.
pub(crate) fn run_single_node(
    state: &SessionState,
    frame: &ExecutionFrame,
    index: NodeIndex,
    terminate: Option<&AtomicBool>,
    logger: &RunLogger,
    profiler: Option<&Profiler>,
    run_tag: &str,
) -> Result<()> {
    let node = state.node(index)?;
    let io = state.node_io(index)?;
    let provider_type = state.provider_of_node(index)?.provider_type().to_string();
    let queue_id = state.queue_of_node(index);

    logger.detail(format_args!(
        "node {} '{}' ({}) on {}",
        index, node.name, node.op_type, provider_type
    ));

    let sync_start = profiler.map(|p| p.start());
    for &slot in io.inputs.iter().flatten().chain(io.implicit.iter()) {
        if let Some(fence) = frame.fence(slot) {
            fence.before_using_as_input(&provider_type, queue_id);
        }
    }
    for &slot in &io.outputs {
        if let Some(fence) = frame.fence(slot) {
            fence.before_using_as_output(&provider_type, queue_id);
        }
    }
    if let (Some(profiler), Some(start)) = (profiler, sync_start) {
        profiler.record(
            EventCategory::Node,
            format!("{}_fence_before", node.name),
            start,
            event_args(&[("op_name", &node.op_type), ("run_tag", run_tag)]),
        );
    }

    let kernel_start = profiler.map(|p| p.start());
    let kernel = state.kernel(index)?;
    let mut ctx = KernelContext::new(state, frame, index, node, terminate, logger);
    let outcome = catch_unwind(AssertUnwindSafe(|| kernel.compute(&mut ctx)));
    let result = match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| payload.downcast_ref::<&str>().copied())
                .unwrap_or("kernel panicked");
            Err(Error::internal(message))
        }
    };
    result.map_err(|err| match err {
        Error::Cancelled => Error::Cancelled,
        other => Error::kernel_failed(node.name.clone(), other.to_string()),
    })?;
    if let (Some(profiler), Some(start)) = (profiler, kernel_start) {
        profiler.record(
            EventCategory::Node,
            format!("{}_kernel_time", node.name),
            start,
            event_args(&[("op_name", &node.op_type), ("run_tag", run_tag)]),
        );
    }

    let sync_start = profiler.map(|p| p.start());
    for &slot in io.inputs.iter().flatten().chain(io.implicit.iter()) {
        if let Some(fence) = frame.fence(slot) {
            fence.after_used_as_input(queue_id);
        }
    }
    for &slot in &io.outputs {
        if let Some(fence) = frame.fence(slot) {
            fence.after_used_as_output(queue_id);
        }
    }
    if let (Some(profiler), Some(start)) = (profiler, sync_start) {
        profiler.record(
            EventCategory::Node,
            format!("{}_fence_after", node.name),
            start,
            event_args(&[("op_name", &node.op_type), ("run_tag", run_tag)]),
        );
    }
    Ok(())
}

/// Run a subgraph to completion on the current thread. Used by
/// control-flow kernels; outer-scope values are installed by name.
pub(crate) fn run_nested(
    state: &Arc<SessionState>,
    outer: Vec<(String, Value)>,
    terminate: Option<&AtomicBool>,
    logger: &RunLogger,
) -> Result<Vec<Value>> {
    let frame = ExecutionFrame::nested(state.clone(), outer)?;
    SequentialExecutor::new().execute(state, &frame, terminate, logger, None, "")?;
    let mut outputs = Vec::with_capacity(state.graph().outputs().len());
    for name in state.graph().outputs() {
        outputs.push(frame.fetch(name)?);
    }
    Ok(outputs)
}
