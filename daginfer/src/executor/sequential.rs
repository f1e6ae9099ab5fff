//! Reference executor: a topological walk on the calling thread.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::logging::RunLogger;
use crate::profiler::Profiler;
use crate::session::SessionState;

use super::{run_single_node, ExecutionFrame};

#[derive(Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Walk the plan's topological order, skipping nodes outside the
    /// requested sub-DAG. Cancellation is polled before each node and the
    /// first error surfaces immediately.
    pub fn execute(
        &self,
        state: &SessionState,
        frame: &ExecutionFrame,
        terminate: Option<&AtomicBool>,
        logger: &RunLogger,
        profiler: Option<&Profiler>,
        run_tag: &str,
    ) -> Result<()> {
        for &index in state.topo() {
            if !frame.is_reachable(index) {
                continue;
            }
            if let Some(flag) = terminate {
                if flag.load(Ordering::Relaxed) {
                    logger.info(format_args!("terminate flag observed, aborting run"));
                    return Err(Error::Cancelled);
                }
            }
            run_single_node(state, frame, index, terminate, logger, profiler, run_tag)?;
        }
        Ok(())
    }
}
