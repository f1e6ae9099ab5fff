//! Fire-on-ready scheduler over a bounded worker pool.
//!
//! Per-node in-degree counters are decremented as predecessors finish;
//! the first successor a worker drives to zero is tail-chained on the
//! current thread and the rest are enqueued. `outstanding` tracks
//! enqueued-or-running chains and the caller blocks on a condition
//! variable until it drains to zero, on every path: success, kernel
//! failure, or cancellation.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use rayon::ThreadPool;

use crate::error::{Error, Result};
use crate::graph::NodeIndex;
use crate::logging::RunLogger;
use crate::profiler::Profiler;
use crate::session::SessionState;

use super::{run_single_node, ExecutionFrame};

struct RunStatus {
    outstanding: i64,
    error: Option<Error>,
}

struct ParallelRun {
    state: Arc<SessionState>,
    frame: Arc<ExecutionFrame>,
    pool: Arc<ThreadPool>,
    pending: Vec<AtomicI32>,
    /// Guards the successor-release section.
    ref_mutex: Mutex<()>,
    completion: Mutex<RunStatus>,
    completed: Condvar,
    /// Set once any error is recorded so later nodes skip their kernels
    /// and only drain the counters.
    failed: AtomicBool,
    terminate: Option<Arc<AtomicBool>>,
    logger: RunLogger,
    profiler: Option<Arc<Profiler>>,
    run_tag: String,
}

impl ParallelRun {
    fn record_error(&self, error: Error) {
        self.failed.store(true, Ordering::Release);
        if let Ok(mut status) = self.completion.lock() {
            // First recorded error wins; later ones are discarded.
            if status.error.is_none() {
                status.error = Some(error);
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.terminate
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

}

fn enqueue(run: &Arc<ParallelRun>, index: NodeIndex) -> Result<()> {
    {
        let mut status = run
            .completion
            .lock()
            .map_err(|_| Error::internal("completion mutex poisoned"))?;
        status.outstanding += 1;
    }
    let worker = run.clone();
    run.pool.spawn(move || run_node(&worker, index));
    Ok(())
}

/// Worker body. Tail-chains the first ready successor to avoid a pool
/// round-trip per node.
fn run_node(run: &Arc<ParallelRun>, start: NodeIndex) {
    let mut index = start;
    loop {
        if run.cancelled() {
            run.record_error(Error::Cancelled);
        } else if !run.failed.load(Ordering::Acquire) {
            let result = run_single_node(
                &run.state,
                &run.frame,
                index,
                run.terminate.as_deref(),
                &run.logger,
                run.profiler.as_deref(),
                &run.run_tag,
            );
            if let Err(error) = result {
                run.record_error(error);
            }
        }

        // Successor release: decrements and the ready handoff happen
        // under one mutex so each counter reaches zero exactly once.
        let mut next = None;
        {
            let _guard = run
                .ref_mutex
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for &succ in run.state.successors(index) {
                if !run.frame.is_reachable(succ) {
                    continue;
                }
                if run.pending[succ].fetch_sub(1, Ordering::AcqRel) == 1 {
                    if next.is_none() {
                        next = Some(succ);
                    } else if let Err(error) = enqueue(run, succ) {
                        run.record_error(error);
                    }
                }
            }
        }

        match next {
            Some(succ) => index = succ,
            None => break,
        }
    }

    if let Ok(mut status) = run.completion.lock() {
        status.outstanding -= 1;
        if status.outstanding == 0 {
            run.completed.notify_all();
        }
    }
}

pub struct ParallelExecutor {
    pool: Arc<ThreadPool>,
}

impl ParallelExecutor {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    /// Seed the roots of the requested sub-DAG, then block until
    /// `outstanding` drains to zero. Returns the first recorded error.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        state: &Arc<SessionState>,
        frame: &Arc<ExecutionFrame>,
        terminate: Option<Arc<AtomicBool>>,
        logger: &RunLogger,
        profiler: Option<Arc<Profiler>>,
        run_tag: &str,
    ) -> Result<()> {
        let pending: Vec<AtomicI32> = state
            .in_degree()
            .iter()
            .map(|&d| AtomicI32::new(d))
            .collect();
        let run = Arc::new(ParallelRun {
            state: state.clone(),
            frame: frame.clone(),
            pool: self.pool.clone(),
            pending,
            ref_mutex: Mutex::new(()),
            completion: Mutex::new(RunStatus {
                outstanding: 0,
                error: None,
            }),
            completed: Condvar::new(),
            failed: AtomicBool::new(false),
            terminate,
            logger: logger.clone(),
            profiler,
            run_tag: run_tag.to_string(),
        });

        for &index in state.topo() {
            if frame.is_reachable(index) && state.in_degree()[index] == 0 {
                enqueue(&run, index)?;
            }
        }

        let mut status = run
            .completion
            .lock()
            .map_err(|_| Error::internal("completion mutex poisoned"))?;
        while status.outstanding > 0 {
            status = run
                .completed
                .wait(status)
                .map_err(|_| Error::internal("completion mutex poisoned"))?;
        }
        match status.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
