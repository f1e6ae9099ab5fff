use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Session-wide configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Worker threads for the parallel executor. `None` picks half the
    /// hardware concurrency, minimum one.
    pub intra_op_threads: Option<usize>,
    /// Run nodes concurrently; the sequential executor is the fallback.
    pub parallel_execution: bool,
    /// Fixed-point cap for the graph-rewrite manager.
    pub max_rewrite_steps: u32,
    /// Register the default rule-based rewrites (identity and slice
    /// elimination, constant folding) ahead of user transformers.
    pub enable_default_rewrites: bool,
    /// Collect profiler events.
    pub enable_profiling: bool,
    /// Filename prefix for the profiler output file.
    pub profile_file_prefix: String,
    /// Tag attached to session-level log lines.
    pub session_tag: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            intra_op_threads: None,
            parallel_execution: true,
            max_rewrite_steps: 5,
            enable_default_rewrites: true,
            enable_profiling: false,
            profile_file_prefix: "daginfer_profile".to_string(),
            session_tag: String::new(),
        }
    }
}

impl SessionOptions {
    pub fn thread_count(&self) -> usize {
        match self.intra_op_threads {
            Some(n) if n > 0 => n,
            _ => {
                let hw = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                (hw / 2).max(1)
            }
        }
    }
}

/// Per-run configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// String attached to profiler events for this run.
    pub run_tag: String,
    /// 0 disables the per-run logger; higher values increase detail.
    pub run_log_verbosity_level: u32,
    /// External cancellation flag, read before each node dispatch.
    pub terminate: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            run_tag: tag.into(),
            ..Self::default()
        }
    }
}
