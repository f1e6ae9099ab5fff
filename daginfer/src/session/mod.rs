//! The session: load once, register providers and transformers, plan
//! once, then run concurrently against the immutable plan.

mod options;
mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::ThreadPoolBuilder;

pub use options::{RunOptions, SessionOptions};
pub use state::{NodeIo, SessionState, SlotId};

use crate::error::{Error, Result};
use crate::executor::{ExecutionFrame, ParallelExecutor, SequentialExecutor};
use crate::logging::RunLogger;
use crate::model::Model;
use crate::profiler::{event_args, EventCategory, Profiler};
use crate::provider::{CpuExecutionProvider, ExecutionProvider};
use crate::rewrite::{
    ConstantFolding, EliminateIdentity, EliminateSlice, GraphTransformer,
    GraphTransformerManager, RuleBasedTransformer,
};
use crate::tensor::{TensorValue, Value};

/// Caller-supplied input and output buffers for `run_with_binding`.
#[derive(Default)]
pub struct IoBinding {
    inputs: HashMap<String, Value>,
    outputs: Vec<(String, TensorValue)>,
}

impl IoBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_input(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.inputs.insert(name.into(), value.into());
    }

    /// Bind a pre-allocated output buffer; it is filled in place, with a
    /// cross-device copy when the producing provider lives elsewhere.
    pub fn bind_output(&mut self, name: impl Into<String>, tensor: TensorValue) {
        self.outputs.push((name.into(), tensor));
    }

    pub fn output(&self, name: &str) -> Option<&TensorValue> {
        self.outputs
            .iter()
            .find(|(bound, _)| bound == name)
            .map(|(_, tensor)| tensor)
    }
}

pub struct Session {
    options: SessionOptions,
    providers: Vec<Arc<dyn ExecutionProvider>>,
    transformers: Vec<Box<dyn GraphTransformer>>,
    model: Option<Model>,
    state: Option<Arc<SessionState>>,
    pool: Option<Arc<rayon::ThreadPool>>,
    profiler: Arc<Profiler>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let profiler = Arc::new(Profiler::new(
            options.enable_profiling,
            options.profile_file_prefix.clone(),
        ));
        Self {
            options,
            providers: Vec::new(),
            transformers: Vec::new(),
            model: None,
            state: None,
            pool: None,
            profiler,
        }
    }

    pub fn load_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.install_model(Model::load(path)?)
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.install_model(Model::from_bytes(bytes)?)
    }

    pub fn load_model(&mut self, model: Model) -> Result<()> {
        self.install_model(model)
    }

    fn install_model(&mut self, model: Model) -> Result<()> {
        if self.model.is_some() {
            return Err(Error::invalid_argument(
                "a model is already loaded on this session",
            ));
        }
        self.model = Some(model);
        Ok(())
    }

    /// Register a provider; order is assignment priority. Must precede
    /// `initialize`.
    pub fn register_provider(&mut self, provider: Arc<dyn ExecutionProvider>) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::invalid_argument(
                "providers must be registered before initialize",
            ));
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Append a graph transformer. Must precede `initialize`.
    pub fn register_transformer(&mut self, transformer: Box<dyn GraphTransformer>) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::invalid_argument(
                "transformers must be registered before initialize",
            ));
        }
        self.transformers.push(transformer);
        Ok(())
    }

    /// Rewrite to fixed point, plan, and recurse into subgraphs. The plan
    /// is immutable afterwards; runs may proceed concurrently.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::invalid_argument("session is already initialized"));
        }
        let model = self.model.as_ref().ok_or(Error::ModelNotLoaded)?;
        if self.providers.is_empty() {
            self.providers.push(Arc::new(CpuExecutionProvider::new()));
        }

        let init_start = self.profiler.start();
        let mut graph = model.graph().clone();
        graph.resolve()?;

        let mut manager = GraphTransformerManager::new(self.options.max_rewrite_steps);
        if self.options.enable_default_rewrites {
            let folding_provider = self
                .providers
                .iter()
                .find(|p| p.provider_type() == "cpu")
                .unwrap_or(&self.providers[0])
                .clone();
            let mut rules = RuleBasedTransformer::new("default-rules");
            rules.register_for("Identity", Box::new(EliminateIdentity));
            rules.register_for("Slice", Box::new(EliminateSlice));
            rules.register_any(Box::new(ConstantFolding::new(folding_provider)));
            manager.register(Box::new(rules));
        }
        for transformer in self.transformers.drain(..) {
            manager.register(transformer);
        }
        manager.apply_all(&mut graph)?;

        let state = SessionState::build(graph, self.providers.clone())?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.thread_count())
            .thread_name(|i| format!("daginfer-worker-{}", i))
            .build()
            .map_err(|err| Error::internal(format!("worker pool: {}", err)))?;
        self.state = Some(Arc::new(state));
        self.pool = Some(Arc::new(pool));

        self.profiler.record(
            EventCategory::Session,
            "session_initialize",
            init_start,
            event_args(&[("tag", &self.options.session_tag)]),
        );
        crate::trace!("session initialized ({} workers)", self.options.thread_count());
        Ok(())
    }

    /// Execute the graph for one set of feeds and return the requested
    /// outputs in order. Concurrent calls share the plan and the pool.
    pub fn run(
        &self,
        run_options: &RunOptions,
        feeds: HashMap<String, Value>,
        output_names: &[String],
    ) -> Result<Vec<Value>> {
        let frame = self.run_to_frame(run_options, feeds, output_names)?;
        output_names.iter().map(|name| frame.fetch(name)).collect()
    }

    /// Variant that fills caller-supplied buffers in place.
    pub fn run_with_binding(
        &self,
        run_options: &RunOptions,
        binding: &mut IoBinding,
    ) -> Result<()> {
        let state = self.state()?;
        let feeds = binding.inputs.clone();
        let output_names: Vec<String> =
            binding.outputs.iter().map(|(name, _)| name.clone()).collect();
        let frame = self.run_to_frame(run_options, feeds, &output_names)?;
        for (name, dst) in binding.outputs.iter_mut() {
            let value = frame.fetch(name)?;
            let src = value.as_tensor()?;
            let provider = state
                .provider_by_type(&src.location().provider)
                .or_else(|| state.provider_by_type(&dst.location().provider))
                .ok_or_else(|| {
                    Error::internal(format!(
                        "no provider can copy output '{}' to its bound buffer",
                        name
                    ))
                })?;
            provider.copy_tensor(src, dst)?;
        }
        Ok(())
    }

    fn run_to_frame(
        &self,
        run_options: &RunOptions,
        feeds: HashMap<String, Value>,
        output_names: &[String],
    ) -> Result<Arc<ExecutionFrame>> {
        let state = self.state()?;
        let logger = if run_options.run_log_verbosity_level > 0 {
            RunLogger::new(run_options.run_log_verbosity_level, run_options.run_tag.clone())
        } else {
            RunLogger::disabled()
        };
        let profiler = self.profiler.enabled().then(|| self.profiler.clone());
        let run_start = self.profiler.start();

        for provider in state.providers() {
            provider.on_run_start()?;
        }
        // The end-of-run hooks fire on every exit path before an error
        // propagates to the caller.
        let outcome = (|| -> Result<Arc<ExecutionFrame>> {
            let frame = Arc::new(ExecutionFrame::new(state.clone(), feeds, output_names)?);
            if self.options.parallel_execution {
                let pool = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| Error::internal("worker pool missing after initialize"))?;
                ParallelExecutor::new(pool.clone()).execute(
                    state,
                    &frame,
                    run_options.terminate.clone(),
                    &logger,
                    profiler,
                    &run_options.run_tag,
                )?;
            } else {
                SequentialExecutor::new().execute(
                    state,
                    &frame,
                    run_options.terminate.as_deref(),
                    &logger,
                    profiler.as_deref(),
                    &run_options.run_tag,
                )?;
            }
            Ok(frame)
        })();

        for provider in state.providers() {
            provider.on_run_end()?;
        }
        self.profiler.record(
            EventCategory::Session,
            "session_run",
            run_start,
            event_args(&[("run_tag", &run_options.run_tag)]),
        );
        let frame = outcome?;
        logger.info(format_args!("run complete"));
        Ok(frame)
    }

    fn state(&self) -> Result<&Arc<SessionState>> {
        if self.model.is_none() {
            return Err(Error::ModelNotLoaded);
        }
        self.state.as_ref().ok_or(Error::NotInitialized)
    }

    pub fn session_state(&self) -> Result<&Arc<SessionState>> {
        self.state()
    }

    /// Write the profiler file and return its path.
    pub fn end_profiling(&self) -> Result<PathBuf> {
        self.profiler.flush()
    }
}
