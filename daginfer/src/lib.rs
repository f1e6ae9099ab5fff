//! daginfer: a parallel dataflow executor and graph-rewrite engine for
//! neural-network inference graphs.
//!
//! A model is loaded (or built) as a [`Graph`], rewritten to a fixed
//! point by the registered transformers, planned into an immutable
//! [`SessionState`], and executed — sequentially or on a bounded worker
//! pool — against per-run value frames.

pub mod error;
pub mod executor;
pub mod graph;
pub mod kernels;
pub mod logging;
pub mod model;
pub mod profiler;
pub mod provider;
pub mod rewrite;
pub mod session;
pub mod tensor;

pub use error::{Error, Result};
pub use graph::{AttrLookup, AttrValue, Graph, Node, NodeIndex, ValueInfo};
pub use model::Model;
pub use provider::{Allocator, CpuExecutionProvider, ExecutionProvider, Fence};
pub use session::{IoBinding, RunOptions, Session, SessionOptions, SessionState};
pub use tensor::{DType, MemKind, MemoryInfo, Tensor, TensorElement, TensorValue, Value, F16};
