use thiserror::Error;

/// Failure kinds surfaced by the session API.
///
/// Every public entry point returns one of these; kernels and rewrites
/// propagate them with `?` and the executors record the first one observed
/// in a run.
#[derive(Debug, Error)]
pub enum Error {
    /// Graph resolution or type inference failed, or a node has no
    /// matching kernel.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A feed name is unknown, a feed mismatches the declared graph input,
    /// or an output name is unknown.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `initialize` or `run` was called before a model was loaded.
    #[error("no model loaded")]
    ModelNotLoaded,

    /// `run` was called before `initialize`.
    #[error("session not initialized")]
    NotInitialized,

    /// The terminate flag was observed before the run completed.
    #[error("run cancelled")]
    Cancelled,

    /// A kernel's compute returned an error.
    #[error("kernel failed for node '{node}': {message}")]
    KernelFailed { node: String, message: String },

    /// An allocator could not satisfy a request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Error::InvalidModel(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn kernel_failed(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::KernelFailed {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// True when the error is the cooperative-cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
