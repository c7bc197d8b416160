use cascade_types::CascadeError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Rejected before any forward step runs.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("token budget exceeded: {requested} tokens requested, budget is {budget}")]
    ResourceLimit { requested: usize, budget: usize },

    /// Stages disagree about what is being exchanged. Fatal to the call.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Decode state bookkeeping went out of alignment. Fatal to the call.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Types(#[from] CascadeError),
}

impl PipelineError {
    /// Wrap a data-level error raised while validating an exchanged payload.
    pub(crate) fn protocol(e: CascadeError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
