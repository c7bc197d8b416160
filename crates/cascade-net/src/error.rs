use cascade_pipeline::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("stage {0} disconnected")]
    Disconnected(u32),
}

/// Transport failures surface to the decode loop as protocol errors.
impl From<NetError> for PipelineError {
    fn from(e: NetError) -> Self {
        PipelineError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
