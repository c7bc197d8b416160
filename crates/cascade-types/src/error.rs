// Shared error type for data-level failures (shapes, config, wire encoding).

#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape error: expected {expected:?}, got {got:?}")]
    Shape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    Dtype { expected: String, got: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CascadeError>;
