pub mod config;
pub mod error;
pub mod message;
pub mod stage;
pub mod tensor;

pub use error::CascadeError;
pub use message::{FrameKind, Payload, StageFrame};
pub use stage::{LayerRange, PipelineStage, StageRole};
pub use tensor::{Element, Tensor, TensorDtype};

/// Vocabulary index of a token.
pub type TokenId = i64;

/// Stable caller-assigned identity of one request in a batch.
pub type RequestId = u64;
