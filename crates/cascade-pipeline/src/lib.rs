//! `cascade-pipeline` — decode-time orchestration for pipeline-parallel
//! autoregressive generation.
//!
//! This crate drives the decode loop, not the math. A [`Model`] owns the
//! layers of one stage and runs its forward pass; this crate decides what
//! window to feed it, moves activations and results between stages over a
//! [`PipelineLink`], samples the next token and decides when to stop.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ activations ┌─────────────┐ activations ┌─────────────┐
//! │   Stage 0   │────────────▶│   Stage 1   │────────────▶│   Stage 2   │
//! │ layers 0-10 │             │ layers 11-21│             │ layers 22-31│
//! └─────────────┘             └─────────────┘             └─────────────┘
//!   tokens in   ◀──────────── new tokens, lengths ─────────  logits out
//! ```
//!
//! Every stage runs the same [`GenerationController`] (or
//! [`BeamSearchDecoder`]) over the same batch; the collectives on the link
//! keep them in step.

pub mod beam;
pub mod decode_state;
pub mod dispatcher;
pub mod error;
pub mod generation;
pub mod link;
pub mod model;
pub mod planner;
pub mod request;
pub mod sampling;
pub mod scheduler;

#[cfg(test)]
mod test_support;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use beam::{BeamHypotheses, BeamHypothesis, BeamSearchDecoder};
pub use decode_state::{DecodeState, LayerCache};
pub use dispatcher::{DispatchMode, ForwardStepDispatcher, StepInput, StepOutput};
pub use error::{PipelineError, Result};
pub use generation::{GenerationController, GenerationOutput};
pub use link::{local_pipeline, LocalLink, PipelineLink};
pub use model::{CausalMaskBuilder, MaskBuilder, Model, ModelInput, ModelOutput, Tokenizer};
pub use planner::plan_stages;
pub use request::{Batch, BufferedRequests, GeneratedSequence, Request};
pub use sampling::Sampler;
pub use scheduler::{MicroBatch, MicroBatchSchedule};
