//! `cascade-net` — stage-to-stage transport across processes.
//!
//! [`TcpLink`] implements [`cascade_pipeline::PipelineLink`] over a full
//! mesh of TCP connections, one per pair of stages, framed by [`codec`].

pub mod codec;
pub mod error;
pub mod tcp;

pub use codec::{read_frame, write_frame};
pub use error::{NetError, Result};
pub use tcp::TcpLink;
