// Frames exchanged between stages.
//
// Every link operation moves exactly one `StageFrame`. The `kind` lets the
// receiver detect a stage that issued its communication calls out of order,
// which would otherwise surface as a silent shape reinterpretation.

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::tensor::{Tensor, TensorDtype};

// ── Payload ──────────────────────────────────────────────────────────────────

/// A dtype-tagged tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    F32(Tensor<f32>),
    I64(Tensor<i64>),
    U8(Tensor<u8>),
}

impl Payload {
    pub fn dtype(&self) -> TensorDtype {
        match self {
            Self::F32(_) => TensorDtype::F32,
            Self::I64(_) => TensorDtype::I64,
            Self::U8(_) => TensorDtype::U8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(t) => t.shape(),
            Self::I64(t) => t.shape(),
            Self::U8(t) => t.shape(),
        }
    }

    /// Payload size in bytes, excluding framing.
    pub fn data_bytes(&self) -> usize {
        self.shape().iter().product::<usize>() * self.dtype().element_bytes()
    }

    /// Return an error unless this payload has exactly `shape` and `dtype`.
    pub fn check(&self, shape: &[usize], dtype: TensorDtype) -> Result<()> {
        if self.dtype() != dtype {
            return Err(CascadeError::Dtype {
                expected: dtype.name().into(),
                got: self.dtype().name().into(),
            });
        }
        if self.shape() != shape {
            return Err(CascadeError::Shape {
                expected: shape.to_vec(),
                got: self.shape().to_vec(),
            });
        }
        Ok(())
    }

    pub fn into_f32(self) -> Result<Tensor<f32>> {
        match self {
            Self::F32(t) => Ok(t),
            other => Err(dtype_error(TensorDtype::F32, other.dtype())),
        }
    }

    pub fn into_i64(self) -> Result<Tensor<i64>> {
        match self {
            Self::I64(t) => Ok(t),
            other => Err(dtype_error(TensorDtype::I64, other.dtype())),
        }
    }

    pub fn into_u8(self) -> Result<Tensor<u8>> {
        match self {
            Self::U8(t) => Ok(t),
            other => Err(dtype_error(TensorDtype::U8, other.dtype())),
        }
    }
}

fn dtype_error(expected: TensorDtype, got: TensorDtype) -> CascadeError {
    CascadeError::Dtype {
        expected: expected.name().into(),
        got: got.name().into(),
    }
}

impl From<Tensor<f32>> for Payload {
    fn from(t: Tensor<f32>) -> Self {
        Self::F32(t)
    }
}

impl From<Tensor<i64>> for Payload {
    fn from(t: Tensor<i64>) -> Self {
        Self::I64(t)
    }
}

impl From<Tensor<u8>> for Payload {
    fn from(t: Tensor<u8>) -> Self {
        Self::U8(t)
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// One activation tensor to the next stage.
    Activation,
    /// Activation plus its exit-signal tensor, kept paired.
    ActivationList,
    /// Replicated value from a designated stage.
    Broadcast,
    /// Sampled token and log-probability sent straight to the first stage by
    /// whichever stage answered this step.
    ExitResult,
    /// Connection handshake carrying the sender's rank.
    Hello,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFrame {
    pub kind: FrameKind,
    pub from_stage: u32,
    pub payloads: Vec<Payload>,
}

impl StageFrame {
    pub fn new(kind: FrameKind, from_stage: u32, payloads: Vec<Payload>) -> Self {
        Self {
            kind,
            from_stage,
            payloads,
        }
    }

    pub fn data_bytes(&self) -> usize {
        self.payloads.iter().map(Payload::data_bytes).sum()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_detects_dtype_and_shape() {
        let p = Payload::from(Tensor::<u8>::scalar(1));
        assert!(p.check(&[1], TensorDtype::U8).is_ok());
        assert!(p.check(&[1], TensorDtype::I64).is_err());
        assert!(p.check(&[2], TensorDtype::U8).is_err());
    }

    #[test]
    fn into_wrong_dtype_fails() {
        let p = Payload::from(Tensor::<f32>::zeros(&[2]));
        assert!(p.clone().into_i64().is_err());
        assert_eq!(p.into_f32().unwrap().numel(), 2);
    }

    #[test]
    fn data_bytes() {
        let frame = StageFrame::new(
            FrameKind::ActivationList,
            1,
            vec![
                Tensor::<f32>::zeros(&[4, 1, 8]).into(),
                Tensor::<u8>::scalar(0).into(),
            ],
        );
        assert_eq!(frame.data_bytes(), 4 * 8 * 4 + 1);
    }

    #[test]
    fn frame_serde() {
        let frame = StageFrame::new(
            FrameKind::Broadcast,
            2,
            vec![Tensor::<i64>::scalar(7).into()],
        );
        let json = serde_json::to_string(&frame).unwrap();
        let round: StageFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(round.kind, FrameKind::Broadcast);
        assert_eq!(round.payloads[0].shape(), &[1]);
    }
}
