//! Stage-to-stage communication.
//!
//! [`PipelineLink`] splits into four transport primitives (send a frame to a
//! rank, receive the next frame from a rank, and the any-source result queue
//! into the first stage) and the protocol operations built on top of them.
//! Every protocol operation blocks, and every stage must issue them in the
//! same order each step.
//!
//! [`LocalLink`] wires stages running as threads of one process together
//! with tokio mpsc channels, one per ordered pair of stages.

use cascade_types::{FrameKind, Payload, PipelineStage, StageFrame, Tensor, TensorDtype};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{PipelineError, Result};

// ── Trait ────────────────────────────────────────────────────────────────────

pub trait PipelineLink {
    fn stage(&self) -> &PipelineStage;

    /// Deliver `frame` to stage `to`. Must not block on the receiver.
    fn send_frame(&mut self, to: u32, frame: StageFrame) -> Result<()>;

    /// Next frame sent by stage `from`, in send order.
    fn recv_frame(&mut self, from: u32) -> Result<StageFrame>;

    /// Deliver `frame` to the first stage's result queue.
    fn send_result_frame(&mut self, frame: StageFrame) -> Result<()>;

    /// Next frame from the result queue. First stage only.
    fn recv_result_frame(&mut self) -> Result<StageFrame>;

    // ── Point-to-point ───────────────────────────────────────────────────

    /// Send one activation to the next stage. No-op on the last stage.
    fn send_to_next(&mut self, activation: Tensor<f32>) -> Result<()> {
        let Some(next) = self.stage().next_rank() else {
            return Ok(());
        };
        let frame = StageFrame::new(FrameKind::Activation, self.stage().rank, vec![activation.into()]);
        self.send_frame(next, frame)
    }

    /// Fill `buffer` with the previous stage's activation. The incoming
    /// shape must equal the buffer's. No-op on the first stage.
    fn recv_from_prev(&mut self, buffer: &mut Tensor<f32>) -> Result<()> {
        let Some(prev) = self.stage().prev_rank() else {
            return Ok(());
        };
        let mut payloads = expect_frame(self.recv_frame(prev)?, FrameKind::Activation, 1)?;
        let payload = payloads.remove(0);
        payload
            .check(buffer.shape(), TensorDtype::F32)
            .map_err(PipelineError::protocol)?;
        *buffer = payload.into_f32().map_err(PipelineError::protocol)?;
        Ok(())
    }

    /// Send an ordered list of tensors to the next stage as one frame.
    fn send_list_to_next(&mut self, tensors: Vec<Payload>) -> Result<()> {
        let Some(next) = self.stage().next_rank() else {
            return Ok(());
        };
        let frame = StageFrame::new(FrameKind::ActivationList, self.stage().rank, tensors);
        self.send_frame(next, frame)
    }

    /// Replace each of `buffers` with the matching received tensor. Count,
    /// dtype and shape must all agree.
    fn recv_list_from_prev(&mut self, buffers: &mut [Payload]) -> Result<()> {
        let Some(prev) = self.stage().prev_rank() else {
            return Ok(());
        };
        let payloads = expect_frame(self.recv_frame(prev)?, FrameKind::ActivationList, buffers.len())?;
        for (buffer, payload) in buffers.iter_mut().zip(payloads) {
            payload
                .check(buffer.shape(), buffer.dtype())
                .map_err(PipelineError::protocol)?;
            *buffer = payload;
        }
        Ok(())
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Replicate the last stage's `value` onto the first stage.
    ///
    /// Returns the value on the first and last stages, `None` on the stages
    /// in between. Only the last stage supplies a value.
    fn broadcast_from_last_to_first(
        &mut self,
        shape: &[usize],
        dtype: TensorDtype,
        value: Option<Payload>,
    ) -> Result<Option<Payload>> {
        let stage = self.stage().clone();
        if stage.is_last() {
            let value = require_value(value, shape, dtype, stage.rank)?;
            if !stage.is_first() {
                let frame = StageFrame::new(FrameKind::Broadcast, stage.rank, vec![value.clone()]);
                self.send_frame(0, frame)?;
            }
            return Ok(Some(value));
        }
        if stage.is_first() {
            return self.recv_broadcast(stage.last_rank(), shape, dtype).map(Some);
        }
        Ok(None)
    }

    /// Replicate the last stage's `value` onto every stage.
    fn broadcast_from_last(
        &mut self,
        shape: &[usize],
        dtype: TensorDtype,
        value: Option<Payload>,
    ) -> Result<Payload> {
        let source = self.stage().last_rank();
        self.broadcast_from(source, shape, dtype, value)
    }

    /// Replicate the first stage's `value` onto every stage.
    fn broadcast_from_first(
        &mut self,
        shape: &[usize],
        dtype: TensorDtype,
        value: Option<Payload>,
    ) -> Result<Payload> {
        self.broadcast_from(0, shape, dtype, value)
    }

    #[doc(hidden)]
    fn broadcast_from(
        &mut self,
        source: u32,
        shape: &[usize],
        dtype: TensorDtype,
        value: Option<Payload>,
    ) -> Result<Payload> {
        let stage = self.stage().clone();
        if stage.rank == source {
            let value = require_value(value, shape, dtype, stage.rank)?;
            for to in (0..stage.num_stages).filter(|&r| r != source) {
                let frame = StageFrame::new(FrameKind::Broadcast, stage.rank, vec![value.clone()]);
                self.send_frame(to, frame)?;
            }
            return Ok(value);
        }
        self.recv_broadcast(source, shape, dtype)
    }

    #[doc(hidden)]
    fn recv_broadcast(&mut self, from: u32, shape: &[usize], dtype: TensorDtype) -> Result<Payload> {
        let mut payloads = expect_frame(self.recv_frame(from)?, FrameKind::Broadcast, 1)?;
        let payload = payloads.remove(0);
        payload.check(shape, dtype).map_err(PipelineError::protocol)?;
        Ok(payload)
    }

    // ── Result to first ──────────────────────────────────────────────────

    /// Deliver one step's answer to the first stage from whichever stage
    /// produced it.
    fn send_result_to_first(&mut self, payloads: Vec<Payload>) -> Result<()> {
        let frame = StageFrame::new(FrameKind::ExitResult, self.stage().rank, payloads);
        self.send_result_frame(frame)
    }

    /// Block until some stage delivers this step's answer. First stage only.
    fn recv_result_on_first(&mut self) -> Result<Vec<Payload>> {
        if !self.stage().is_first() {
            return Err(PipelineError::Protocol(format!(
                "stage {} cannot receive results, only the first stage can",
                self.stage().rank
            )));
        }
        let frame = self.recv_result_frame()?;
        trace!(from = frame.from_stage, "received step result");
        if frame.kind != FrameKind::ExitResult {
            return Err(PipelineError::Protocol(format!(
                "expected an exit result, got {:?}",
                frame.kind
            )));
        }
        Ok(frame.payloads)
    }
}

fn require_value(
    value: Option<Payload>,
    shape: &[usize],
    dtype: TensorDtype,
    rank: u32,
) -> Result<Payload> {
    let value = value.ok_or_else(|| {
        PipelineError::Protocol(format!("stage {rank} is the broadcast source but has no value"))
    })?;
    value.check(shape, dtype).map_err(PipelineError::protocol)?;
    Ok(value)
}

fn expect_frame(frame: StageFrame, kind: FrameKind, count: usize) -> Result<Vec<Payload>> {
    if frame.kind != kind {
        return Err(PipelineError::Protocol(format!(
            "expected {kind:?} from stage {}, got {:?}",
            frame.from_stage, frame.kind
        )));
    }
    if frame.payloads.len() != count {
        return Err(PipelineError::Protocol(format!(
            "expected {count} tensors from stage {}, got {}",
            frame.from_stage,
            frame.payloads.len()
        )));
    }
    Ok(frame.payloads)
}

impl<L: PipelineLink + ?Sized> PipelineLink for Box<L> {
    fn stage(&self) -> &PipelineStage {
        (**self).stage()
    }

    fn send_frame(&mut self, to: u32, frame: StageFrame) -> Result<()> {
        (**self).send_frame(to, frame)
    }

    fn recv_frame(&mut self, from: u32) -> Result<StageFrame> {
        (**self).recv_frame(from)
    }

    fn send_result_frame(&mut self, frame: StageFrame) -> Result<()> {
        (**self).send_result_frame(frame)
    }

    fn recv_result_frame(&mut self) -> Result<StageFrame> {
        (**self).recv_result_frame()
    }
}

// ── Local Link ───────────────────────────────────────────────────────────────

/// In-process link for stages running on separate threads.
///
/// Receives use `blocking_recv` and must not run inside an async runtime.
pub struct LocalLink {
    stage: PipelineStage,
    /// Indexed by destination rank.
    outgoing: Vec<Option<mpsc::UnboundedSender<StageFrame>>>,
    /// Indexed by source rank.
    incoming: Vec<Option<mpsc::UnboundedReceiver<StageFrame>>>,
    results_tx: mpsc::UnboundedSender<StageFrame>,
    results_rx: Option<mpsc::UnboundedReceiver<StageFrame>>,
}

/// Connect `stages` (ordered by rank) into a full mesh of local links.
pub fn local_pipeline(stages: &[PipelineStage]) -> Vec<LocalLink> {
    let n = stages.len();
    let mut outgoing: Vec<Vec<Option<mpsc::UnboundedSender<StageFrame>>>> =
        (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
    let mut incoming: Vec<Vec<Option<mpsc::UnboundedReceiver<StageFrame>>>> =
        (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

    for src in 0..n {
        for dst in (0..n).filter(|&d| d != src) {
            let (tx, rx) = mpsc::unbounded_channel();
            outgoing[src][dst] = Some(tx);
            incoming[dst][src] = Some(rx);
        }
    }

    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let mut results_rx = Some(results_rx);

    stages
        .iter()
        .zip(outgoing.into_iter().zip(incoming))
        .map(|(stage, (outgoing, incoming))| LocalLink {
            stage: stage.clone(),
            outgoing,
            incoming,
            results_tx: results_tx.clone(),
            results_rx: if stage.is_first() { results_rx.take() } else { None },
        })
        .collect()
}

impl PipelineLink for LocalLink {
    fn stage(&self) -> &PipelineStage {
        &self.stage
    }

    fn send_frame(&mut self, to: u32, frame: StageFrame) -> Result<()> {
        let tx = self
            .outgoing
            .get(to as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| PipelineError::Protocol(format!("no channel to stage {to}")))?;
        tx.send(frame).map_err(|_| {
            warn!(from = self.stage.rank, to, "peer stage hung up");
            PipelineError::Protocol(format!("stage {to} hung up"))
        })
    }

    fn recv_frame(&mut self, from: u32) -> Result<StageFrame> {
        let rank = self.stage.rank;
        let rx = self
            .incoming
            .get_mut(from as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| PipelineError::Protocol(format!("no channel from stage {from}")))?;
        rx.blocking_recv().ok_or_else(|| {
            warn!(stage = rank, from, "peer stage hung up");
            PipelineError::Protocol(format!("stage {from} hung up"))
        })
    }

    fn send_result_frame(&mut self, frame: StageFrame) -> Result<()> {
        self.results_tx
            .send(frame)
            .map_err(|_| PipelineError::Protocol("first stage hung up".into()))
    }

    fn recv_result_frame(&mut self) -> Result<StageFrame> {
        let rx = self.results_rx.as_mut().ok_or_else(|| {
            PipelineError::Protocol(format!("stage {} has no result queue", self.stage.rank))
        })?;
        rx.blocking_recv()
            .ok_or_else(|| PipelineError::Protocol("result queue closed".into()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
