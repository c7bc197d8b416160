//! One forward evaluation of a stage's model.
//!
//! The dispatcher owns the receive buffer and the stage-to-stage traffic of
//! a forward step. It knows nothing about sampling or stopping: it hands
//! logits back to whichever stage holds the answer for the step and `None`
//! to every other stage.

use cascade_types::config::PipelineConfig;
use cascade_types::{Payload, PipelineStage, RequestId, Tensor, TokenId};
use tracing::{debug, trace};

use crate::decode_state::DecodeState;
use crate::error::{PipelineError, Result};
use crate::link::PipelineLink;
use crate::model::{Model, ModelInput};
use crate::scheduler::MicroBatchSchedule;

/// How forward steps move through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One stage holds the whole model.
    NonPipelined,
    /// The batch is forwarded in row chunks, activations only.
    MicroBatched,
    /// Batch of one; each hop carries the activation and an exit signal.
    EarlyExit,
}

impl DispatchMode {
    pub fn select(stage: &PipelineStage, use_early_exit: bool) -> Self {
        match (stage.is_pipelined(), use_early_exit) {
            (false, _) => Self::NonPipelined,
            (true, false) => Self::MicroBatched,
            (true, true) => Self::EarlyExit,
        }
    }
}

/// The token window forwarded in one step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// `[batch, window]`
    pub tokens: &'a Tensor<TokenId>,
    /// `[batch, window]`
    pub positions: &'a Tensor<i64>,
    pub attention_mask: &'a Tensor<u8>,
    pub request_ids: &'a [RequestId],
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[batch, window, vocab]` on the stage that answers this step.
    pub logits: Option<Tensor<f32>>,
    /// Rows of `logits`, when the model answered only some requests.
    pub exited_request_ids: Option<Vec<RequestId>>,
    /// The dispatcher already advanced `sequence_len_offset`.
    pub offset_advanced: bool,
}

pub struct ForwardStepDispatcher {
    stage: PipelineStage,
    mode: DispatchMode,
    config: PipelineConfig,
    recv_buffer: Option<Tensor<f32>>,
    steps: u64,
}

impl ForwardStepDispatcher {
    pub fn new(stage: PipelineStage, config: PipelineConfig, use_early_exit: bool) -> Self {
        let mode = DispatchMode::select(&stage, use_early_exit);
        Self {
            stage,
            mode,
            config,
            recv_buffer: None,
            steps: 0,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn stage(&self) -> &PipelineStage {
        &self.stage
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Reject a batch this mode cannot run.
    pub fn check_batch(&self, batch_size: usize) -> Result<()> {
        if self.mode == DispatchMode::EarlyExit && batch_size != 1 {
            return Err(PipelineError::Precondition(format!(
                "pipelined early exit needs a batch of 1, got {batch_size}"
            )));
        }
        Ok(())
    }

    /// Run one forward step over `input`.
    pub fn forward<M, L>(
        &mut self,
        model: &mut M,
        link: &mut L,
        state: &mut DecodeState,
        input: StepInput<'_>,
    ) -> Result<StepOutput>
    where
        M: Model + ?Sized,
        L: PipelineLink + ?Sized,
    {
        if input.tokens.dim(0) != input.request_ids.len() {
            return Err(PipelineError::Invariant(format!(
                "{} token rows for {} request ids",
                input.tokens.dim(0),
                input.request_ids.len()
            )));
        }
        self.steps += 1;
        trace!(
            stage = self.stage.rank,
            mode = ?self.mode,
            step = self.steps,
            window = input.tokens.dim(1),
            "forward step"
        );
        match self.mode {
            DispatchMode::NonPipelined => self.forward_single(model, state, input),
            DispatchMode::MicroBatched => self.forward_micro_batched(model, link, state, input),
            DispatchMode::EarlyExit => self.forward_early_exit(model, link, state, input),
        }
    }

    // ── Non-pipelined ────────────────────────────────────────────────────

    fn forward_single<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        state: &mut DecodeState,
        input: StepInput<'_>,
    ) -> Result<StepOutput> {
        let out = model.forward(model_input(&input, None), state)?;
        let logits = out.exit_logits.unwrap_or(out.output);
        Ok(StepOutput {
            logits: self.stage.is_last().then_some(logits),
            exited_request_ids: out.exited_request_ids,
            offset_advanced: false,
        })
    }

    // ── Micro-batched ────────────────────────────────────────────────────

    fn forward_micro_batched<M, L>(
        &mut self,
        model: &mut M,
        link: &mut L,
        state: &mut DecodeState,
        input: StepInput<'_>,
    ) -> Result<StepOutput>
    where
        M: Model + ?Sized,
        L: PipelineLink + ?Sized,
    {
        let (batch, window) = (input.tokens.dim(0), input.tokens.dim(1));
        let schedule = MicroBatchSchedule::for_step(batch, window, &self.config);
        debug!(
            stage = self.stage.rank,
            batch,
            window,
            micro_batches = schedule.num_micro_batches(),
            "micro-batched step"
        );

        let mut logits: Option<Tensor<f32>> = None;
        for chunk in schedule.chunks() {
            let tokens = input.tokens.narrow(0, chunk.start, chunk.len)?;
            let positions = input.positions.narrow(0, chunk.start, chunk.len)?;
            let ids = &input.request_ids[chunk.start..chunk.start + chunk.len];
            let chunk_input = StepInput {
                tokens: &tokens,
                positions: &positions,
                attention_mask: input.attention_mask,
                request_ids: ids,
            };

            let received = self.receive_activation(link, window, chunk.len)?;
            let out = model.forward(model_input(&chunk_input, received), state)?;
            if out.exited_request_ids.is_some() {
                return Err(PipelineError::Protocol(
                    "per-request exits are only supported without pipelining".into(),
                ));
            }

            if self.stage.is_last() {
                let vocab = out.output.dim(2);
                let acc = logits.get_or_insert_with(|| Tensor::zeros(&[batch, window, vocab]));
                acc.write_narrow(0, chunk.start, &out.output)?;
            } else {
                out.output
                    .check_shape(&[window, chunk.len, self.config.hidden_size])
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                link.send_to_next(out.output)?;
            }
            state.advance_batch_offset(chunk.len);
        }

        state.advance(window)?;
        state.reset_batch_offset();
        Ok(StepOutput {
            logits,
            exited_request_ids: None,
            offset_advanced: true,
        })
    }

    /// Receive into the reusable buffer, reallocating it when the expected
    /// shape changed. Returns `None` on the first stage.
    fn receive_activation<L: PipelineLink + ?Sized>(
        &mut self,
        link: &mut L,
        window: usize,
        rows: usize,
    ) -> Result<Option<&Tensor<f32>>> {
        if self.stage.is_first() {
            return Ok(None);
        }
        let buffer = self.buffer_for(window, rows);
        link.recv_from_prev(buffer)?;
        Ok(Some(&*buffer))
    }

    fn buffer_for(&mut self, window: usize, rows: usize) -> &mut Tensor<f32> {
        let shape = [window, rows, self.config.hidden_size];
        match self.recv_buffer.take() {
            Some(buffer) if buffer.shape() == shape => self.recv_buffer.insert(buffer),
            _ => {
                trace!(stage = self.stage.rank, ?shape, "allocating receive buffer");
                self.recv_buffer.insert(Tensor::zeros(&shape))
            }
        }
    }

    // ── Early exit ───────────────────────────────────────────────────────

    fn forward_early_exit<M, L>(
        &mut self,
        model: &mut M,
        link: &mut L,
        state: &mut DecodeState,
        input: StepInput<'_>,
    ) -> Result<StepOutput>
    where
        M: Model + ?Sized,
        L: PipelineLink + ?Sized,
    {
        let (batch, window) = (input.tokens.dim(0), input.tokens.dim(1));
        self.check_batch(batch)?;

        let mut received = None;
        if !self.stage.is_first() {
            let shape = [window, 1, self.config.hidden_size];
            let activation = self
                .recv_buffer
                .take()
                .filter(|b| b.shape() == shape)
                .unwrap_or_else(|| Tensor::zeros(&shape));
            let mut buffers = [Payload::F32(activation), Payload::from(Tensor::<u8>::scalar(0))];
            link.recv_list_from_prev(&mut buffers)?;
            let [activation, signal] = buffers;
            state.prev_has_early_exited = signal.into_u8()?.data()[0] != 0;
            received = Some(activation.into_f32()?);
        }

        let out = model.forward(model_input(&input, received.as_ref()), state)?;
        self.recv_buffer = received;

        let exited_here = out.exit_logits.is_some();
        if exited_here {
            state.has_early_exited = true;
        }
        let signal = Tensor::<u8>::scalar(u8::from(state.early_exited()));

        // Exactly one stage answers: the first to exit, else the last.
        let answering = !state.prev_has_early_exited && (exited_here || self.stage.is_last());
        let mut logits = if answering { out.exit_logits } else { None };
        if self.stage.is_last() {
            if answering && logits.is_none() {
                logits = Some(out.output);
            }
        } else {
            link.send_list_to_next(vec![Payload::F32(out.output), signal.into()])?;
        }

        debug!(
            stage = self.stage.rank,
            exited = state.has_early_exited,
            upstream_exited = state.prev_has_early_exited,
            answering,
            "early-exit step"
        );

        state.advance(window)?;
        Ok(StepOutput {
            logits,
            exited_request_ids: None,
            offset_advanced: true,
        })
    }
}

fn model_input<'a>(input: &StepInput<'a>, activations: Option<&'a Tensor<f32>>) -> ModelInput<'a> {
    ModelInput {
        tokens: input.tokens,
        positions: input.positions,
        attention_mask: input.attention_mask,
        request_ids: input.request_ids,
        activations,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
