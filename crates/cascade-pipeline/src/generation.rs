//! The decode loop.
//!
//! Every stage runs [`GenerationController::generate`] with the same batch.
//! Each step forwards the window of tokens not yet in the cache. The stage
//! holding the step's logits samples and evaluates stopping, then the link
//! brings the new tokens and the stop decision to the other stages. The
//! first stage assembles the result; every other stage returns `None`.
//!
//! Two step shapes exist:
//!
//! - **batched** (non-pipelined and micro-batched): the last stage samples.
//!   Token columns go last → first, the done flag goes from last to all.
//!   In the non-pipelined case the model may answer only some requests in a
//!   step; the active rows are then reconciled against the caller's
//!   buffered requests.
//! - **early exit** (pipelined, batch of one): whichever stage answers sends
//!   its token and log-probabilities straight to the first stage, which
//!   decides whether to stop and broadcasts `[token, done]` to all.

use std::collections::HashMap;

use cascade_types::config::{GenerationConfig, PipelineConfig};
use cascade_types::{Payload, PipelineStage, RequestId, Tensor, TensorDtype, TokenId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::decode_state::DecodeState;
use crate::dispatcher::{DispatchMode, ForwardStepDispatcher, StepInput, StepOutput};
use crate::error::{PipelineError, Result};
use crate::link::PipelineLink;
use crate::model::{CausalMaskBuilder, MaskBuilder, Model, Tokenizer};
use crate::request::{Batch, BufferedRequests, GeneratedSequence, Request};
use crate::sampling::{argmax, log_softmax, softmax, suppress_newline_after_colon, Sampler};

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub call_id: Uuid,
    /// Active requests in caller order. Requests that rejoined from the
    /// buffer follow the caller's batch.
    pub sequences: Vec<GeneratedSequence>,
    /// Requests answered by the final step's exit, when the model reported
    /// one; empty otherwise.
    pub exited_request_ids: Vec<RequestId>,
    /// Requests held back for a later call.
    pub buffered: BufferedRequests,
    pub steps: usize,
}

// ── Limits ───────────────────────────────────────────────────────────────────

/// Reject a call before it runs any step.
pub(crate) fn check_limits(batch_size: usize, max_sequence_length: usize, config: &PipelineConfig) -> Result<()> {
    if max_sequence_length > config.max_position_embeddings {
        return Err(PipelineError::Precondition(format!(
            "sequence length {max_sequence_length} exceeds the model's {} positions",
            config.max_position_embeddings
        )));
    }
    let requested = batch_size * max_sequence_length;
    if requested > config.max_tokens_budget {
        return Err(PipelineError::ResourceLimit {
            requested,
            budget: config.max_tokens_budget,
        });
    }
    Ok(())
}

/// Positions `[start, end)` for each of `ids`, looked up by the row the id
/// held when the mask was built.
pub(crate) fn window_positions(
    positions: &Tensor<i64>,
    rows: &HashMap<RequestId, usize>,
    ids: &[RequestId],
    start: usize,
    end: usize,
) -> Result<Tensor<i64>> {
    // Positions carry no per-row resets, so any row serves a newcomer.
    let data = ids
        .iter()
        .flat_map(|id| {
            let row = rows.get(id).copied().unwrap_or(0);
            positions.row(row)[start..end].iter().copied()
        })
        .collect();
    Ok(Tensor::from_vec(&[ids.len(), end - start], data)?)
}

// ── Loop State ───────────────────────────────────────────────────────────────

struct DecodeRun {
    call_id: Uuid,
    batch: Batch,
    buffered: BufferedRequests,
    state: DecodeState,
    sampler: Sampler,
    dispatcher: ForwardStepDispatcher,
    mask: Tensor<u8>,
    positions: Tensor<i64>,
    /// Row each request held when the mask was built.
    caller_rows: HashMap<RequestId, usize>,
    last_forwarded: usize,
    exited_request_ids: Vec<RequestId>,
}

/// What the answering stage decided for one row.
struct Sampled {
    token: TokenId,
    /// Log-probabilities of the tokens at positions `ctx - len + 1 ..= ctx`.
    log_probs: Vec<f32>,
}

// ── Controller ───────────────────────────────────────────────────────────────

pub struct GenerationController<'a, M: ?Sized, L: ?Sized> {
    model: &'a mut M,
    link: &'a mut L,
    tokenizer: &'a dyn Tokenizer,
    mask_builder: Box<dyn MaskBuilder + 'a>,
    pipeline: PipelineConfig,
    config: GenerationConfig,
}

impl<'a, M, L> GenerationController<'a, M, L>
where
    M: Model + ?Sized,
    L: PipelineLink + ?Sized,
{
    pub fn new(
        model: &'a mut M,
        link: &'a mut L,
        tokenizer: &'a dyn Tokenizer,
        pipeline: PipelineConfig,
        config: GenerationConfig,
    ) -> Self {
        Self {
            model,
            link,
            tokenizer,
            mask_builder: Box::new(CausalMaskBuilder),
            pipeline,
            config,
        }
    }

    pub fn with_mask_builder(mut self, builder: impl MaskBuilder + 'a) -> Self {
        self.mask_builder = Box::new(builder);
        self
    }

    fn stage(&self) -> PipelineStage {
        self.link.stage().clone()
    }

    /// Configured stop tokens, or end of document when none are set.
    fn stop_tokens(&self) -> Vec<TokenId> {
        if self.config.stop.stop_tokens.is_empty() {
            return vec![self.tokenizer.eod_token_id()];
        }
        self.config.stop.stop_tokens.clone()
    }

    // ── Generate ─────────────────────────────────────────────────────────

    /// Decode `batch` until every request stops or the buffer is full.
    ///
    /// `buffered` holds requests left out of earlier calls; it comes back in
    /// the output. Returns `None` on every stage but the first.
    pub fn generate(&mut self, batch: Batch, buffered: BufferedRequests) -> Result<Option<GenerationOutput>> {
        let stage = self.stage();
        self.config
            .validate()
            .map_err(|e| PipelineError::Precondition(e.to_string()))?;
        if batch.is_empty() {
            return Err(PipelineError::Precondition("empty batch".into()));
        }
        let max_seq = batch.max_sequence_length();
        // Buffered requests may rejoin mid-call and need cache rows too.
        let capacity = batch.len() + buffered.len();
        check_limits(capacity, max_seq, &self.pipeline)?;
        let min_prompt = batch.min_prompt_length();
        if min_prompt >= max_seq {
            return Err(PipelineError::Precondition(format!(
                "shortest prompt ({min_prompt} tokens) leaves no room under max sequence length {max_seq}"
            )));
        }

        let dispatcher = ForwardStepDispatcher::new(
            stage.clone(),
            self.pipeline.clone(),
            self.config.early_exit.use_early_exit,
        );
        dispatcher.check_batch(batch.len())?;

        let call_id = Uuid::new_v4();
        info!(
            call_id = %call_id,
            stage = stage.rank,
            batch = batch.len(),
            buffered = buffered.len(),
            max_seq,
            mode = ?dispatcher.mode(),
            "generation started"
        );

        let (mask, positions) = self.mask_builder.build(&batch.token_tensor(max_seq)?)?;
        let caller_rows = batch
            .request_ids()
            .into_iter()
            .enumerate()
            .map(|(row, id)| (id, row))
            .collect();
        let mut run = DecodeRun {
            call_id,
            state: DecodeState::new(
                capacity,
                max_seq,
                self.config.sampling.clone(),
                &self.config.early_exit,
            ),
            sampler: Sampler::new(self.config.sampling.seed),
            batch,
            buffered,
            dispatcher,
            mask,
            positions,
            caller_rows,
            last_forwarded: 0,
            exited_request_ids: Vec::new(),
        };

        let mut steps = 0;
        let mut stopped = false;
        let mut ctx = min_prompt;
        while ctx < max_seq {
            let done = self.step(&mut run, ctx)?;
            steps += 1;
            if done && self.config.stop.use_stop_tokens_for_early_termination {
                stopped = true;
                break;
            }
            ctx += 1;
        }
        let final_ctx = ctx.min(max_seq - 1);

        if run.dispatcher.mode() != DispatchMode::EarlyExit {
            self.collect_on_first(&mut run, final_ctx)?;
        }

        info!(
            call_id = %call_id,
            stage = stage.rank,
            steps,
            reason = if stopped { "all requests stopped" } else { "max length" },
            "generation finished"
        );

        if !stage.is_first() {
            return Ok(None);
        }
        Ok(Some(self.assemble(run, steps)))
    }

    /// Run one step at `ctx`. Returns the global done flag.
    fn step(&mut self, run: &mut DecodeRun, ctx: usize) -> Result<bool> {
        let start = run.last_forwarded;
        let window = ctx - start;
        let ids = run.batch.request_ids();
        let tokens = run.batch.window(start, ctx)?;
        let positions = window_positions(&run.positions, &run.caller_rows, &ids, start, ctx)?;
        let mask = run.mask.narrow(2, start, window)?.narrow(3, 0, ctx)?;

        run.state.clear_early_exit_signals();
        let input = StepInput {
            tokens: &tokens,
            positions: &positions,
            attention_mask: &mask,
            request_ids: &ids,
        };
        let out = run
            .dispatcher
            .forward(&mut *self.model, &mut *self.link, &mut run.state, input)?;

        debug!(
            call_id = %run.call_id,
            ctx,
            window,
            offset = run.state.sequence_len_offset(),
            exited = run.state.has_early_exited,
            upstream_exited = run.state.prev_has_early_exited,
            "step"
        );

        let done = match run.dispatcher.mode() {
            DispatchMode::EarlyExit => self.early_exit_step(run, ctx, out)?,
            DispatchMode::NonPipelined | DispatchMode::MicroBatched => self.batched_step(run, ctx, window, out)?,
        };
        run.state.decay_top_p();
        run.state.is_first_step = false;
        Ok(done)
    }

    // ── Batched step ─────────────────────────────────────────────────────

    fn batched_step(&mut self, run: &mut DecodeRun, ctx: usize, window: usize, out: StepOutput) -> Result<bool> {
        let stage = self.stage();
        let early_exited = run.state.early_exited();

        let mut column = None;
        let mut done = None;
        if let Some(logits) = out.logits {
            if let Some(exited) = out.exited_request_ids {
                let previous = run.batch.request_ids();
                run.batch.reconcile(&exited, &mut run.buffered)?;
                run.state.reconcile_rows(&previous, &exited)?;
                debug!(
                    call_id = %run.call_id,
                    active = exited.len(),
                    buffered = run.buffered.len(),
                    "reconciled exited requests"
                );
                run.exited_request_ids = exited;
            }
            if logits.dim(0) != run.batch.len() {
                return Err(PipelineError::Protocol(format!(
                    "{} logits rows for {} active requests",
                    logits.dim(0),
                    run.batch.len()
                )));
            }
            let stops = self.stop_tokens();
            for row in 0..run.batch.len() {
                let sampled = self.sample_row(run, row, ctx, &logits)?;
                let request = &mut run.batch.requests_mut()[row];
                commit_token(request, ctx, sampled.token, &stops)?;
                if self.config.return_output_log_probs {
                    record_log_probs(request, ctx, &sampled.log_probs);
                }
            }
            column = Some(Payload::from(run.batch.column(ctx)?));
            done = Some(run.batch.requests().iter().all(Request::is_done));
        }

        let rows = run.batch.len();
        let received = self
            .link
            .broadcast_from_last_to_first(&[rows], TensorDtype::I64, column)?;
        if let (Some(payload), false) = (received, stage.is_last()) {
            let column = payload.into_i64().map_err(PipelineError::protocol)?;
            for (request, &token) in run.batch.requests_mut().iter_mut().zip(column.data()) {
                if request.is_started(ctx) {
                    request.push(token)?;
                }
            }
        }

        if !out.offset_advanced && !early_exited {
            run.state.advance(window)?;
        }
        if out.offset_advanced || !early_exited {
            run.last_forwarded = ctx;
        }

        let done = done.map(|d| Payload::from(Tensor::<u8>::scalar(u8::from(d))));
        let done = self.link.broadcast_from_last(&[1], TensorDtype::U8, done)?;
        Ok(done.into_u8().map_err(PipelineError::protocol)?.data()[0] != 0)
    }

    /// Move final lengths and log-probabilities from the last stage to the
    /// first.
    fn collect_on_first(&mut self, run: &mut DecodeRun, final_ctx: usize) -> Result<()> {
        let stage = self.stage();
        let rows = run.batch.len();

        let lengths = stage.is_last().then(|| {
            let data = run.batch.requests().iter().map(|r| r.final_length() as i64).collect();
            Tensor::from_vec(&[rows], data)
        });
        let lengths = lengths.transpose()?.map(Payload::from);
        let lengths = self
            .link
            .broadcast_from_last_to_first(&[rows], TensorDtype::I64, lengths)?;

        let log_probs = if self.config.return_output_log_probs {
            let local = stage.is_last().then(|| {
                let data = run
                    .batch
                    .requests()
                    .iter()
                    .flat_map(|r| r.log_probs(final_ctx).to_vec())
                    .collect();
                Tensor::from_vec(&[rows, final_ctx], data)
            });
            let local = local.transpose()?.map(Payload::from);
            self.link
                .broadcast_from_last_to_first(&[rows, final_ctx], TensorDtype::F32, local)?
        } else {
            None
        };

        if stage.is_first() && !stage.is_last() {
            if let Some(lengths) = lengths {
                let lengths = lengths.into_i64().map_err(PipelineError::protocol)?;
                for (request, &len) in run.batch.requests_mut().iter_mut().zip(lengths.data()) {
                    request.generated_length = Some(len as usize);
                }
            }
            if let Some(log_probs) = log_probs {
                let log_probs = log_probs.into_f32().map_err(PipelineError::protocol)?;
                for (row, request) in run.batch.requests_mut().iter_mut().enumerate() {
                    for (position, &lp) in log_probs.row(row).iter().enumerate() {
                        request.set_log_prob(position, lp);
                    }
                }
            }
        }
        Ok(())
    }

    // ── Early-exit step ──────────────────────────────────────────────────

    fn early_exit_step(&mut self, run: &mut DecodeRun, ctx: usize, out: StepOutput) -> Result<bool> {
        let stage = self.stage();

        let answer = match out.logits {
            Some(logits) => {
                let sampled = self.sample_row(run, 0, ctx, &logits)?;
                if !stage.is_first() {
                    let log_probs = Tensor::from_vec(&[1, sampled.log_probs.len()], sampled.log_probs)?;
                    self.link.send_result_to_first(vec![
                        Tensor::<i64>::scalar(sampled.token).into(),
                        log_probs.into(),
                    ])?;
                    None
                } else {
                    Some(sampled)
                }
            }
            None if stage.is_first() => Some(receive_answer(self.link.recv_result_on_first()?)?),
            None => None,
        };

        // The dispatcher already advanced the offset.
        run.last_forwarded = ctx;
        let stops = self.stop_tokens();

        let decided = match answer {
            Some(sampled) => {
                let request = &mut run.batch.requests_mut()[0];
                commit_token(request, ctx, sampled.token, &stops)?;
                if self.config.return_output_log_probs {
                    record_log_probs(request, ctx, &sampled.log_probs);
                }
                let done = i64::from(request.is_done());
                Some(Payload::from(Tensor::from_vec(&[2], vec![sampled.token, done])?))
            }
            None => None,
        };
        let decided = self.link.broadcast_from_first(&[2], TensorDtype::I64, decided)?;
        let decided = decided.into_i64().map_err(PipelineError::protocol)?;
        let (token, done) = (decided.data()[0], decided.data()[1] != 0);

        if !stage.is_first() {
            commit_token(&mut run.batch.requests_mut()[0], ctx, token, &stops)?;
        }
        Ok(done)
    }

    // ── Sampling ─────────────────────────────────────────────────────────

    /// Sample the token following `row`'s window and score the window.
    fn sample_row(&mut self, run: &mut DecodeRun, row: usize, ctx: usize, logits: &Tensor<f32>) -> Result<Sampled> {
        let (len, vocab) = (logits.dim(1), logits.dim(2));
        if len == 0 || len > ctx {
            return Err(PipelineError::Protocol(format!(
                "logits cover {len} positions at context length {ctx}"
            )));
        }
        let mut row_logits = logits.row(row).to_vec();
        let request = &run.batch.requests()[row];
        // A row that rejoined from the buffer continues from its own last
        // token, which may sit before the end of the window.
        let window_start = ctx - len;
        let position = request.cursor().saturating_sub(1).clamp(window_start, ctx - 1);
        let at = (position - window_start) * vocab;

        if self.config.stop.prevent_newline_after_colon {
            if let (Some(colon), Some(newline)) = (self.tokenizer.single_token(":"), self.tokenizer.single_token("\n")) {
                let next = &mut row_logits[at..at + vocab];
                suppress_newline_after_colon(next, request.token_at(position), colon, newline);
            }
        }

        let last = &row_logits[at..at + vocab];
        let token = run.sampler.sample(last, run.state.sampling(), self.tokenizer.vocab_size());

        if self.config.early_exit.log_max_prob {
            let probs = softmax(last);
            let best = argmax(&probs);
            info!(
                call_id = %run.call_id,
                stage = self.link.stage().rank,
                request_id = request.request_id,
                token = %self.tokenizer.detokenize(&[best as TokenId]),
                prob = probs[best],
                "max prob"
            );
        }

        // Rows still inside their prompt keep the prompt token at `ctx`.
        let realized = if request.is_started(ctx) { token } else { request.token_at(ctx) };
        let log_probs = if self.config.return_output_log_probs {
            (0..len)
                .map(|j| {
                    let target = window_start + j + 1;
                    let next = if target == ctx { realized } else { request.token_at(target) };
                    let lp = log_softmax(&row_logits[j * vocab..(j + 1) * vocab]);
                    usize::try_from(next).ok().and_then(|t| lp.get(t).copied()).unwrap_or(f32::NEG_INFINITY)
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Sampled { token, log_probs })
    }

    // ── Output ───────────────────────────────────────────────────────────

    fn assemble(&self, run: DecodeRun, steps: usize) -> GenerationOutput {
        let DecodeRun {
            call_id,
            batch,
            buffered,
            caller_rows,
            exited_request_ids,
            ..
        } = run;
        let mut requests = batch.into_requests();
        requests.sort_by_key(|r| caller_rows.get(&r.request_id).copied().unwrap_or(usize::MAX));
        let sequences = requests
            .iter()
            .map(|r| GeneratedSequence::from_request(r, self.config.echo_prompts, self.config.return_output_log_probs))
            .collect();
        GenerationOutput {
            call_id,
            sequences,
            exited_request_ids,
            buffered,
            steps,
        }
    }

    // ── Score ────────────────────────────────────────────────────────────

    /// Log-probability of every prompt token after the first, as
    /// `[batch, prompt_len - 1]`. One forward pass, no sampling. Returns
    /// `None` on every stage but the first.
    pub fn score(&mut self, batch: &Batch) -> Result<Option<Tensor<f32>>> {
        let stage = self.stage();
        if batch.is_empty() {
            return Err(PipelineError::Precondition("empty batch".into()));
        }
        let rows = batch.len();
        let len = batch.max_prompt_length();
        check_limits(rows, len, &self.pipeline)?;

        let call_id = Uuid::new_v4();
        info!(call_id = %call_id, stage = stage.rank, batch = rows, len, "scoring started");

        let mut dispatcher = ForwardStepDispatcher::new(stage.clone(), self.pipeline.clone(), false);
        let mut state = DecodeState::new(rows, len, self.config.sampling.clone(), &Default::default());
        let tokens = batch.token_tensor(len)?;
        let (mask, positions) = self.mask_builder.build(&tokens)?;
        let ids = batch.request_ids();
        let input = StepInput {
            tokens: &tokens,
            positions: &positions,
            attention_mask: &mask,
            request_ids: &ids,
        };
        let out = dispatcher.forward(&mut *self.model, &mut *self.link, &mut state, input)?;

        let scored = out
            .logits
            .map(|logits| gather_prompt_log_probs(&logits, &tokens))
            .transpose()?
            .map(Payload::from);
        let scored = self
            .link
            .broadcast_from_last_to_first(&[rows, len - 1], TensorDtype::F32, scored)?;

        info!(call_id = %call_id, stage = stage.rank, "scoring finished");
        if !stage.is_first() {
            return Ok(None);
        }
        scored
            .map(|p| p.into_f32().map_err(PipelineError::protocol))
            .transpose()
    }
}

/// Write `token` at `ctx` if the request has started, and mark the request
/// done the first time it emits a stop token.
fn commit_token(request: &mut Request, ctx: usize, token: TokenId, stops: &[TokenId]) -> Result<()> {
    if !request.is_started(ctx) {
        return Ok(());
    }
    request.push(token)?;
    if !request.is_done() && stops.contains(&token) {
        request.generated_length = Some(request.cursor());
    }
    Ok(())
}

/// Store `log_probs` for the positions ending at `ctx`. Positions the
/// request has not reached are skipped.
fn record_log_probs(request: &mut Request, ctx: usize, log_probs: &[f32]) {
    let first = ctx + 1 - log_probs.len();
    for (j, &lp) in log_probs.iter().enumerate() {
        let target = first + j;
        if target < request.cursor() {
            request.set_log_prob(target - 1, lp);
        }
    }
}

fn receive_answer(mut payloads: Vec<Payload>) -> Result<Sampled> {
    if payloads.len() != 2 {
        return Err(PipelineError::Protocol(format!(
            "step result carries {} tensors, expected 2",
            payloads.len()
        )));
    }
    let log_probs = payloads.pop().map(Payload::into_f32).transpose().map_err(PipelineError::protocol)?;
    let token = payloads.pop().map(Payload::into_i64).transpose().map_err(PipelineError::protocol)?;
    match (token, log_probs) {
        (Some(token), Some(log_probs)) if token.numel() == 1 => Ok(Sampled {
            token: token.data()[0],
            log_probs: log_probs.into_vec(),
        }),
        _ => Err(PipelineError::Protocol("malformed step result".into())),
    }
}

fn gather_prompt_log_probs(logits: &Tensor<f32>, tokens: &Tensor<TokenId>) -> Result<Tensor<f32>> {
    let (rows, len, vocab) = (logits.dim(0), logits.dim(1), logits.dim(2));
    let mut data = Vec::with_capacity(rows * len.saturating_sub(1));
    for r in 0..rows {
        let row = logits.row(r);
        let row_tokens = tokens.row(r);
        for j in 0..len.saturating_sub(1) {
            let lp = log_softmax(&row[j * vocab..(j + 1) * vocab]);
            let next = usize::try_from(row_tokens[j + 1]).unwrap_or(0);
            data.push(lp.get(next).copied().unwrap_or(f32::NEG_INFINITY));
        }
    }
    Ok(Tensor::from_vec(&[rows, len.saturating_sub(1)], data)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::thread;

    use cascade_types::config::{EarlyExitConfig, SamplingConfig, StopConfig};
    use proptest::prelude::*;

    use super::*;
    use crate::link::{local_pipeline, LocalLink};
    use crate::planner::plan_stages;
    use crate::test_support::{successor, ExitAt, ToyModel, ToyTokenizer, COLON, EOD, HIDDEN, NEWLINE};

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            hidden_size: HIDDEN,
            max_position_embeddings: 64,
            max_tokens_budget: 256,
            pipelining_batch_x_seqlen_threshold: 4,
            micro_batch_size: None,
        }
    }

    fn greedy() -> GenerationConfig {
        GenerationConfig {
            sampling: SamplingConfig::greedy(),
            return_output_log_probs: true,
            ..GenerationConfig::default()
        }
    }

    fn single_link() -> LocalLink {
        local_pipeline(&plan_stages(2, 1, &[]).unwrap()).pop().unwrap()
    }

    fn generate_single(
        model: &mut ToyModel,
        prompts: Vec<(RequestId, Vec<TokenId>)>,
        max_seq: usize,
        config: GenerationConfig,
        buffered: BufferedRequests,
    ) -> Result<Option<GenerationOutput>> {
        let mut link = single_link();
        let batch = Batch::from_prompts(prompts, max_seq, 0)?;
        let tokenizer = ToyTokenizer;
        let mut controller = GenerationController::new(model, &mut link, &tokenizer, pipeline_config(), config);
        controller.generate(batch, buffered)
    }

    /// Run a call across `n` stage threads; returns each stage's result.
    fn generate_pipelined(
        n: u32,
        prompts: Vec<(RequestId, Vec<TokenId>)>,
        max_seq: usize,
        config: GenerationConfig,
        exit_at: ExitAt,
    ) -> Vec<Option<GenerationOutput>> {
        let stages = plan_stages(n * 2, n, &[1]).unwrap();
        let handles: Vec<_> = local_pipeline(&stages)
            .into_iter()
            .map(|mut link| {
                let prompts = prompts.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let mut model = ToyModel::new(link.stage().clone(), exit_at);
                    let tokenizer = ToyTokenizer;
                    let batch = Batch::from_prompts(prompts, max_seq, 0).unwrap();
                    let mut controller =
                        GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), config);
                    controller.generate(batch, BufferedRequests::new()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn counting(from: TokenId, n: usize) -> Vec<TokenId> {
        (0..n as TokenId).map(|i| (from + i).rem_euclid(16)).collect()
    }

    #[test]
    fn greedy_counts_up_and_strips_prompt() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![1, 2])], 6, greedy(), BufferedRequests::new())
            .unwrap()
            .unwrap();
        let seq = &out.sequences[0];
        assert_eq!(seq.tokens, vec![3, 4, 5, 6]);
        assert_eq!(seq.length, 4);
        assert_eq!(seq.log_probs.as_ref().unwrap().len(), 4);
        assert_eq!(out.steps, 4);
    }

    #[test]
    fn echo_returns_prompt_and_generation() {
        let config = GenerationConfig {
            echo_prompts: true,
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![1, 2])], 5, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.sequences[0].tokens, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stops_at_each_rows_own_stop_step() {
        // Row 1 reaches EOD (15) after one token, row 2 after three.
        let config = GenerationConfig {
            stop: StopConfig {
                prevent_newline_after_colon: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(
            &mut model,
            vec![(1, vec![13, 14]), (2, vec![12])],
            10,
            config,
            BufferedRequests::new(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(out.sequences[0].tokens, vec![EOD]);
        assert_eq!(out.sequences[1].tokens, vec![13, 14, EOD]);
        // The loop ends once the slower row stops: ctx runs 1, 2, 3.
        assert_eq!(out.steps, 3);
    }

    #[test]
    fn runs_to_max_length_without_early_termination() {
        let config = GenerationConfig {
            stop: StopConfig {
                use_stop_tokens_for_early_termination: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![14])], 5, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        // Stops reporting at the first EOD even though decoding went on.
        assert_eq!(out.sequences[0].tokens, vec![EOD]);
        assert_eq!(out.steps, 4);
    }

    #[test]
    fn configured_stop_tokens_finish_requests() {
        let config = GenerationConfig {
            stop: StopConfig {
                stop_tokens: vec![4],
                ..StopConfig::default()
            },
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![2])], 10, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.sequences[0].tokens, vec![3, 4]);
    }

    #[test]
    fn configured_stop_tokens_replace_end_of_document() {
        // 13 → 14 → EOD → 0 → 1 → 2: only 2 finishes the request.
        let config = GenerationConfig {
            stop: StopConfig {
                stop_tokens: vec![2],
                prevent_newline_after_colon: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![13])], 10, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.sequences[0].tokens, vec![14, EOD, 0, 1, 2]);
        assert_eq!(out.steps, 5);
    }

    #[test]
    fn newline_after_colon_is_suppressed() {
        // The toy model would emit NEWLINE right after COLON.
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![COLON])], 3, greedy(), BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_ne!(out.sequences[0].tokens[0], NEWLINE);
        assert_eq!(out.sequences[0].tokens[0], 14);
    }

    #[test]
    fn rejects_over_budget_before_any_step() {
        // 4 × 64 = 256, one token over the budget.
        let mut cfg = pipeline_config();
        cfg.max_tokens_budget = 255;
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let mut link = single_link();
        let tokenizer = ToyTokenizer;
        let prompts = (0..4).map(|i| (i, vec![1])).collect();
        let batch = Batch::from_prompts(prompts, 64, 0).unwrap();
        let mut controller = GenerationController::new(&mut model, &mut link, &tokenizer, cfg, greedy());
        let err = controller.generate(batch, BufferedRequests::new()).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceLimit { requested: 256, budget: 255 }));
        drop(controller);
        // No forward step touched the cache.
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn rejects_sequence_past_position_limit() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let err = generate_single(&mut model, vec![(1, vec![1])], 65, greedy(), BufferedRequests::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn rejects_top_k_with_top_p() {
        let config = GenerationConfig {
            sampling: SamplingConfig {
                top_k: 3,
                top_p: 0.5,
                ..SamplingConfig::default()
            },
            ..GenerationConfig::default()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let err = generate_single(&mut model, vec![(1, vec![1])], 4, config, BufferedRequests::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn divergent_prompts_share_a_first_window() {
        // Row 2 keeps its prompt token at position 1 while row 1 samples.
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let config = GenerationConfig {
            echo_prompts: true,
            ..greedy()
        };
        let out = generate_single(&mut model, vec![(1, vec![5]), (2, vec![7, 9])], 4, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.sequences[0].tokens, vec![5, 6, 7, 8]);
        assert_eq!(out.sequences[1].tokens, vec![7, 9, 10, 11]);
    }

    #[test]
    fn unstarted_rows_score_their_prompt_token() {
        let config = GenerationConfig {
            echo_prompts: true,
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let out = generate_single(&mut model, vec![(1, vec![5]), (2, vec![7, 9])], 4, config, BufferedRequests::new())
            .unwrap()
            .unwrap();
        let generated = out.sequences[1].log_probs.clone().unwrap();

        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let mut link = single_link();
        let tokenizer = ToyTokenizer;
        let prompt = Batch::from_prompts(vec![(2, vec![7, 9])], 2, 0).unwrap();
        let mut controller =
            GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), greedy());
        let scored = controller.score(&prompt).unwrap().unwrap();

        // Position 1 holds the prompt's 9, not the 8 sampled for that slot.
        assert!((generated[0] - scored.data()[0]).abs() < 1e-6);
        assert!(generated[0] < -1.0);
    }

    #[test]
    fn offset_tracks_window_unless_exited() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never)
            .with_scripted_exits(vec![None, Some(vec![1]), None]);
        let mut link = single_link();
        let tokenizer = ToyTokenizer;
        let batch = Batch::from_prompts(vec![(1, vec![1, 2])], 8, 0).unwrap();
        let mut controller =
            GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), greedy());
        let config = controller.config.clone();

        let mut run = DecodeRun {
            call_id: Uuid::new_v4(),
            state: DecodeState::new(1, 8, config.sampling.clone(), &config.early_exit),
            sampler: Sampler::new(Some(0)),
            dispatcher: ForwardStepDispatcher::new(PipelineStage::single(2), pipeline_config(), false),
            mask: CausalMaskBuilder.build(&batch.token_tensor(8).unwrap()).unwrap().0,
            positions: CausalMaskBuilder.build(&batch.token_tensor(8).unwrap()).unwrap().1,
            caller_rows: HashMap::from([(1, 0)]),
            batch,
            buffered: BufferedRequests::new(),
            last_forwarded: 0,
            exited_request_ids: Vec::new(),
        };

        controller.step(&mut run, 2).unwrap();
        assert_eq!(run.state.sequence_len_offset(), 2);
        // The model exits early: nothing folded into the cache.
        controller.step(&mut run, 3).unwrap();
        assert_eq!(run.state.sequence_len_offset(), 2);
        assert_eq!(run.last_forwarded, 2);
        // The next window re-covers the skipped position.
        controller.step(&mut run, 4).unwrap();
        assert_eq!(run.state.sequence_len_offset(), 4);
        assert_eq!(run.batch.requests()[0].tokens(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn buffered_request_rejoins_without_gaps() {
        // Step 1: only request 2 exits, request 1 is buffered.
        // Step 2: both exit; request 1 comes back from the buffer.
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never)
            .with_scripted_exits(vec![Some(vec![2]), Some(vec![2, 1])]);
        let config = GenerationConfig {
            stop: StopConfig {
                use_stop_tokens_for_early_termination: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let out = generate_single(
            &mut model,
            vec![(1, vec![1]), (2, vec![5])],
            4,
            config,
            BufferedRequests::new(),
        )
        .unwrap()
        .unwrap();

        assert!(out.buffered.is_empty());
        // Caller order is restored.
        assert_eq!(out.sequences[0].request_id, 1);
        // Request 1 missed a step while buffered and continues contiguously.
        assert_eq!(out.sequences[0].tokens, counting(2, 2));
        assert_eq!(out.sequences[1].tokens, counting(6, 3));
    }

    #[test]
    fn buffered_requests_survive_across_calls() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never)
            .with_scripted_exits(vec![Some(vec![2])]);
        let config = GenerationConfig {
            stop: StopConfig {
                use_stop_tokens_for_early_termination: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let out = generate_single(&mut model, vec![(1, vec![1]), (2, vec![5])], 3, config.clone(), BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.exited_request_ids, vec![2]);
        assert!(out.buffered.contains_key(&1));

        // A later call re-admits request 1 from the carried buffer.
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never)
            .with_scripted_exits(vec![Some(vec![3, 1])]);
        let out = generate_single(&mut model, vec![(3, vec![7]), (4, vec![8])], 3, config, out.buffered)
            .unwrap()
            .unwrap();
        assert_eq!(out.sequences.len(), 2);
        assert_eq!(out.sequences[0].request_id, 3);
        assert_eq!(out.sequences[1].request_id, 1);
        assert!(out.buffered.contains_key(&4));
        assert!(!out.buffered.contains_key(&1));
    }

    #[test]
    fn buffered_request_rejoins_a_smaller_call() {
        let config = GenerationConfig {
            stop: StopConfig {
                use_stop_tokens_for_early_termination: false,
                ..StopConfig::default()
            },
            ..greedy()
        };
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never).with_scripted_exits(vec![Some(vec![2])]);
        let first = generate_single(&mut model, vec![(1, vec![1]), (2, vec![5])], 3, config.clone(), BufferedRequests::new())
            .unwrap()
            .unwrap();
        assert!(first.buffered.contains_key(&1));

        // One new request, and request 1 comes back on the first step.
        let mut model = model.with_scripted_exits(vec![Some(vec![3, 1])]);
        let out = generate_single(&mut model, vec![(3, vec![7])], 3, config, first.buffered)
            .unwrap()
            .unwrap();
        assert!(out.buffered.is_empty());
        assert_eq!(out.sequences[0].request_id, 3);
        assert_eq!(out.sequences[0].tokens, vec![8, 9]);
        assert_eq!(out.sequences[1].request_id, 1);
        assert_eq!(out.sequences[1].tokens, counting(2, 2));
    }

    #[test]
    fn unknown_exited_request_is_a_protocol_error() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never)
            .with_scripted_exits(vec![Some(vec![99])]);
        let err = generate_single(&mut model, vec![(1, vec![1])], 4, greedy(), BufferedRequests::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Protocol(_)));
    }

    #[test]
    fn pipelined_matches_single_stage() {
        let prompts = vec![(1, vec![3, 4]), (2, vec![8]), (3, vec![0, 1, 2])];
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let single = generate_single(&mut model, prompts.clone(), 7, greedy(), BufferedRequests::new())
            .unwrap()
            .unwrap();

        let results = generate_pipelined(3, prompts, 7, greedy(), ExitAt::Never);
        assert!(results[1].is_none() && results[2].is_none());
        let piped = results[0].as_ref().unwrap();
        assert_eq!(piped.sequences, single.sequences);
    }

    #[test]
    fn pipelined_early_exit_matches_full_pipeline() {
        let config = GenerationConfig {
            early_exit: EarlyExitConfig {
                use_early_exit: true,
                exit_layers: vec![1],
                log_max_prob: true,
                ..EarlyExitConfig::default()
            },
            ..greedy()
        };
        let prompts = vec![(7, vec![0, 1])];
        let full = generate_pipelined(3, prompts.clone(), 8, config.clone(), ExitAt::Never);
        let exiting = generate_pipelined(3, prompts.clone(), 8, config.clone(), ExitAt::Stage(0));
        let mixed = generate_pipelined(3, prompts, 8, config, ExitAt::Alternate(1));

        let expected = &full[0].as_ref().unwrap().sequences;
        assert_eq!(expected[0].tokens, counting(2, 6));
        assert_eq!(&exiting[0].as_ref().unwrap().sequences, expected);
        assert_eq!(&mixed[0].as_ref().unwrap().sequences, expected);
    }

    #[test]
    fn pipelined_early_exit_rejects_batches() {
        let config = GenerationConfig {
            early_exit: EarlyExitConfig {
                use_early_exit: true,
                ..EarlyExitConfig::default()
            },
            ..greedy()
        };
        let stages = plan_stages(4, 2, &[]).unwrap();
        let mut link = local_pipeline(&stages).remove(0);
        let mut model = ToyModel::new(stages[0].clone(), ExitAt::Never);
        let tokenizer = ToyTokenizer;
        let batch = Batch::from_prompts(vec![(1, vec![1]), (2, vec![2])], 4, 0).unwrap();
        let mut controller = GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), config);
        let err = controller.generate(batch, BufferedRequests::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn score_gathers_prompt_log_probs() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let mut link = single_link();
        let tokenizer = ToyTokenizer;
        let batch = Batch::from_prompts(vec![(1, vec![1, 2, 4])], 3, 0).unwrap();
        let mut controller =
            GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), greedy());
        let scores = controller.score(&batch).unwrap().unwrap();
        assert_eq!(scores.shape(), &[1, 2]);
        // 1 → 2 is the predicted successor, 2 → 4 only the runner-up.
        assert!(scores.data()[0] > scores.data()[1]);
    }

    #[test]
    fn score_across_stages() {
        let stages = plan_stages(4, 2, &[]).unwrap();
        let handles: Vec<_> = local_pipeline(&stages)
            .into_iter()
            .map(|mut link| {
                thread::spawn(move || {
                    let mut model = ToyModel::new(link.stage().clone(), ExitAt::Never);
                    let tokenizer = ToyTokenizer;
                    let batch = Batch::from_prompts(vec![(1, vec![1, 2]), (2, vec![3, 5])], 2, 0).unwrap();
                    let mut controller =
                        GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), greedy());
                    controller.score(&batch).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].as_ref().unwrap().shape(), &[2, 1]);
        assert!(results[1].is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn greedy_is_deterministic(prompt in proptest::collection::vec(0i64..12, 1..4), extra in 1usize..5) {
            let max_seq = prompt.len() + extra;
            let run = || {
                let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
                generate_single(&mut model, vec![(1, prompt.clone())], max_seq, greedy(), BufferedRequests::new())
                    .unwrap()
                    .unwrap()
                    .sequences
            };
            let first = run();
            prop_assert_eq!(&first, &run());
            let last = *prompt.last().unwrap();
            prop_assert_eq!(first[0].tokens.first().copied(), Some(successor(last)));
        }
    }
}
