//! Beam search over a single prompt.
//!
//! The last stage holds the beam scores and picks continuations. After each
//! step it tells every stage which rows survived, so each stage can reorder
//! its own cache, and it ships the reordered token buffer to the first stage.
//! Finished hypotheses are kept in a bounded [`BeamHypotheses`] set.

use cascade_types::config::{BeamConfig, EarlyExitConfig, PipelineConfig, SamplingConfig};
use cascade_types::{Payload, RequestId, Tensor, TensorDtype, TokenId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::decode_state::DecodeState;
use crate::dispatcher::{ForwardStepDispatcher, StepInput};
use crate::error::{PipelineError, Result};
use crate::generation::check_limits;
use crate::link::PipelineLink;
use crate::model::{CausalMaskBuilder, MaskBuilder, Model, Tokenizer};
use crate::sampling::{log_softmax, suppress_newline_after_colon};

// ── Hypotheses ───────────────────────────────────────────────────────────────

/// A finished (or cut-off) beam.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamHypothesis {
    /// Prompt followed by the generated tokens.
    pub tokens: Vec<TokenId>,
    /// Sum of log-probabilities normalised by length.
    pub score: f32,
    /// Generated tokens, prompt excluded.
    pub generated_length: usize,
}

/// The best `num_beams` hypotheses seen so far.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f32,
    beams: Vec<BeamHypothesis>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self {
            num_beams,
            length_penalty,
            beams: Vec::with_capacity(num_beams + 1),
            worst_score: 1e9,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    fn normalise(&self, sum_log_probs: f32, length: usize) -> f32 {
        sum_log_probs / (length as f32).powf(self.length_penalty)
    }

    /// Offer a hypothesis; it is kept if there is room or it beats the
    /// current worst.
    pub fn add(&mut self, tokens: Vec<TokenId>, sum_log_probs: f32, generated_length: usize) {
        let score = self.normalise(sum_log_probs, generated_length);
        if self.beams.len() >= self.num_beams && score <= self.worst_score {
            return;
        }
        self.beams.push(BeamHypothesis {
            tokens,
            score,
            generated_length,
        });
        if self.beams.len() > self.num_beams {
            let worst = self
                .beams
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.score.total_cmp(&b.1.score))
                .map(|(i, _)| i);
            if let Some(worst) = worst {
                self.beams.remove(worst);
            }
            self.worst_score = self
                .beams
                .iter()
                .map(|h| h.score)
                .min_by(f32::total_cmp)
                .unwrap_or(1e9);
        } else {
            self.worst_score = self.worst_score.min(score);
        }
    }

    /// No live beam can still beat the worst kept hypothesis.
    pub fn is_done(&self, best_sum_log_probs: f32, current_length: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        self.worst_score >= self.normalise(best_sum_log_probs, current_length)
    }

    /// Best first.
    pub fn into_sorted(mut self) -> Vec<BeamHypothesis> {
        self.beams.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.beams
    }
}

// ── Candidates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Candidate {
    row: usize,
    token: TokenId,
    score: f32,
}

/// State only the last stage keeps.
struct Scorer {
    scores: Vec<f32>,
    hypotheses: BeamHypotheses,
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct BeamSearchDecoder<'a, M: ?Sized, L: ?Sized> {
    model: &'a mut M,
    link: &'a mut L,
    tokenizer: &'a dyn Tokenizer,
    mask_builder: Box<dyn MaskBuilder + 'a>,
    pipeline: PipelineConfig,
    config: BeamConfig,
}

impl<'a, M, L> BeamSearchDecoder<'a, M, L>
where
    M: Model + ?Sized,
    L: PipelineLink + ?Sized,
{
    pub fn new(
        model: &'a mut M,
        link: &'a mut L,
        tokenizer: &'a dyn Tokenizer,
        pipeline: PipelineConfig,
        config: BeamConfig,
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

    /// Search continuations of `prompt` up to `max_sequence_length` tokens.
    ///
    /// Returns the best `num_return_sequences` hypotheses, best first, on the
    /// first stage and `None` elsewhere.
    pub fn search(&mut self, prompt: &[TokenId], max_sequence_length: usize) -> Result<Option<Vec<BeamHypothesis>>> {
        let stage = self.link.stage().clone();

        // ── 1. Validate ──────────────────────────────────────────────────
        self.config
            .validate()
            .map_err(|e| PipelineError::Precondition(e.to_string()))?;
        if prompt.is_empty() {
            return Err(PipelineError::Precondition("empty prompt".into()));
        }
        let beam = self.config.beam_size;
        let final_len = max_sequence_length.min(self.pipeline.max_position_embeddings);
        let prompt_len = prompt.len();
        if prompt_len >= final_len {
            return Err(PipelineError::Precondition(format!(
                "prompt of {prompt_len} tokens leaves no room under {final_len}"
            )));
        }
        check_limits(beam, final_len, &self.pipeline)?;

        let call_id = Uuid::new_v4();
        info!(call_id = %call_id, stage = stage.rank, beam, prompt_len, final_len, "beam search started");

        // ── 2. Set up buffers ────────────────────────────────────────────
        let mut tokens = Tensor::<TokenId>::zeros(&[beam, final_len]);
        for b in 0..beam {
            tokens.row_mut(b)[..prompt_len].copy_from_slice(prompt);
        }
        let (mask, positions) = self.mask_builder.build(&tokens)?;
        let mut dispatcher = ForwardStepDispatcher::new(stage.clone(), self.pipeline.clone(), false);
        let mut state = DecodeState::new(beam, final_len, SamplingConfig::greedy(), &EarlyExitConfig::default());
        let ids: Vec<RequestId> = (0..beam as RequestId).collect();
        let stop = self.config.stop_token.unwrap_or_else(|| self.tokenizer.eod_token_id());
        let mut scorer = stage.is_last().then(|| Scorer {
            scores: vec![0.0; beam],
            hypotheses: BeamHypotheses::new(beam, self.config.length_penalty),
        });

        // ── 3. Decode ────────────────────────────────────────────────────
        let mut last_forwarded = 0;
        let mut done = false;
        let mut ctx = prompt_len;
        while ctx < final_len {
            let window = ctx - last_forwarded;
            let window_tokens = tokens.narrow(1, last_forwarded, window)?;
            let window_positions = positions.narrow(1, last_forwarded, window)?;
            let window_mask = mask.narrow(2, last_forwarded, window)?.narrow(3, 0, ctx)?;
            let input = StepInput {
                tokens: &window_tokens,
                positions: &window_positions,
                attention_mask: &window_mask,
                request_ids: &ids,
            };
            let out = dispatcher.forward(&mut *self.model, &mut *self.link, &mut state, input)?;

            let mut picked = None;
            if let (Some(logits), Some(scorer)) = (out.logits.as_ref(), scorer.as_mut()) {
                let first_step = ctx == prompt_len;
                let candidates = self.rank_candidates(logits, &tokens, &scorer.scores, ctx, first_step);
                let next = self.select(candidates, &tokens, scorer, ctx, prompt_len, stop)?;
                let best = next.iter().map(|c| c.score).fold(f32::NEG_INFINITY, f32::max);
                let finished = scorer.hypotheses.is_done(best, ctx + 1 - prompt_len);

                let rows: Vec<usize> = next.iter().map(|c| c.row).collect();
                let mut reordered = tokens.index_select(0, &rows)?;
                for (b, c) in next.iter().enumerate() {
                    reordered.row_mut(b)[ctx] = c.token;
                }
                scorer.scores = next.iter().map(|c| c.score).collect();
                picked = Some((finished, reordered, rows));
            }

            let finished = picked.as_ref().map(|(f, _, _)| Payload::from(Tensor::<u8>::scalar(u8::from(*f))));
            let finished = self.link.broadcast_from_last(&[1], TensorDtype::U8, finished)?;
            if finished.into_u8().map_err(PipelineError::protocol)?.data()[0] != 0 {
                done = true;
                debug!(call_id = %call_id, ctx, "beam search converged");
                break;
            }

            let (new_tokens, rows) = match picked {
                Some((_, t, r)) => (Some(Payload::from(t)), Some(r)),
                None => (None, None),
            };
            if let Some(received) = self
                .link
                .broadcast_from_last_to_first(&[beam, final_len], TensorDtype::I64, new_tokens)?
            {
                tokens = received.into_i64().map_err(PipelineError::protocol)?;
            }
            let rows = rows
                .map(|r| Tensor::from_vec(&[beam], r.into_iter().map(|i| i as i64).collect()))
                .transpose()?
                .map(Payload::from);
            let rows = self.link.broadcast_from_last(&[beam], TensorDtype::I64, rows)?;
            let rows = rows.into_i64().map_err(PipelineError::protocol)?;
            let rows: Vec<usize> = rows.data().iter().map(|&r| r as usize).collect();
            state.reorder_rows(&rows)?;

            if !out.offset_advanced {
                state.advance(window)?;
            }
            last_forwarded = ctx;
            state.is_first_step = false;
            ctx += 1;
        }

        // ── 4. Collect ───────────────────────────────────────────────────
        let returned = match scorer {
            Some(mut scorer) => {
                if !done {
                    let end = final_len;
                    for b in 0..beam {
                        scorer
                            .hypotheses
                            .add(tokens.row(b)[..end].to_vec(), scorer.scores[b], end - prompt_len);
                    }
                }
                let mut best = scorer.hypotheses.into_sorted();
                best.truncate(self.config.num_return_sequences);
                Some(best)
            }
            None => None,
        };
        let result = self.share_result(returned)?;

        info!(call_id = %call_id, stage = stage.rank, converged = done, "beam search finished");
        Ok(result)
    }

    /// Top `2 × beam` continuations by cumulative log-probability. On the
    /// first step every row holds the same prompt, so only row 0 counts.
    fn rank_candidates(
        &self,
        logits: &Tensor<f32>,
        tokens: &Tensor<TokenId>,
        scores: &[f32],
        ctx: usize,
        first_step: bool,
    ) -> Vec<Candidate> {
        let (len, padded_vocab) = (logits.dim(1), logits.dim(2));
        let vocab = self.tokenizer.vocab_size().min(padded_vocab);
        let rows = if first_step { 1 } else { scores.len() };
        let colon_newline = self
            .config
            .prevent_newline_after_colon
            .then(|| self.tokenizer.single_token(":").zip(self.tokenizer.single_token("\n")))
            .flatten();

        let mut candidates = Vec::with_capacity(rows * vocab);
        for row in 0..rows {
            let offset = (len - 1) * padded_vocab;
            let mut last = logits.row(row)[offset..offset + vocab].to_vec();
            if let Some((colon, newline)) = colon_newline {
                suppress_newline_after_colon(&mut last, tokens.row(row)[ctx - 1], colon, newline);
            }
            let lp = log_softmax(&last);
            candidates.extend(lp.into_iter().enumerate().map(|(t, l)| Candidate {
                row,
                token: t as TokenId,
                score: l + scores[row],
            }));
        }
        // Stable: ties keep row-major order.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(2 * scores.len());
        candidates
    }

    /// Split ranked candidates into finished hypotheses and the next beam.
    fn select(
        &self,
        candidates: Vec<Candidate>,
        tokens: &Tensor<TokenId>,
        scorer: &mut Scorer,
        ctx: usize,
        prompt_len: usize,
        stop: TokenId,
    ) -> Result<Vec<Candidate>> {
        let beam = scorer.scores.len();
        let mut next = Vec::with_capacity(beam);
        for (rank, candidate) in candidates.into_iter().enumerate() {
            if candidate.token == stop {
                // A stop outside the top `beam` is not a real contender.
                if rank >= beam {
                    continue;
                }
                let mut finished = tokens.row(candidate.row)[..ctx].to_vec();
                finished.push(stop);
                scorer.hypotheses.add(finished, candidate.score, ctx + 1 - prompt_len);
            } else {
                next.push(candidate);
            }
            if next.len() == beam {
                break;
            }
        }
        if next.len() < beam {
            return Err(PipelineError::Invariant(format!(
                "only {} live continuations for a beam of {beam}",
                next.len()
            )));
        }
        Ok(next)
    }

    /// Ship the returned hypotheses from the last stage to the first.
    fn share_result(&mut self, local: Option<Vec<BeamHypothesis>>) -> Result<Option<Vec<BeamHypothesis>>> {
        let stage = self.link.stage().clone();

        let dims = local.as_ref().map(|best| {
            let longest = best.iter().map(|h| h.tokens.len()).max().unwrap_or(0);
            Tensor::from_vec(&[2], vec![best.len() as i64, longest as i64])
        });
        let dims = dims.transpose()?.map(Payload::from);
        let dims = self.link.broadcast_from_last(&[2], TensorDtype::I64, dims)?;
        let dims = dims.into_i64().map_err(PipelineError::protocol)?;
        let (n, longest) = (dims.data()[0] as usize, dims.data()[1] as usize);

        let (scores, tokens, lengths) = match &local {
            Some(best) => {
                let scores = Tensor::from_vec(&[n], best.iter().map(|h| h.score).collect())?;
                let mut tokens = Tensor::<TokenId>::zeros(&[n, longest]);
                for (i, h) in best.iter().enumerate() {
                    tokens.row_mut(i)[..h.tokens.len()].copy_from_slice(&h.tokens);
                }
                let lengths = Tensor::from_vec(
                    &[n, 2],
                    best.iter()
                        .flat_map(|h| [h.tokens.len() as i64, h.generated_length as i64])
                        .collect(),
                )?;
                (
                    Some(Payload::from(scores)),
                    Some(Payload::from(tokens)),
                    Some(Payload::from(lengths)),
                )
            }
            None => (None, None, None),
        };
        let scores = self.link.broadcast_from_last_to_first(&[n], TensorDtype::F32, scores)?;
        let tokens = self
            .link
            .broadcast_from_last_to_first(&[n, longest], TensorDtype::I64, tokens)?;
        let lengths = self.link.broadcast_from_last_to_first(&[n, 2], TensorDtype::I64, lengths)?;

        if !stage.is_first() {
            return Ok(None);
        }
        if stage.is_last() {
            return Ok(local);
        }
        let (Some(scores), Some(tokens), Some(lengths)) = (scores, tokens, lengths) else {
            return Err(PipelineError::Protocol("beam result missing on the first stage".into()));
        };
        let scores = scores.into_f32().map_err(PipelineError::protocol)?;
        let tokens = tokens.into_i64().map_err(PipelineError::protocol)?;
        let lengths = lengths.into_i64().map_err(PipelineError::protocol)?;
        let best = (0..n)
            .map(|i| {
                let len = lengths.row(i)[0] as usize;
                BeamHypothesis {
                    tokens: tokens.row(i)[..len].to_vec(),
                    score: scores.data()[i],
                    generated_length: lengths.row(i)[1] as usize,
                }
            })
            .collect();
        Ok(Some(best))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::thread;

    use cascade_types::config::GenerationConfig;
    use cascade_types::PipelineStage;

    use super::*;
    use crate::generation::GenerationController;
    use crate::link::local_pipeline;
    use crate::planner::plan_stages;
    use crate::request::{Batch, BufferedRequests};
    use crate::test_support::{ExitAt, ToyModel, ToyTokenizer, EOD, HIDDEN};

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            hidden_size: HIDDEN,
            max_position_embeddings: 32,
            max_tokens_budget: 256,
            pipelining_batch_x_seqlen_threshold: 4,
            micro_batch_size: None,
        }
    }

    fn beam_config(beam_size: usize, num_return_sequences: usize) -> BeamConfig {
        BeamConfig {
            beam_size,
            num_return_sequences,
            ..BeamConfig::default()
        }
    }

    fn search_on(n: u32, prompt: Vec<TokenId>, max_seq: usize, config: BeamConfig) -> Vec<Option<Vec<BeamHypothesis>>> {
        let stages = plan_stages(n * 2, n, &[]).unwrap();
        let handles: Vec<_> = local_pipeline(&stages)
            .into_iter()
            .map(|mut link| {
                let prompt = prompt.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let mut model = ToyModel::new(link.stage().clone(), ExitAt::Never);
                    let tokenizer = ToyTokenizer;
                    let mut decoder =
                        BeamSearchDecoder::new(&mut model, &mut link, &tokenizer, pipeline_config(), config);
                    decoder.search(&prompt, max_seq).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn hypotheses_keep_the_best_n() {
        let mut h = BeamHypotheses::new(2, 1.0);
        h.add(vec![1], -4.0, 2);
        h.add(vec![2], -1.0, 1);
        assert_eq!(h.len(), 2);
        // -3.0 / 1 is worse than both kept scores (-2.0, -1.0).
        h.add(vec![3], -3.0, 1);
        assert_eq!(h.len(), 2);
        h.add(vec![4], -0.5, 1);
        let sorted = h.into_sorted();
        assert_eq!(sorted.iter().map(|b| b.tokens[0]).collect::<Vec<_>>(), vec![4, 2]);
    }

    #[test]
    fn done_once_full_and_unbeatable() {
        let mut h = BeamHypotheses::new(1, 1.0);
        assert!(!h.is_done(-1.0, 1));
        h.add(vec![1], -2.0, 2);
        assert!(h.is_done(-4.0, 2));
        assert!(!h.is_done(-1.0, 2));
    }

    #[test]
    fn length_penalty_favours_longer_hypotheses() {
        let mut h = BeamHypotheses::new(1, 2.0);
        h.add(vec![1], -2.0, 1);
        h.add(vec![1, 2], -3.0, 2);
        assert_eq!(h.into_sorted()[0].generated_length, 2);
    }

    #[test]
    fn beam_of_one_matches_greedy() {
        let prompt = vec![10];
        let results = search_on(1, prompt.clone(), 10, beam_config(1, 1));
        let best = &results[0].as_ref().unwrap()[0];

        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let mut link = local_pipeline(&plan_stages(2, 1, &[]).unwrap()).pop().unwrap();
        let tokenizer = ToyTokenizer;
        let config = GenerationConfig {
            echo_prompts: true,
            return_output_log_probs: true,
            ..GenerationConfig::default()
        };
        let mut controller = GenerationController::new(&mut model, &mut link, &tokenizer, pipeline_config(), config);
        let batch = Batch::from_prompts(vec![(1, prompt)], 10, 0).unwrap();
        let greedy = controller.generate(batch, BufferedRequests::new()).unwrap().unwrap();
        let seq = &greedy.sequences[0];

        assert_eq!(best.tokens, seq.tokens);
        assert_eq!(best.tokens.last(), Some(&EOD));
        let generated = best.generated_length;
        let sum: f32 = seq.log_probs.as_ref().unwrap()[seq.length - 1 - generated..].iter().sum();
        assert!((best.score - sum / generated as f32).abs() < 1e-4);
    }

    #[test]
    fn stages_agree_with_single_stage() {
        let config = beam_config(2, 2);
        let single = search_on(1, vec![3, 4], 9, config.clone());
        let piped = search_on(3, vec![3, 4], 9, config);
        assert!(piped[1].is_none() && piped[2].is_none());
        assert_eq!(piped[0], single[0]);
        assert_eq!(single[0].as_ref().unwrap().len(), 2);
    }

    #[test]
    fn runs_to_max_length_without_a_stop() {
        // Stop token 14 is never reached from prompt 0 within 4 tokens.
        let config = BeamConfig {
            stop_token: Some(14),
            ..beam_config(2, 1)
        };
        let results = search_on(1, vec![0], 4, config);
        let best = &results[0].as_ref().unwrap()[0];
        assert_eq!(best.tokens, vec![0, 1, 2, 3]);
        assert_eq!(best.generated_length, 3);
    }

    #[test]
    fn rejects_prompt_filling_the_buffer() {
        let mut model = ToyModel::new(PipelineStage::single(2), ExitAt::Never);
        let mut link = local_pipeline(&plan_stages(2, 1, &[]).unwrap()).pop().unwrap();
        let tokenizer = ToyTokenizer;
        let mut decoder =
            BeamSearchDecoder::new(&mut model, &mut link, &tokenizer, pipeline_config(), beam_config(2, 1));
        let err = decoder.search(&[1, 2, 3], 3).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        // Capped by the model's position limit.
        let err = decoder.search(&[1; 32], 64).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }
}
