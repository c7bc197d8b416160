//! Deterministic stand-ins for the model and tokenizer.
//!
//! `ToyModel` predicts `token + 1` (mod `VOCAB`) with a clear margin over
//! `token + 2`, so greedy decoding counts upwards and beam search has a
//! well-defined runner-up. Activations carry the token id in every hidden
//! slot, so any split of the layers produces identical logits.

use std::collections::{HashMap, VecDeque};

use cascade_types::{PipelineStage, RequestId, Tensor, TokenId};

use crate::decode_state::DecodeState;
use crate::error::{PipelineError, Result};
use crate::model::{Model, ModelInput, ModelOutput, Tokenizer};

pub(crate) const HIDDEN: usize = 4;
pub(crate) const VOCAB: usize = 16;
pub(crate) const EOD: TokenId = 15;

/// Which stage fires its exit head in pipelined early-exit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitAt {
    Never,
    /// On every step.
    Stage(u32),
    /// On even-numbered steps only.
    Alternate(u32),
}

pub(crate) fn successor(token: TokenId) -> TokenId {
    (token + 1).rem_euclid(VOCAB as TokenId)
}

fn logits_for(token: TokenId) -> [f32; VOCAB] {
    let mut row = [0.0; VOCAB];
    row[successor(token) as usize] = 8.0;
    row[(token + 2).rem_euclid(VOCAB as TokenId) as usize] = 4.0;
    row
}

pub(crate) struct ToyModel {
    stage: PipelineStage,
    exit_at: ExitAt,
    /// Per-step exit subsets for a non-pipelined model.
    scripted_exits: VecDeque<Option<Vec<RequestId>>>,
    last_seen: HashMap<RequestId, TokenId>,
    calls: usize,
}

impl ToyModel {
    pub(crate) fn new(stage: PipelineStage, exit_at: ExitAt) -> Self {
        Self {
            stage,
            exit_at,
            scripted_exits: VecDeque::new(),
            last_seen: HashMap::new(),
            calls: 0,
        }
    }

    /// Report these exit subsets on successive calls, then none.
    pub(crate) fn with_scripted_exits(mut self, exits: Vec<Option<Vec<RequestId>>>) -> Self {
        self.scripted_exits = exits.into();
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls
    }

    fn exits_now(&self, state: &DecodeState) -> bool {
        if state.prev_has_early_exited {
            return false;
        }
        match self.exit_at {
            ExitAt::Never => false,
            ExitAt::Stage(rank) => rank == self.stage.rank,
            ExitAt::Alternate(rank) => rank == self.stage.rank && self.calls % 2 == 0,
        }
    }

    /// Token held by each `[window, batch]` slot of the incoming data.
    fn read_tokens(&self, input: &ModelInput<'_>) -> Result<Vec<Vec<TokenId>>> {
        let (batch, window) = (input.tokens.dim(0), input.tokens.dim(1));
        match input.activations {
            None => Ok((0..batch).map(|b| input.tokens.row(b).to_vec()).collect()),
            Some(act) => {
                act.check_shape(&[window, batch, HIDDEN])
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                Ok((0..batch)
                    .map(|b| (0..window).map(|s| act.data()[(s * batch + b) * HIDDEN] as TokenId).collect())
                    .collect())
            }
        }
    }

    fn write_cache(&self, state: &mut DecodeState, rows: &[Vec<TokenId>]) -> Result<()> {
        let offset = state.sequence_len_offset();
        let row_offset = state.batch_size_offset();
        let window = rows.first().map_or(0, Vec::len);
        if offset + window > state.max_sequence_length() {
            return Err(PipelineError::Model(format!(
                "cache write at {offset} + {window} overflows {}",
                state.max_sequence_length()
            )));
        }
        let batch = state.batch_size();
        for layer in self.stage.layer_range.start..=self.stage.layer_range.end {
            let cache = state.layer_cache(layer as usize, 1, 1);
            for (b, row) in rows.iter().enumerate() {
                for (s, &token) in row.iter().enumerate() {
                    cache.key.data_mut()[(offset + s) * batch + row_offset + b] = token as f32;
                }
            }
        }
        Ok(())
    }
}

fn logits_tensor(rows: &[Vec<TokenId>]) -> Result<Tensor<f32>> {
    let window = rows.first().map_or(0, Vec::len);
    let data: Vec<f32> = rows.iter().flatten().flat_map(|&t| logits_for(t)).collect();
    Ok(Tensor::from_vec(&[rows.len(), window, VOCAB], data)?)
}

fn activation_tensor(rows: &[Vec<TokenId>]) -> Result<Tensor<f32>> {
    let batch = rows.len();
    let window = rows.first().map_or(0, Vec::len);
    let mut act = Tensor::zeros(&[window, batch, HIDDEN]);
    for (b, row) in rows.iter().enumerate() {
        for (s, &token) in row.iter().enumerate() {
            let base = (s * batch + b) * HIDDEN;
            act.data_mut()[base..base + HIDDEN].fill(token as f32);
        }
    }
    Ok(act)
}

impl Model for ToyModel {
    fn forward(&mut self, input: ModelInput<'_>, state: &mut DecodeState) -> Result<ModelOutput> {
        let rows = self.read_tokens(&input)?;
        self.write_cache(state, &rows)?;
        for (id, row) in input.request_ids.iter().zip(&rows) {
            if let Some(&last) = row.last() {
                self.last_seen.insert(*id, last);
            }
        }
        let exit_now = self.exits_now(state);
        self.calls += 1;

        if let Some(Some(ids)) = self.scripted_exits.pop_front() {
            state.has_early_exited = true;
            let answered: Vec<Vec<TokenId>> = ids
                .iter()
                .map(|id| vec![self.last_seen.get(id).copied().unwrap_or_default()])
                .collect();
            return Ok(ModelOutput {
                output: logits_tensor(&answered)?,
                exit_logits: None,
                exited_request_ids: Some(ids),
            });
        }

        let mut out = if self.stage.is_last() {
            ModelOutput::new(logits_tensor(&rows)?)
        } else {
            ModelOutput::new(activation_tensor(&rows)?)
        };
        if exit_now && !self.stage.is_last() {
            state.has_early_exited = true;
            out.exit_logits = Some(logits_tensor(&rows)?);
        }
        Ok(out)
    }
}

/// Digits map to 0..=9; `:` `\n` and `.` are single tokens; `.` is end of
/// document.
pub(crate) struct ToyTokenizer;

pub(crate) const COLON: TokenId = 12;
pub(crate) const NEWLINE: TokenId = 13;

impl Tokenizer for ToyTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.chars()
            .map(|c| match c {
                '0'..='9' => c as TokenId - '0' as TokenId,
                ':' => COLON,
                '\n' => NEWLINE,
                '.' => EOD,
                _ => 14,
            })
            .collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        tokens
            .iter()
            .map(|&t| match t {
                0..=9 => char::from(b'0' + t as u8),
                COLON => ':',
                NEWLINE => '\n',
                EOD => '.',
                _ => '?',
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn eod_token_id(&self) -> TokenId {
        EOD
    }
}
