//! A synthetic byte-level model for exercising the pipeline end to end.
//!
//! The "network" walks the alphabet: after `a` comes `b`, after `z` a full
//! stop, after the stop end-of-document. Every other logit gets a small
//! deterministic jitter so sampling has something to choose from. Stages
//! pass the token id through their activations, so any layer split and any
//! exit point yields the same logits.

use cascade_pipeline::{DecodeState, Model, ModelInput, ModelOutput, PipelineError, Result, Tokenizer};
use cascade_types::{PipelineStage, Tensor, TokenId};

pub const EOD: TokenId = 256;
pub const VOCAB: usize = 257;

fn next_byte(token: TokenId) -> TokenId {
    match u8::try_from(token) {
        Ok(b @ b'a'..=b'y') => TokenId::from(b + 1),
        Ok(b'z') => TokenId::from(b'.'),
        Ok(b'.') => EOD,
        Ok(b' ') => TokenId::from(b'a'),
        _ => TokenId::from(b' '),
    }
}

fn logits_for(token: TokenId, out: &mut [f32]) {
    for (c, slot) in out.iter_mut().enumerate() {
        *slot = ((token.unsigned_abs() as usize * 131 + c * 31) % 97) as f32 / 97.0;
    }
    if let Some(slot) = usize::try_from(next_byte(token)).ok().and_then(|i| out.get_mut(i)) {
        *slot = 5.0;
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

pub struct DemoModel {
    stage: PipelineStage,
    hidden_size: usize,
    /// Index among all exit layers of the first one this stage holds.
    exit_index: Option<usize>,
}

impl DemoModel {
    pub fn new(stage: PipelineStage, hidden_size: usize, exit_layers: &[u32]) -> Self {
        let exit_index = exit_layers
            .iter()
            .position(|&l| stage.layer_range.contains(l))
            .filter(|_| stage.has_early_exit_capability);
        Self {
            stage,
            hidden_size: hidden_size.max(1),
            exit_index,
        }
    }

    /// Token per `[batch][window]` slot.
    fn read_tokens(&self, input: &ModelInput<'_>) -> Result<Vec<Vec<TokenId>>> {
        let (batch, window) = (input.tokens.dim(0), input.tokens.dim(1));
        let Some(act) = input.activations else {
            return Ok((0..batch).map(|b| input.tokens.row(b).to_vec()).collect());
        };
        act.check_shape(&[window, batch, self.hidden_size])
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok((0..batch)
            .map(|b| {
                (0..window)
                    .map(|s| act.data()[(s * batch + b) * self.hidden_size] as TokenId)
                    .collect()
            })
            .collect())
    }

    fn logits(rows: &[Vec<TokenId>]) -> Result<Tensor<f32>> {
        let window = rows.first().map_or(0, Vec::len);
        let mut logits = Tensor::zeros(&[rows.len(), window, VOCAB]);
        for (b, row) in rows.iter().enumerate() {
            let out = logits.row_mut(b);
            for (s, &token) in row.iter().enumerate() {
                logits_for(token, &mut out[s * VOCAB..(s + 1) * VOCAB]);
            }
        }
        Ok(logits)
    }

    fn activations(&self, rows: &[Vec<TokenId>]) -> Tensor<f32> {
        let batch = rows.len();
        let window = rows.first().map_or(0, Vec::len);
        let mut act = Tensor::zeros(&[window, batch, self.hidden_size]);
        for (b, row) in rows.iter().enumerate() {
            for (s, &token) in row.iter().enumerate() {
                let base = (s * batch + b) * self.hidden_size;
                act.data_mut()[base..base + self.hidden_size].fill(token as f32);
            }
        }
        act
    }

    /// Confidence of the last position's best token, lowest over the batch.
    fn confidence(logits: &Tensor<f32>) -> f32 {
        let window = logits.dim(1);
        (0..logits.dim(0))
            .map(|b| {
                let row = &logits.row(b)[(window - 1) * VOCAB..];
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = row.iter().map(|l| (l - max).exp()).sum();
                1.0 / sum
            })
            .fold(1.0, f32::min)
    }
}

impl Model for DemoModel {
    fn forward(&mut self, input: ModelInput<'_>, state: &mut DecodeState) -> Result<ModelOutput> {
        let rows = self.read_tokens(&input)?;
        let window = rows.first().map_or(0, Vec::len);
        let (offset, row_offset, batch) = (
            state.sequence_len_offset(),
            state.batch_size_offset(),
            state.batch_size(),
        );
        if offset + window > state.max_sequence_length() {
            return Err(PipelineError::Model(format!(
                "cache write at {offset} + {window} overflows {}",
                state.max_sequence_length()
            )));
        }
        for layer in self.stage.layer_range.start..=self.stage.layer_range.end {
            let cache = state.layer_cache(layer as usize, 1, 1);
            for (b, row) in rows.iter().enumerate() {
                for (s, &token) in row.iter().enumerate() {
                    let slot = (offset + s) * batch + row_offset + b;
                    cache.key.data_mut()[slot] = token as f32;
                    cache.value.data_mut()[slot] = token as f32;
                }
            }
        }

        if self.stage.is_last() {
            return Ok(ModelOutput::new(Self::logits(&rows)?));
        }
        let mut out = ModelOutput::new(self.activations(&rows));
        if let (true, false, Some(index)) = (state.use_early_exit, state.prev_has_early_exited, self.exit_index) {
            let logits = Self::logits(&rows)?;
            let threshold = match state.early_exit_thresholds.as_slice() {
                [single] => *single,
                many => many.get(index).copied().unwrap_or(1.0),
            };
            if window > 0 && Self::confidence(&logits) >= threshold {
                state.has_early_exited = true;
                out.exit_logits = Some(logits);
            }
        }
        Ok(out)
    }
}

// ── Tokenizer ────────────────────────────────────────────────────────────────

/// One token per byte; `EOD` past the byte range.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(TokenId::from).collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens.iter().filter_map(|&t| u8::try_from(t).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn eod_token_id(&self) -> TokenId {
        EOD
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_walk_ends_in_eod() {
        assert_eq!(next_byte(TokenId::from(b'a')), TokenId::from(b'b'));
        assert_eq!(next_byte(TokenId::from(b'z')), TokenId::from(b'.'));
        assert_eq!(next_byte(TokenId::from(b'.')), EOD);
    }

    #[test]
    fn successor_dominates_the_logits() {
        let mut row = vec![0.0; VOCAB];
        logits_for(TokenId::from(b'q'), &mut row);
        let best = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(best, Some(usize::from(b'r')));
    }

    #[test]
    fn bytes_round_trip_through_the_tokenizer() {
        let t = ByteTokenizer;
        let tokens = t.tokenize("ab:");
        assert_eq!(tokens, vec![97, 98, 58]);
        assert_eq!(t.detokenize(&tokens), "ab:");
        assert_eq!(t.single_token(":"), Some(58));
    }
}
