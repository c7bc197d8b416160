//! Capabilities the decode core consumes but does not implement.
//!
//! The forward computation, the tokenizer and the attention-mask builder are
//! supplied by the embedding application. Each pipeline stage owns its own
//! `Model` holding only that stage's layers.

use cascade_types::{RequestId, Tensor, TokenId};

use crate::decode_state::DecodeState;
use crate::error::Result;

// ── Model ────────────────────────────────────────────────────────────────────

/// Inputs to one forward evaluation over a token window.
#[derive(Debug)]
pub struct ModelInput<'a> {
    /// `[batch, window]`
    pub tokens: &'a Tensor<TokenId>,
    /// `[batch, window]`
    pub positions: &'a Tensor<i64>,
    /// `[1, 1, window, context]`, nonzero = masked out.
    pub attention_mask: &'a Tensor<u8>,
    /// Identity of each row in `tokens`.
    pub request_ids: &'a [RequestId],
    /// Activations received from the previous stage, `[window, batch, hidden]`.
    /// `None` on the first stage.
    pub activations: Option<&'a Tensor<f32>>,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[window, batch, hidden]` activations on every stage but the last,
    /// `[batch, window, vocab]` logits on the last.
    pub output: Tensor<f32>,
    /// `[batch, window, vocab]` logits from an exit head that fired on this
    /// stage. Setting this implies `DecodeState::has_early_exited`.
    pub exit_logits: Option<Tensor<f32>>,
    /// Requests answered by this step, in logits row order. Only a
    /// non-pipelined model may report a subset; `None` means every row.
    pub exited_request_ids: Option<Vec<RequestId>>,
}

impl ModelOutput {
    pub fn new(output: Tensor<f32>) -> Self {
        Self {
            output,
            exit_logits: None,
            exited_request_ids: None,
        }
    }
}

/// The slice of the network held by one stage.
///
/// Implementations must write new cache entries at
/// `state.sequence_len_offset()` and must not resize the cache.
pub trait Model {
    fn forward(&mut self, input: ModelInput<'_>, state: &mut DecodeState) -> Result<ModelOutput>;
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn forward(&mut self, input: ModelInput<'_>, state: &mut DecodeState) -> Result<ModelOutput> {
        (**self).forward(input, state)
    }
}

// ── Tokenizer ────────────────────────────────────────────────────────────────

pub trait Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId>;
    /// Only used for diagnostics.
    fn detokenize(&self, tokens: &[TokenId]) -> String;
    fn vocab_size(&self) -> usize;
    fn eod_token_id(&self) -> TokenId;

    /// First token of `text`, if it tokenizes to anything.
    fn single_token(&self, text: &str) -> Option<TokenId> {
        self.tokenize(text).first().copied()
    }
}

// ── Attention Mask ───────────────────────────────────────────────────────────

/// Builds the attention mask and position ids for a full token buffer once
/// per call. The decode loop slices windows out of the result.
pub trait MaskBuilder {
    /// `tokens` is `[batch, len]`. Returns a `[1, 1, len, len]` mask and
    /// `[batch, len]` positions.
    fn build(&self, tokens: &Tensor<TokenId>) -> Result<(Tensor<u8>, Tensor<i64>)>;
}

/// Lower-triangular causal mask with positions `0..len` on every row and no
/// end-of-document resets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CausalMaskBuilder;

impl MaskBuilder for CausalMaskBuilder {
    fn build(&self, tokens: &Tensor<TokenId>) -> Result<(Tensor<u8>, Tensor<i64>)> {
        let batch = tokens.dim(0);
        let len = tokens.dim(1);

        let mut mask = Tensor::<u8>::zeros(&[1, 1, len, len]);
        for (i, row) in mask.data_mut().chunks_mut(len.max(1)).enumerate() {
            for slot in row.iter_mut().skip(i + 1) {
                *slot = 1;
            }
        }

        let positions: Vec<i64> = (0..batch).flat_map(|_| 0..len as i64).collect();
        let positions = Tensor::from_vec(&[batch, len], positions)?;
        Ok((mask, positions))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
