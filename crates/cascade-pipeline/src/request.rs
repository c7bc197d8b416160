//! Per-request token buffers and the batch that groups them.
//!
//! Rows are identified by `request_id`, never by position: under early exit
//! the active batch is reordered and rows leave for (and return from) the
//! caller-owned [`BufferedRequests`].

use std::collections::HashMap;

use cascade_types::{RequestId, Tensor, TokenId};

use crate::error::{PipelineError, Result};

/// Requests held out of the active batch, keyed by id. Owned by the caller
/// and carried across calls.
pub type BufferedRequests = HashMap<RequestId, Request>;

// ── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: RequestId,
    pub prompt_length: usize,
    /// Fixed capacity; positions at and past `cursor` hold padding.
    tokens: Vec<TokenId>,
    /// `log_probs[i]` is the log-probability of `tokens[i + 1]`.
    log_probs: Vec<f32>,
    /// Number of valid tokens.
    cursor: usize,
    /// Total length once a stop token was emitted.
    pub generated_length: Option<usize>,
}

impl Request {
    /// Fails if the prompt is empty or does not fit in `capacity`.
    pub fn new(request_id: RequestId, prompt: &[TokenId], capacity: usize, pad: TokenId) -> Result<Self> {
        if prompt.is_empty() {
            return Err(PipelineError::Precondition(format!(
                "request {request_id} has an empty prompt"
            )));
        }
        if prompt.len() > capacity {
            return Err(PipelineError::Precondition(format!(
                "request {request_id}: prompt of {} tokens exceeds max sequence length {capacity}",
                prompt.len()
            )));
        }
        let mut tokens = vec![pad; capacity];
        tokens[..prompt.len()].copy_from_slice(prompt);
        Ok(Self {
            request_id,
            prompt_length: prompt.len(),
            tokens,
            log_probs: vec![0.0; capacity.saturating_sub(1)],
            cursor: prompt.len(),
            generated_length: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Valid tokens so far, prompt included.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens[..self.cursor]
    }

    /// Token at `position`, padding included.
    pub fn token_at(&self, position: usize) -> TokenId {
        self.tokens.get(position).copied().unwrap_or_default()
    }

    /// Last valid token.
    pub fn last_token(&self) -> TokenId {
        self.tokens[self.cursor.saturating_sub(1)]
    }

    /// The request has generated past its prompt by step `context_length`.
    pub fn is_started(&self, context_length: usize) -> bool {
        self.prompt_length <= context_length
    }

    pub fn is_done(&self) -> bool {
        self.generated_length.is_some()
    }

    /// Append a generated token.
    pub fn push(&mut self, token: TokenId) -> Result<()> {
        let slot = self.tokens.get_mut(self.cursor).ok_or_else(|| {
            PipelineError::Invariant(format!("request {} is already at capacity", self.request_id))
        })?;
        *slot = token;
        self.cursor += 1;
        Ok(())
    }

    pub fn set_log_prob(&mut self, position: usize, value: f32) {
        if let Some(slot) = self.log_probs.get_mut(position) {
            *slot = value;
        }
    }

    /// Total length to report: where it stopped, or how far it got.
    pub fn final_length(&self) -> usize {
        self.generated_length.unwrap_or(self.cursor)
    }

    /// Log-probabilities of tokens `1..=len`.
    pub fn log_probs(&self, len: usize) -> &[f32] {
        &self.log_probs[..len.min(self.log_probs.len())]
    }
}

// ── Generated Sequence ───────────────────────────────────────────────────────

/// One request's result as handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    pub request_id: RequestId,
    /// Prompt and generation when echoing, generation only otherwise.
    pub tokens: Vec<TokenId>,
    /// `tokens.len()`.
    pub length: usize,
    pub log_probs: Option<Vec<f32>>,
}

impl GeneratedSequence {
    pub(crate) fn from_request(request: &Request, echo_prompts: bool, with_log_probs: bool) -> Self {
        let total = request.final_length();
        let buffer = &request.tokens[..total.min(request.capacity())];
        let lp_total = total.saturating_sub(1);
        let log_probs = with_log_probs.then(|| request.log_probs(lp_total).to_vec());

        if echo_prompts {
            return Self {
                request_id: request.request_id,
                tokens: buffer.to_vec(),
                length: buffer.len(),
                log_probs,
            };
        }

        let prompt = request.prompt_length;
        let tokens = strip_prompt(buffer, prompt, total);
        let log_probs = log_probs.map(|lp| strip_prompt(&lp, prompt.saturating_sub(1), lp_total));
        Self {
            request_id: request.request_id,
            length: tokens.len(),
            tokens,
            log_probs,
        }
    }
}

/// Left-rotate `row` by `prompt` and keep the first `total - prompt`
/// entries, i.e. what was produced after the prompt.
pub fn strip_prompt<T: Copy>(row: &[T], prompt: usize, total: usize) -> Vec<T> {
    let mut rotated = row.to_vec();
    if !rotated.is_empty() {
        let shift = prompt % rotated.len();
        rotated.rotate_left(shift);
    }
    rotated.truncate(total.saturating_sub(prompt).min(row.len()));
    rotated
}

// ── Batch ────────────────────────────────────────────────────────────────────

/// The active requests of one call, in tensor row order.
#[derive(Debug, Clone)]
pub struct Batch {
    requests: Vec<Request>,
    max_sequence_length: usize,
    pad: TokenId,
}

impl Batch {
    /// Build a batch from `(request_id, prompt)` pairs.
    pub fn from_prompts(
        prompts: Vec<(RequestId, Vec<TokenId>)>,
        max_sequence_length: usize,
        pad: TokenId,
    ) -> Result<Self> {
        let requests = prompts
            .into_iter()
            .map(|(id, prompt)| Request::new(id, &prompt, max_sequence_length, pad))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            requests,
            max_sequence_length,
            pad,
        })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    pub fn pad_token(&self) -> TokenId {
        self.pad
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut [Request] {
        &mut self.requests
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.request_id).collect()
    }

    pub fn min_prompt_length(&self) -> usize {
        self.requests.iter().map(|r| r.prompt_length).min().unwrap_or(0)
    }

    pub fn max_prompt_length(&self) -> usize {
        self.requests.iter().map(|r| r.prompt_length).max().unwrap_or(0)
    }

    /// Full token buffer, `[batch, len]`, padding included.
    pub fn token_tensor(&self, len: usize) -> Result<Tensor<TokenId>> {
        self.window(0, len)
    }

    /// Tokens at positions `[start, end)` of every row, `[batch, end - start]`.
    pub fn window(&self, start: usize, end: usize) -> Result<Tensor<TokenId>> {
        let data = self
            .requests
            .iter()
            .flat_map(|r| (start..end).map(move |p| r.token_at(p)))
            .collect();
        Ok(Tensor::from_vec(&[self.len(), end - start], data)?)
    }

    /// Token at `position` of every row, `[batch]`.
    pub fn column(&self, position: usize) -> Result<Tensor<TokenId>> {
        self.window(position, position + 1)?
            .reshape(&[self.len()])
            .map_err(Into::into)
    }

    /// Make the active rows exactly `exited`, in that order.
    ///
    /// Rows not in `exited` move into `buffered`. Ids not in the batch are
    /// pulled back out of `buffered`; an id found in neither is an error.
    pub fn reconcile(&mut self, exited: &[RequestId], buffered: &mut BufferedRequests) -> Result<()> {
        let mut current: HashMap<RequestId, Request> =
            self.requests.drain(..).map(|r| (r.request_id, r)).collect();

        let mut next = Vec::with_capacity(exited.len());
        for id in exited {
            let request = current
                .remove(id)
                .or_else(|| buffered.remove(id))
                .ok_or_else(|| PipelineError::Protocol(format!("exited request {id} is unknown")))?;
            next.push(request);
        }
        buffered.extend(current);
        self.requests = next;
        Ok(())
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
