//! Call-scoped decode state: cache offsets, the per-layer key/value cache,
//! early-exit signals and the live sampling configuration.
//!
//! One `DecodeState` exists per stage per generation call. It is threaded by
//! `&mut` through the dispatcher into the model and never crosses a stage
//! boundary.

use std::collections::{BTreeMap, HashMap};

use cascade_types::config::{EarlyExitConfig, SamplingConfig};
use cascade_types::{RequestId, Tensor};

use crate::error::{PipelineError, Result};

// ── Cache ────────────────────────────────────────────────────────────────────

/// Key/value storage for one layer, both `[max_seq, batch, heads, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCache {
    pub key: Tensor<f32>,
    pub value: Tensor<f32>,
}

impl LayerCache {
    fn new(max_sequence_length: usize, batch_size: usize, heads: usize, head_dim: usize) -> Self {
        let shape = [max_sequence_length, batch_size, heads, head_dim];
        Self {
            key: Tensor::zeros(&shape),
            value: Tensor::zeros(&shape),
        }
    }

    /// Gather batch rows in `indices` order, zero-filling up to capacity.
    fn reorder(&mut self, indices: &[usize]) -> Result<()> {
        self.key = select_rows(&self.key, indices)?;
        self.value = select_rows(&self.value, indices)?;
        Ok(())
    }
}

fn select_rows(t: &Tensor<f32>, indices: &[usize]) -> Result<Tensor<f32>> {
    let picked = t.index_select(1, indices)?;
    if indices.len() == t.dim(1) {
        return Ok(picked);
    }
    let mut full = Tensor::zeros(t.shape());
    full.write_narrow(1, 0, &picked)?;
    Ok(full)
}

/// One batch row's slice of every layer, set aside while its request is out
/// of the active batch.
#[derive(Debug, Clone)]
struct StashedRow {
    layers: BTreeMap<usize, LayerCache>,
}

// ── Decode State ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DecodeState {
    batch_size: usize,
    max_sequence_length: usize,
    sequence_len_offset: usize,
    batch_size_offset: usize,
    cache: BTreeMap<usize, LayerCache>,
    stashed: HashMap<RequestId, StashedRow>,
    sampling: SamplingConfig,

    pub use_early_exit: bool,
    pub early_exit_thresholds: Vec<f32>,
    /// An exit head on this stage fired during the current step.
    pub has_early_exited: bool,
    /// An upstream stage reported an exit for the current step.
    pub prev_has_early_exited: bool,
    pub is_first_step: bool,
}

impl DecodeState {
    pub fn new(
        batch_size: usize,
        max_sequence_length: usize,
        sampling: SamplingConfig,
        early_exit: &EarlyExitConfig,
    ) -> Self {
        Self {
            batch_size,
            max_sequence_length,
            sequence_len_offset: 0,
            batch_size_offset: 0,
            cache: BTreeMap::new(),
            stashed: HashMap::new(),
            sampling,
            use_early_exit: early_exit.use_early_exit,
            early_exit_thresholds: early_exit.early_exit_thresholds.clone(),
            has_early_exited: false,
            prev_has_early_exited: false,
            is_first_step: true,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    /// Tokens already folded into the cache; the model writes here next.
    pub fn sequence_len_offset(&self) -> usize {
        self.sequence_len_offset
    }

    /// First batch row of the micro-batch currently being forwarded.
    pub fn batch_size_offset(&self) -> usize {
        self.batch_size_offset
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Record that `n_tokens` new positions were just forwarded.
    pub fn advance(&mut self, n_tokens: usize) -> Result<()> {
        let next = self.sequence_len_offset + n_tokens;
        if next > self.max_sequence_length {
            return Err(PipelineError::Invariant(format!(
                "sequence_len_offset {} + {n_tokens} exceeds capacity {}",
                self.sequence_len_offset, self.max_sequence_length
            )));
        }
        self.sequence_len_offset = next;
        Ok(())
    }

    pub(crate) fn advance_batch_offset(&mut self, rows: usize) {
        self.batch_size_offset += rows;
    }

    pub(crate) fn reset_batch_offset(&mut self) {
        self.batch_size_offset = 0;
    }

    /// Reset both exit signals before a forward invocation.
    pub fn clear_early_exit_signals(&mut self) {
        self.has_early_exited = false;
        self.prev_has_early_exited = false;
    }

    /// True if this step's answer came from an exit head, here or upstream.
    pub fn early_exited(&self) -> bool {
        self.has_early_exited || self.prev_has_early_exited
    }

    /// Shrink `top_p` by `top_p_decay`, never below `top_p_bound`.
    pub fn decay_top_p(&mut self) {
        let s = &mut self.sampling;
        if s.top_p > 0.0 && s.top_p_decay > 0.0 {
            s.top_p *= s.top_p_decay;
            if s.top_p_bound > 0.0 {
                s.top_p = s.top_p.max(s.top_p_bound);
            }
        }
    }

    // ── Cache ────────────────────────────────────────────────────────────

    /// Cache for `layer`, allocated on first use.
    pub fn layer_cache(&mut self, layer: usize, heads: usize, head_dim: usize) -> &mut LayerCache {
        let (max_seq, batch) = (self.max_sequence_length, self.batch_size);
        self.cache
            .entry(layer)
            .or_insert_with(|| LayerCache::new(max_seq, batch, heads, head_dim))
    }

    pub fn allocated_layers(&self) -> usize {
        self.cache.len()
    }

    /// Permute every layer's cache rows: new row `i` takes old row
    /// `indices[i]`. Indices may repeat. Rows past `indices.len()` are zeroed.
    pub fn reorder_rows(&mut self, indices: &[usize]) -> Result<()> {
        if indices.len() > self.batch_size {
            return Err(PipelineError::Invariant(format!(
                "{} rows requested from a batch of {}",
                indices.len(),
                self.batch_size
            )));
        }
        for cache in self.cache.values_mut() {
            cache.reorder(indices)?;
        }
        Ok(())
    }

    /// Move cache rows to follow a change of active requests.
    ///
    /// Rows whose request left the batch are stashed by request id. Rows
    /// for requests that rejoined are restored from the stash, or start
    /// zeroed if this state never held them.
    pub fn reconcile_rows(&mut self, previous: &[RequestId], next: &[RequestId]) -> Result<()> {
        if next.len() > self.batch_size {
            return Err(PipelineError::Invariant(format!(
                "{} active requests exceed batch capacity {}",
                next.len(),
                self.batch_size
            )));
        }
        if self.cache.is_empty() {
            return Ok(());
        }

        for (row, id) in previous.iter().enumerate() {
            if !next.contains(id) {
                let layers = self
                    .cache
                    .iter()
                    .map(|(&layer, cache)| Ok((layer, extract_row(cache, row)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                self.stashed.insert(*id, StashedRow { layers });
            }
        }

        let sources: Vec<Option<usize>> = next
            .iter()
            .map(|id| previous.iter().position(|p| p == id))
            .collect();
        let gather: Vec<usize> = sources.iter().map(|s| s.unwrap_or(0)).collect();
        self.reorder_rows(&gather)?;

        for (row, (id, source)) in next.iter().zip(&sources).enumerate() {
            if source.is_some() {
                continue;
            }
            let stashed = self.stashed.remove(id);
            for (layer, cache) in self.cache.iter_mut() {
                let restored = stashed.as_ref().and_then(|s| s.layers.get(layer));
                insert_row(cache, row, restored)?;
            }
        }
        Ok(())
    }
}

fn extract_row(cache: &LayerCache, row: usize) -> Result<LayerCache> {
    Ok(LayerCache {
        key: cache.key.narrow(1, row, 1)?,
        value: cache.value.narrow(1, row, 1)?,
    })
}

fn insert_row(cache: &mut LayerCache, row: usize, src: Option<&LayerCache>) -> Result<()> {
    match src {
        Some(src) => {
            cache.key.write_narrow(1, row, &src.key)?;
            cache.value.write_narrow(1, row, &src.value)?;
        }
        None => {
            let mut shape = cache.key.shape().to_vec();
            shape[1] = 1;
            let zeros = Tensor::zeros(&shape);
            cache.key.write_narrow(1, row, &zeros)?;
            cache.value.write_narrow(1, row, &zeros)?;
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
