// Configuration structs for one generation call and the pipeline it runs on.
//
// Every struct deserializes from partial JSON: missing fields take their
// `Default` value.

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::TokenId;

// ── Sampling ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Keep only the k most likely tokens. `1` is greedy. 0 = disabled.
    pub top_k: usize,
    /// Nucleus cutoff in (0, 1]. 0 = disabled.
    pub top_p: f32,
    /// Multiplicative decay applied to `top_p` after every step. 0 = disabled.
    pub top_p_decay: f32,
    /// Floor for the decayed `top_p`. 0 = no floor.
    pub top_p_bound: f32,
    pub temperature: f32,
    /// PRNG seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: 0.0,
            top_p_decay: 0.0,
            top_p_bound: 0.0,
            temperature: 1.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding (`top_k = 1`).
    pub fn greedy() -> Self {
        Self {
            top_k: 1,
            ..Self::default()
        }
    }

    /// True when neither top-k (other than 1) nor top-p filtering applies and
    /// the next token is the argmax.
    pub fn is_greedy(&self) -> bool {
        self.top_k == 1 || (self.top_k == 0 && self.top_p == 0.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k > 0 && self.top_p > 0.0 {
            return Err(CascadeError::Config(format!(
                "top_k ({}) and top_p ({}) are mutually exclusive",
                self.top_k, self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(CascadeError::Config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.temperature <= 0.0 || !self.temperature.is_finite() {
            return Err(CascadeError::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.top_p_decay < 0.0 || self.top_p_bound < 0.0 {
            return Err(CascadeError::Config(
                "top_p_decay and top_p_bound must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

// ── Early Exit ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyExitConfig {
    pub use_early_exit: bool,
    /// Confidence threshold per exit layer. A single value applies to all.
    pub early_exit_thresholds: Vec<f32>,
    /// Layer indices carrying an exit head.
    pub exit_layers: Vec<u32>,
    /// Log the answering stage's argmax token and its probability each step.
    pub log_max_prob: bool,
}

impl Default for EarlyExitConfig {
    fn default() -> Self {
        Self {
            use_early_exit: false,
            early_exit_thresholds: vec![1.0],
            exit_layers: Vec::new(),
            log_max_prob: false,
        }
    }
}

impl EarlyExitConfig {
    /// Threshold for the `exit_index`-th configured exit layer.
    pub fn threshold_for(&self, exit_index: usize) -> f32 {
        match self.early_exit_thresholds.as_slice() {
            [] => 1.0,
            [single] => *single,
            many => many.get(exit_index).copied().unwrap_or(1.0),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.early_exit_thresholds.len();
        if n > 1 && n != self.exit_layers.len() {
            return Err(CascadeError::Config(format!(
                "{n} early-exit thresholds for {} exit layers",
                self.exit_layers.len()
            )));
        }
        Ok(())
    }
}

// ── Stopping ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Tokens that finish a request. Empty means end-of-document alone.
    pub stop_tokens: Vec<TokenId>,
    /// Break out of the loop once every request has finished.
    pub use_stop_tokens_for_early_termination: bool,
    /// Forbid a newline token immediately after a colon token.
    pub prevent_newline_after_colon: bool,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            stop_tokens: Vec::new(),
            use_stop_tokens_for_early_termination: true,
            prevent_newline_after_colon: true,
        }
    }
}

// ── Generation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub sampling: SamplingConfig,
    pub early_exit: EarlyExitConfig,
    pub stop: StopConfig,
    /// Return prompt + generation instead of generation only.
    pub echo_prompts: bool,
    pub return_output_log_probs: bool,
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        self.early_exit.validate()
    }
}

// ── Beam Search ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    pub beam_size: usize,
    /// Hypothesis score = sum of log-probs / length^length_penalty.
    pub length_penalty: f32,
    pub num_return_sequences: usize,
    /// Token that completes a hypothesis. `None` = end-of-document id.
    pub stop_token: Option<TokenId>,
    pub prevent_newline_after_colon: bool,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            beam_size: 4,
            length_penalty: 1.0,
            num_return_sequences: 1,
            stop_token: None,
            prevent_newline_after_colon: true,
        }
    }
}

impl BeamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(CascadeError::Config("beam_size must be at least 1".into()));
        }
        if self.num_return_sequences == 0 {
            return Err(CascadeError::Config(
                "num_return_sequences must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Width of the activations exchanged between stages.
    pub hidden_size: usize,
    /// Longest sequence the model's position embeddings cover.
    pub max_position_embeddings: usize,
    /// Upper bound on `batch_size × max_sequence_length` for one call.
    pub max_tokens_budget: usize,
    /// Split the batch into micro-batches once `batch × window` reaches this.
    pub pipelining_batch_x_seqlen_threshold: usize,
    /// Fixed micro-batch size. `None` = derive from the threshold.
    pub micro_batch_size: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            max_position_embeddings: 2048,
            max_tokens_budget: 12_000,
            pipelining_batch_x_seqlen_threshold: 512,
            micro_batch_size: None,
        }
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a stage keeps retrying to reach its peers at startup.
    pub connect_timeout_secs: u64,
    /// Reject any single frame larger than this.
    pub max_frame_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            max_frame_bytes: 128 * 1024 * 1024,
        }
    }
}
