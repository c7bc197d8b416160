//! Next-token selection from one row of logits.
//!
//! Greedy when `top_k == 1` or when both filters are off. Otherwise the
//! logits are divided by the temperature, filtered by exactly one of top-k
//! or top-p, and a token is drawn from the softmax of what survives.

use cascade_types::config::SamplingConfig;
use cascade_types::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Logit written over suppressed tokens.
pub const SUPPRESSED_LOGIT: f32 = -1e10;

pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// `None` seeds from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Pick the next token. Never returns an id at or past `vocab_size`,
    /// which may be smaller than the padded logits row.
    pub fn sample(&mut self, logits: &[f32], config: &SamplingConfig, vocab_size: usize) -> TokenId {
        let token = if config.is_greedy() {
            argmax(logits)
        } else {
            let mut scaled: Vec<f32> = logits.iter().map(|l| l / config.temperature).collect();
            if config.top_k > 1 {
                filter_top_k(&mut scaled, config.top_k);
            } else if config.top_p > 0.0 {
                filter_top_p(&mut scaled, config.top_p);
            }
            self.draw(&softmax(&scaled))
        };
        let ceiling = vocab_size.max(1) - 1;
        token.min(ceiling) as TokenId
    }

    fn draw(&mut self, probs: &[f32]) -> usize {
        let r: f32 = self.rng.gen();
        let mut cumulative = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if r < cumulative {
                return i;
            }
        }
        // Rounding left `r` above the final sum; take the last live token.
        probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
    }
}

pub fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Mask everything strictly below the k-th largest logit.
fn filter_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let kth = sorted[k - 1];
    for l in logits.iter_mut().filter(|l| **l < kth) {
        *l = f32::NEG_INFINITY;
    }
}

/// Keep the smallest prefix of tokens, by descending probability, whose
/// cumulative probability exceeds `p`. The most likely token always stays.
fn filter_top_p(logits: &mut [f32], p: f32) {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    let sorted: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&sorted);

    let mut cumulative = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        // A token is dropped once the mass before it already exceeds `p`.
        if rank > 0 && cumulative > p {
            logits[idx] = f32::NEG_INFINITY;
        }
        cumulative += probs[rank];
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

/// Forbid `newline` right after `colon`.
pub fn suppress_newline_after_colon(logits: &mut [f32], previous: TokenId, colon: TokenId, newline: TokenId) {
    if previous != colon {
        return;
    }
    if let Some(slot) = usize::try_from(newline).ok().and_then(|i| logits.get_mut(i)) {
        *slot = SUPPRESSED_LOGIT;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
