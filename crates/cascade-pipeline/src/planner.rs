//! Contiguous layer-to-stage assignment.
//!
//! Algorithm:
//! 1. Reject an empty model, zero stages, or more stages than layers.
//! 2. Give every stage `num_layers / num_stages` layers; the first
//!    `num_layers % num_stages` stages take one extra.
//! 3. A stage can exit early if an exit layer falls in its range and it is
//!    not the last stage (the last stage always produces final logits).

use cascade_types::{LayerRange, PipelineStage};

use crate::error::{PipelineError, Result};

/// Partition `num_layers` blocks over `num_stages` ordered stages.
pub fn plan_stages(num_layers: u32, num_stages: u32, exit_layers: &[u32]) -> Result<Vec<PipelineStage>> {
    // ── 1. Validate ──────────────────────────────────────────────────────
    if num_stages == 0 {
        return Err(PipelineError::Planning("at least one stage is required".into()));
    }
    if num_layers < num_stages {
        return Err(PipelineError::Planning(format!(
            "{num_stages} stages cannot share {num_layers} layers"
        )));
    }
    if let Some(bad) = exit_layers.iter().find(|&&l| l >= num_layers) {
        return Err(PipelineError::Planning(format!(
            "exit layer {bad} is outside a {num_layers}-layer model"
        )));
    }

    // ── 2. Assign layers ─────────────────────────────────────────────────
    let base = num_layers / num_stages;
    let extra = num_layers % num_stages;
    let mut stages = Vec::with_capacity(num_stages as usize);
    let mut cursor = 0;

    for rank in 0..num_stages {
        let assigned = base + u32::from(rank < extra);
        let layer_range = LayerRange {
            start: cursor,
            end: cursor + assigned - 1,
        };
        cursor += assigned;

        // ── 3. Exit capability ───────────────────────────────────────────
        let is_last = rank + 1 == num_stages;
        let has_early_exit_capability =
            !is_last && exit_layers.iter().any(|&l| layer_range.contains(l));

        stages.push(PipelineStage {
            rank,
            num_stages,
            layer_range,
            has_early_exit_capability,
        });
    }

    Ok(stages)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
