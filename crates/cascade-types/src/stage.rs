// Stage identity within an ordered pipeline.
//
// Shared across cascade-pipeline, cascade-net and cascade-node.

use serde::{Deserialize, Serialize};

// ── Layer Range ───────────────────────────────────────────────────────────────

/// Inclusive range of transformer block indices held by one stage.
///
/// `LayerRange { start: 0, end: 3 }` covers blocks 0, 1, 2, 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, layer: u32) -> bool {
        self.start <= layer && layer <= self.end
    }
}

// ── Stage Role ────────────────────────────────────────────────────────────────

/// What a stage is responsible for in the decode loop.
///
/// `Only` holds the whole model: it embeds prompts, produces logits and
/// answers the caller without any link traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageRole {
    Only,
    /// Embeds tokens and answers the caller.
    First,
    Middle,
    /// Produces final logits.
    Last,
}

// ── Pipeline Stage ────────────────────────────────────────────────────────────

/// One compute rank in the ordered pipeline. Looked up by the decode loop,
/// never owned by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub rank: u32,
    pub num_stages: u32,
    pub layer_range: LayerRange,
    /// True if an exit head sits inside this stage's layer range.
    pub has_early_exit_capability: bool,
}

impl PipelineStage {
    /// A single stage owning every layer.
    pub fn single(num_layers: u32) -> Self {
        Self {
            rank: 0,
            num_stages: 1,
            layer_range: LayerRange {
                start: 0,
                end: num_layers.saturating_sub(1),
            },
            has_early_exit_capability: false,
        }
    }

    pub fn is_first(&self) -> bool {
        self.rank == 0
    }

    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.num_stages
    }

    pub fn is_pipelined(&self) -> bool {
        self.num_stages > 1
    }

    pub fn role(&self) -> StageRole {
        match (self.is_first(), self.is_last()) {
            (true, true) => StageRole::Only,
            (true, false) => StageRole::First,
            (false, true) => StageRole::Last,
            (false, false) => StageRole::Middle,
        }
    }

    /// Rank of the previous stage, if any.
    pub fn prev_rank(&self) -> Option<u32> {
        if self.is_first() {
            None
        } else {
            Some(self.rank - 1)
        }
    }

    /// Rank of the next stage, if any.
    pub fn next_rank(&self) -> Option<u32> {
        if self.is_last() {
            None
        } else {
            Some(self.rank + 1)
        }
    }

    pub fn last_rank(&self) -> u32 {
        self.num_stages - 1
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
