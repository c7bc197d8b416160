//! Micro-batch splitting for pipelined forward steps.
//!
//! Each stage forwards the chunks in order, so consecutive stages overlap
//! on different chunks:
//!
//! ```text
//! Chunk →  0    1    2
//! S0:    [m0] [m1] [m2]
//! S1:         [m0] [m1] [m2]
//! S2:              [m0] [m1] [m2]
//! ```

use cascade_types::config::PipelineConfig;

/// Rows `[start, start + len)` of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroBatch {
    pub index: usize,
    pub start: usize,
    pub len: usize,
}

/// Deterministic split of the batch dimension. Every stage derives the same
/// schedule from the same inputs, so no coordination is needed.
#[derive(Debug, Clone)]
pub struct MicroBatchSchedule {
    batch_size: usize,
    micro_batch_size: usize,
    chunks: Vec<MicroBatch>,
}

impl MicroBatchSchedule {
    /// Chunks of `micro_batch_size` rows; the final chunk may be shorter.
    pub fn new(batch_size: usize, micro_batch_size: usize) -> Self {
        let micro_batch_size = micro_batch_size.clamp(1, batch_size.max(1));
        let chunks = (0..batch_size)
            .step_by(micro_batch_size)
            .enumerate()
            .map(|(index, start)| MicroBatch {
                index,
                start,
                len: micro_batch_size.min(batch_size - start),
            })
            .collect();

        Self {
            batch_size,
            micro_batch_size,
            chunks,
        }
    }

    /// Schedule for one step over `window` positions.
    ///
    /// An explicit `micro_batch_size` wins. Otherwise the batch is split
    /// once `batch × window` reaches the threshold, into chunks of
    /// `threshold / window` rows.
    pub fn for_step(batch_size: usize, window: usize, config: &PipelineConfig) -> Self {
        let size = match config.micro_batch_size {
            Some(size) => size,
            None => {
                let threshold = config.pipelining_batch_x_seqlen_threshold;
                if threshold > 0 && batch_size * window >= threshold {
                    (threshold / window.max(1)).max(1)
                } else {
                    batch_size
                }
            }
        };
        Self::new(batch_size, size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    pub fn num_micro_batches(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[MicroBatch] {
        &self.chunks
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_final_chunk() {
        let sched = MicroBatchSchedule::new(10, 4);
        let lens: Vec<usize> = sched.chunks().iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert_eq!(sched.chunks()[2].start, 8);
    }

    #[test]
    fn below_threshold_is_one_chunk() {
        let cfg = PipelineConfig {
            pipelining_batch_x_seqlen_threshold: 512,
            ..PipelineConfig::default()
        };
        let sched = MicroBatchSchedule::for_step(4, 16, &cfg);
        assert_eq!(sched.num_micro_batches(), 1);
        assert_eq!(sched.micro_batch_size(), 4);
    }

    #[test]
    fn threshold_sizes_chunks() {
        let cfg = PipelineConfig {
            pipelining_batch_x_seqlen_threshold: 64,
            ..PipelineConfig::default()
        };
        // 8 × 16 = 128 ≥ 64 → 64 / 16 = 4 rows per chunk
        let sched = MicroBatchSchedule::for_step(8, 16, &cfg);
        assert_eq!(sched.micro_batch_size(), 4);
        assert_eq!(sched.num_micro_batches(), 2);

        // Window longer than the threshold still gets one row per chunk.
        let sched = MicroBatchSchedule::for_step(3, 100, &cfg);
        assert_eq!(sched.micro_batch_size(), 1);
    }

    #[test]
    fn explicit_size_wins() {
        let cfg = PipelineConfig {
            micro_batch_size: Some(3),
            ..PipelineConfig::default()
        };
        assert_eq!(MicroBatchSchedule::for_step(7, 1, &cfg).num_micro_batches(), 3);
    }

    proptest! {
        #[test]
        fn chunks_cover_batch_exactly(batch in 1usize..64, size in 0usize..80) {
            let sched = MicroBatchSchedule::new(batch, size);
            let mut next = 0;
            for (i, chunk) in sched.chunks().iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.start, next);
                prop_assert!(chunk.len >= 1 && chunk.len <= sched.micro_batch_size());
                next += chunk.len;
            }
            prop_assert_eq!(next, batch);
        }
    }
}
