//! Parallel decomposition of the expectation step.
//!
//! Two strategies:
//! - `ImageBatch`: fixed-size chunks of images are evaluated concurrently, each
//!   chunk folding its images into a private accumulator.
//! - `ReferenceRanges`: images are visited in order and the references of each
//!   image are split into `(start, end)` tasks evaluated concurrently.
//!
//! Chunk and range boundaries depend only on the configuration, and partial
//! results are combined in task order, so the sums are the same for any
//! number of worker threads.

use rayon::prelude::*;
use std::ops::Range;

use crate::accumulator::WeightedAccumulator;
use crate::config::{DistributionStrategy, MlConfig};
use crate::error::{MlError, Result};
use crate::expectation::{expectation_single_image, ExpectationContext, ImageHints, ImageRecord, ParticleImage};
use crate::float_trait::MlFloat;

/// Chunks evaluated concurrently before their accumulators are merged.
///
/// Bounds the number of live chunk accumulators.
const WAVE_CHUNKS: usize = 16;

/// Split `n_references` into consecutive ranges of at most `load` references.
pub fn reference_ranges(n_references: usize, load: usize) -> Vec<Range<usize>> {
    let load = load.max(1);
    (0..n_references)
        .step_by(load)
        .map(|start| start..(start + load).min(n_references))
        .collect()
}

/// Everything the expectation step produced for one iteration.
pub struct ExpectationResult<F: MlFloat> {
    pub accumulator: WeightedAccumulator<F>,
    /// Records in input order.
    pub records: Vec<ImageRecord>,
    /// Updated hints in input order.
    pub hints: Vec<ImageHints>,
    /// Number of images whose trial minimum had to be corrected.
    pub redo_count: usize,
}

struct ImageResult {
    index: usize,
    record: ImageRecord,
    hints: ImageHints,
    redo_count: usize,
}

struct ChunkResult<F: MlFloat> {
    accumulator: WeightedAccumulator<F>,
    images: Vec<ImageResult>,
}

/// Fans the expectation step out over worker threads.
pub struct TaskDistributor {
    strategy: DistributionStrategy,
    image_chunk: usize,
    reference_load: usize,
    pool: Option<rayon::ThreadPool>,
}

impl TaskDistributor {
    pub fn new(config: &MlConfig) -> Result<Self> {
        let pool = match config.num_threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| MlError::InvalidConfig(format!("thread pool: {}", e)))?,
            ),
            None => None,
        };
        Ok(Self {
            strategy: config.strategy,
            image_chunk: config.image_chunk.max(1),
            reference_load: config.reference_load.max(1),
            pool,
        })
    }

    pub fn strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    /// Run `op` inside the dedicated pool when one was configured.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Evaluate every image in `order` and return the merged sums.
    ///
    /// `hints` is indexed like `images`.
    pub fn run_expectation<F: MlFloat>(
        &self,
        ctx: &ExpectationContext<'_, F>,
        images: &[ParticleImage<F>],
        hints: &[ImageHints],
        order: &[usize],
    ) -> Result<ExpectationResult<F>> {
        let n_ref = ctx.model.n_references();
        let nr_psi = ctx.grid.nr_psi();
        let dim = ctx.plans.dim();

        let chunks = self.install(|| -> Result<Vec<ChunkResult<F>>> {
            match self.strategy {
                DistributionStrategy::ImageBatch => {
                    let mut done = Vec::new();
                    let chunk_orders: Vec<&[usize]> = order.chunks(self.image_chunk).collect();
                    for wave in chunk_orders.chunks(WAVE_CHUNKS) {
                        let results: Vec<ChunkResult<F>> = wave
                            .par_iter()
                            .map(|chunk| -> Result<ChunkResult<F>> {
                                let mut accumulator = WeightedAccumulator::new(n_ref, nr_psi, dim);
                                let mut results = Vec::with_capacity(chunk.len());
                                for &index in chunk.iter() {
                                    let outcome = expectation_single_image(
                                        ctx,
                                        &images[index],
                                        &hints[index],
                                        &[0..n_ref],
                                        false,
                                    )?;
                                    accumulator.add_image(&outcome.contribution);
                                    results.push(ImageResult {
                                        index,
                                        record: outcome.record,
                                        hints: outcome.hints,
                                        redo_count: outcome.redo_count,
                                    });
                                }
                                Ok(ChunkResult {
                                    accumulator,
                                    images: results,
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        done.extend(results);
                    }
                    Ok(done)
                }
                DistributionStrategy::ReferenceRanges => {
                    let ranges = reference_ranges(n_ref, self.reference_load);
                    let mut accumulator = WeightedAccumulator::new(n_ref, nr_psi, dim);
                    let mut results = Vec::with_capacity(order.len());
                    for &index in order {
                        let outcome =
                            expectation_single_image(ctx, &images[index], &hints[index], &ranges, true)?;
                        accumulator.add_image(&outcome.contribution);
                        results.push(ImageResult {
                            index,
                            record: outcome.record,
                            hints: outcome.hints,
                            redo_count: outcome.redo_count,
                        });
                    }
                    Ok(vec![ChunkResult {
                        accumulator,
                        images: results,
                    }])
                }
            }
        })?;

        let mut accumulator = WeightedAccumulator::new(n_ref, nr_psi, dim);
        let mut records: Vec<Option<ImageRecord>> = vec![None; images.len()];
        let mut new_hints = hints.to_vec();
        let mut redo_count = 0;
        for chunk in chunks {
            accumulator = accumulator.merge(chunk.accumulator);
            for image in chunk.images {
                redo_count += usize::from(image.redo_count > 0);
                records[image.index] = Some(image.record);
                new_hints[image.index] = image.hints;
            }
        }

        Ok(ExpectationResult {
            accumulator,
            records: records.into_iter().flatten().collect(),
            hints: new_hints,
            redo_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_ranges_cover_all_references_once() {
        assert_eq!(reference_ranges(5, 2), vec![0..2, 2..4, 4..5]);
        assert_eq!(reference_ranges(3, 1), vec![0..1, 1..2, 2..3]);
        assert_eq!(reference_ranges(3, 10), vec![0..3]);
        assert_eq!(reference_ranges(4, 0), vec![0..1, 1..2, 2..3, 3..4]);
        assert!(reference_ranges(0, 2).is_empty());
    }

    #[test]
    fn test_dedicated_pool_runs_work() {
        let mut config = MlConfig::new();
        config.num_threads = Some(2);
        let distributor = TaskDistributor::new(&config).unwrap();
        let sum: usize = distributor.install(|| (0..100usize).into_par_iter().sum());
        assert_eq!(sum, 4950);
        assert_eq!(distributor.strategy(), DistributionStrategy::ImageBatch);
    }
}
