//! Thread-parallel expectation over a static image partition
//!
//! Images are split into contiguous ranges, one per worker. Each
//! [`WorkerTask`] borrows its slice of the image set and owns its
//! accumulators; everything else is shared read-only through the
//! [`ExpectationContext`]. Partials come back in partition order and are
//! summed by [`reduce_partials`] once all workers have joined.

use std::ops::Range;

use log::debug;
use rayon::prelude::*;

use super::accumulators::{reduce_partials, Accumulators, PartialResult};
use super::expectation::{expectation_single_image, ExpectationContext, ImageWorkspace};
use crate::error::{Error, Result};
use crate::fft::Fft3dWorkspace;
use crate::volume::SubVolume;

/// Build the fixed-size pool used for every pass of a run
pub fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("mltomo-worker-{}", i))
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))
}

/// Split `n_images` into at most `n_workers` contiguous, non-empty ranges
/// whose lengths differ by at most one
pub fn partition(n_images: usize, n_workers: usize) -> Vec<Range<usize>> {
    let workers = n_workers.max(1).min(n_images);
    if workers == 0 {
        return Vec::new();
    }
    let base = n_images / workers;
    let extra = n_images % workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for w in 0..workers {
        let len = base + usize::from(w < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// One worker's share of an expectation pass
pub struct WorkerTask<'a> {
    /// Global index of `images[0]`
    pub first_index: usize,
    pub images: &'a [SubVolume],
    pub acc: Accumulators,
}

impl<'a> WorkerTask<'a> {
    pub fn new(first_index: usize, images: &'a [SubVolume], nr_ref: usize, voxels: usize, track_halves: bool) -> Self {
        Self {
            first_index,
            images,
            acc: Accumulators::new(nr_ref, voxels, track_halves),
        }
    }

    /// Run the expectation step over the task's images, in order
    ///
    /// `fft` is usually a clone of a workspace shared by all tasks of a pass.
    pub fn run(mut self, ctx: &ExpectationContext, fft: Fft3dWorkspace) -> Result<PartialResult> {
        let mut ws = ImageWorkspace::with_fft(fft);
        let mut assignments = Vec::with_capacity(self.images.len());
        for (offset, img) in self.images.iter().enumerate() {
            let a = expectation_single_image(ctx, self.first_index + offset, img, &mut ws, &mut self.acc)?;
            assignments.push(a);
        }
        Ok(PartialResult { acc: self.acc, assignments })
    }
}

/// Expectation over all images with `n_workers` static partitions on `pool`
///
/// Any worker error aborts the pass. The reduced result does not depend on
/// `n_workers` beyond floating-point summation order.
pub fn expectation(
    pool: &rayon::ThreadPool,
    images: &[SubVolume],
    ctx: &ExpectationContext,
    n_workers: usize,
    track_halves: bool,
) -> Result<PartialResult> {
    let nr_ref = ctx.refs.len();
    let dim = ctx.refs.dim();
    let voxels = dim * dim * dim;
    let ranges = partition(images.len(), n_workers);
    if ranges.is_empty() {
        return Err(Error::EmptyImageSet);
    }
    debug!(
        "expectation: {} images over {} partitions ({} orientations, {} offsets)",
        images.len(),
        ranges.len(),
        ctx.grid.len(),
        ctx.prior.len()
    );

    let tasks: Vec<WorkerTask> = ranges
        .into_iter()
        .map(|r| WorkerTask::new(r.start, &images[r], nr_ref, voxels, track_halves))
        .collect();

    let plans = Fft3dWorkspace::cubic(dim);
    // Collecting into Result keeps partition order and stops on the first error
    let partials: Vec<PartialResult> = pool.install(|| {
        tasks
            .into_par_iter()
            .map(|task| task.run(ctx, plans.clone()))
            .collect::<Result<Vec<_>>>()
    })?;

    reduce_partials(partials).ok_or(Error::EmptyImageSet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_all_images() {
        let ranges = partition(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        let ranges = partition(2, 5);
        assert_eq!(ranges, vec![0..1, 1..2]);
        assert!(partition(0, 4).is_empty());
        assert_eq!(partition(7, 1), vec![0..7]);
    }

    #[test]
    fn test_partition_lengths_balanced() {
        for n in 1..40 {
            for w in 1..9 {
                let ranges = partition(n, w);
                let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
                assert_eq!(lens.iter().sum::<usize>(), n);
                let (lo, hi) = (lens.iter().min().unwrap(), lens.iter().max().unwrap());
                assert!(hi - lo <= 1 && *lo > 0);
            }
        }
    }

    #[test]
    fn test_build_pool() {
        let pool = build_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
