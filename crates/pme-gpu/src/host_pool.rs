//! Fixed-size host thread pool with static range partitioning.
//!
//! Host-threaded sub-stages (FFT, solve, force reduction) split their index
//! range into exactly `nthreads` contiguous ranges, one task per range.

use std::ops::Range;

use anyhow::{Context, Result};

use crate::kernels::SlabDriver;

/// Splits `0..len` into `parts` contiguous ranges; earlier ranges take the
/// remainder, trailing ranges may be empty.
pub fn static_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1);
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Host pool shared by the pipeline's host stages and the output reducer.
pub struct HostPool {
    pool: rayon::ThreadPool,
    nthreads: usize,
}

impl HostPool {
    pub fn new(nthreads: usize) -> Result<Self> {
        let nthreads = nthreads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .thread_name(|i| format!("pme-host-{}", i))
            .build()
            .context("Failed to build PME host thread pool")?;
        Ok(Self { pool, nthreads })
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Calls `f(range, chunk)` once per static range of `data`, in parallel.
    ///
    /// `unit` elements of `data` make up one index of the partitioned range
    /// (e.g. one x-plane of a grid). Results come back in range order.
    pub fn for_each_range<T, R, F>(&self, data: &mut [T], unit: usize, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(Range<usize>, &mut [T]) -> R + Sync,
    {
        let unit = unit.max(1);
        let ranges = static_ranges(data.len() / unit, self.nthreads);
        let mut results: Vec<Option<R>> = (0..ranges.len()).map(|_| None).collect();

        self.pool.scope(|scope| {
            let mut rest = data;
            let f = &f;
            for (range, slot) in ranges.into_iter().zip(results.iter_mut()) {
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * unit);
                rest = tail;
                scope.spawn(move |_| *slot = Some(f(range, chunk)));
            }
        });

        results.into_iter().flatten().collect()
    }
}

/// Host transforms: one static slab range per thread.
impl SlabDriver for HostPool {
    fn for_each_slab<T, F>(&self, data: &mut [T], unit: usize, f: F)
    where
        T: Send,
        F: Fn(Range<usize>, &mut [T]) + Sync,
    {
        self.for_each_range(data, unit, f);
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool").field("nthreads", &self.nthreads).finish()
    }
}
