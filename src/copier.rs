use std::ops::Range;

use rayon::prelude::*;

use crate::foundation::error::{StoreError, StoreResult};

/// Default number of chunks a copy job is split into.
pub const DEFAULT_CHUNKS: usize = 10;

/// Splits a pixel-copy job into contiguous, disjoint chunks and runs them on a dedicated
/// rayon pool. Every call returns only after all of its chunks have finished.
pub struct ParallelCopier {
    chunks: usize,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ParallelCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelCopier")
            .field("chunks", &self.chunks)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl ParallelCopier {
    pub fn new(chunks: usize, threads: Option<usize>) -> StoreResult<Self> {
        if chunks == 0 {
            return Err(StoreError::parameter("copier chunk count must be >= 1"));
        }
        Ok(Self {
            chunks,
            pool: build_thread_pool("copier", threads)?,
        })
    }

    /// Partition `[0, len)` into at most `chunks` contiguous ranges, sizes differing by at most one.
    pub fn partition(&self, len: u32) -> Vec<Range<u32>> {
        let n = (self.chunks as u32).min(len);
        if n == 0 {
            return Vec::new();
        }
        let base = len / n;
        let extra = len % n;
        let mut out = Vec::with_capacity(n as usize);
        let mut start = 0;
        for i in 0..n {
            let end = start + base + u32::from(i < extra);
            out.push(start..end);
            start = end;
        }
        out
    }

    /// Run `job` once per chunk of `[0, len)`. Jobs must only touch pixels inside their range.
    ///
    /// Every chunk runs to completion; the first failure (in chunk order) is returned.
    pub fn for_each_chunk<F>(&self, len: u32, job: F) -> StoreResult<()>
    where
        F: Fn(Range<u32>) -> StoreResult<()> + Sync,
    {
        let ranges = self.partition(len);
        let results = self
            .pool
            .install(|| ranges.into_par_iter().map(&job).collect::<Vec<_>>());
        results.into_iter().collect()
    }

    /// Split a row-major buffer into bands of whole rows and hand each worker its own band.
    ///
    /// `job` receives the band's row range (relative to `rows`) and the band's bytes.
    pub fn for_each_band<F>(&self, rows: &mut [u8], row_bytes: usize, job: F) -> StoreResult<()>
    where
        F: Fn(Range<u32>, &mut [u8]) -> StoreResult<()> + Sync,
    {
        if row_bytes == 0 || rows.len() % row_bytes != 0 {
            return Err(StoreError::storage(format!(
                "buffer of {} bytes is not a whole number of {row_bytes}-byte rows",
                rows.len()
            )));
        }
        let row_count = u32::try_from(rows.len() / row_bytes)
            .map_err(|_| StoreError::storage("too many rows for one copy job"))?;

        let mut bands = Vec::with_capacity(self.chunks);
        let mut rest = rows;
        for range in self.partition(row_count) {
            let (band, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * row_bytes);
            bands.push((range, band));
            rest = tail;
        }

        let results = self.pool.install(|| {
            bands
                .into_par_iter()
                .map(|(range, band)| job(range, band))
                .collect::<Vec<_>>()
        });
        results.into_iter().collect()
    }
}

pub(crate) fn build_thread_pool(
    name: &'static str,
    threads: Option<usize>,
) -> StoreResult<rayon::ThreadPool> {
    if let Some(n) = threads
        && n == 0
    {
        return Err(StoreError::parameter(format!(
            "{name} 'threads' must be >= 1 when set"
        )));
    }

    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(move |i| format!("{name}-{i}"));
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| StoreError::storage(format!("failed to build {name} thread pool: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn partition_covers_range_without_overlap() {
        let copier = ParallelCopier::new(10, Some(2)).unwrap();
        for len in [0u32, 1, 3, 9, 10, 11, 124, 20_000] {
            let parts = copier.partition(len);
            assert_eq!(parts.len(), (len as usize).min(10));
            let mut next = 0;
            for p in &parts {
                assert_eq!(p.start, next);
                assert!(!p.is_empty());
                next = p.end;
            }
            assert_eq!(next, len);
            if let (Some(min), Some(max)) = (
                parts.iter().map(|p| p.len()).min(),
                parts.iter().map(|p| p.len()).max(),
            ) {
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn rejects_zero_chunks_or_threads() {
        assert!(matches!(
            ParallelCopier::new(0, None),
            Err(StoreError::Parameter(_))
        ));
        assert!(matches!(
            ParallelCopier::new(4, Some(0)),
            Err(StoreError::Parameter(_))
        ));
    }

    #[test]
    fn every_chunk_runs_even_when_one_fails() {
        let copier = ParallelCopier::new(5, Some(3)).unwrap();
        let ran = AtomicUsize::new(0);
        let err = copier
            .for_each_chunk(50, |r| {
                ran.fetch_add(1, Ordering::SeqCst);
                if r.start == 20 {
                    Err(StoreError::storage("chunk 20 failed"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert!(err.to_string().contains("chunk 20 failed"));
    }

    #[test]
    fn bands_fill_disjoint_rows() {
        let copier = ParallelCopier::new(4, Some(4)).unwrap();
        let row_bytes = 3;
        let mut buf = vec![0u8; 7 * row_bytes];
        copier
            .for_each_band(&mut buf, row_bytes, |rows, band| {
                assert_eq!(band.len(), rows.len() * row_bytes);
                for (k, row) in band.chunks_exact_mut(row_bytes).enumerate() {
                    row.fill(rows.start as u8 + k as u8);
                }
                Ok(())
            })
            .unwrap();
        for (j, row) in buf.chunks_exact(row_bytes).enumerate() {
            assert!(row.iter().all(|&b| b == j as u8), "row {j}: {row:?}");
        }
    }

    #[test]
    fn bands_reject_ragged_buffers() {
        let copier = ParallelCopier::new(2, Some(1)).unwrap();
        let mut buf = vec![0u8; 10];
        assert!(copier.for_each_band(&mut buf, 4, |_, _| Ok(())).is_err());
    }
}
