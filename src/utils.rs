//! Fork-join helpers shared by the ingestion and transpose loops.
//!
//! Parallel sections in this crate follow one shape: a single virtual row
//! range is statically partitioned into as many chunks as there are threads,
//! every chunk runs to completion, and the call blocks until all chunks are
//! done. The chunk index doubles as the logical thread id, which keeps the
//! output layout deterministic regardless of which pool worker picks up
//! which chunk.

use std::ops::Range;

/// Resolve a thread-count argument.
///
/// - `0` = auto (current rayon pool width)
/// - `n` = exactly `n` threads
#[inline]
pub fn resolve_threads(n_threads: usize) -> usize {
    if n_threads == 0 {
        rayon::current_num_threads()
    } else {
        n_threads
    }
}

/// Statically partition `0..len` into `n_chunks` contiguous ranges.
///
/// The first `len % n_chunks` ranges are one element longer, so sizes differ
/// by at most one. Ranges may be empty when `n_chunks > len`.
pub fn chunk_ranges(len: usize, n_chunks: usize) -> Vec<Range<usize>> {
    assert!(n_chunks > 0, "need at least one chunk");
    let base = len / n_chunks;
    let rem = len % n_chunks;
    let mut ranges = Vec::with_capacity(n_chunks);
    let mut start = 0;
    for i in 0..n_chunks {
        let size = base + usize::from(i < rem);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Run a closure inside a thread pool of exactly `n_threads` threads.
///
/// Thread count semantics match [`resolve_threads`]: `0` = auto, `1` runs
/// the closure on the calling thread without building a pool.
pub fn run_with_threads<T: Send>(n_threads: usize, f: impl FnOnce() -> T + Send) -> T {
    let n = resolve_threads(n_threads);
    if n == 1 {
        return f();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .build()
        .expect("failed to create thread pool");
    pool.install(f)
}
