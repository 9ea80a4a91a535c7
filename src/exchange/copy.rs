//! Parallel host memcpy used on the `put` path.

use crate::error::{Error, Result};
use rayon::prelude::*;
use std::fmt;

/// Splits large host-to-host copies across a dedicated rayon pool.
///
/// Copies smaller than the threshold, or any copy when configured with one
/// thread, run inline on the caller's thread.
pub struct ParallelCopier {
    pool: Option<rayon::ThreadPool>,
    threads: usize,
    threshold: usize,
}

impl ParallelCopier {
    /// Create a copier with `threads` workers that kicks in at `threshold`
    /// bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] if the worker threads cannot be spawned.
    pub fn new(threads: usize, threshold: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("shmtensor-memcpy-{i}"))
                .build()
                .map_err(|e| Error::Allocation(format!("memcpy pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            pool,
            threads,
            threshold,
        })
    }

    /// Single-threaded copier.
    pub fn inline() -> Self {
        Self {
            pool: None,
            threads: 1,
            threshold: usize::MAX,
        }
    }

    /// Worker count.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Copy `src` into `dst`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the lengths differ.
    pub fn copy_slice(&self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::ShapeMismatch {
                expected: dst.len(),
                actual: src.len(),
            });
        }
        match &self.pool {
            Some(pool) if src.len() >= self.threshold => {
                let chunk = src.len().div_ceil(self.threads).max(1);
                pool.install(|| {
                    dst.par_chunks_mut(chunk)
                        .zip(src.par_chunks(chunk))
                        .for_each(|(d, s)| d.copy_from_slice(s));
                });
            }
            _ => dst.copy_from_slice(src),
        }
        Ok(())
    }

    /// Copy `nbytes` between raw host pointers.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `nbytes` reads, `dst` for `nbytes` writes, and
    /// the two ranges must not overlap.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, nbytes: usize) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        // SAFETY: caller contract.
        let (dst, src) = unsafe {
            (
                std::slice::from_raw_parts_mut(dst, nbytes),
                std::slice::from_raw_parts(src, nbytes),
            )
        };
        self.copy_slice(dst, src)
    }
}

impl fmt::Debug for ParallelCopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelCopier")
            .field("threads", &self.threads)
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_copy_matches() {
        let copier = ParallelCopier::new(4, 16).unwrap();
        let src: Vec<u8> = (0..10_007u32).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; src.len()];
        copier.copy_slice(&mut dst, &src).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_small_and_inline_copies() {
        let copier = ParallelCopier::new(4, 1 << 20).unwrap();
        let mut dst = [0u8; 3];
        copier.copy_slice(&mut dst, &[1, 2, 3]).unwrap();
        assert_eq!(dst, [1, 2, 3]);

        let inline = ParallelCopier::inline();
        assert_eq!(inline.threads(), 1);
        unsafe { inline.copy(dst.as_mut_ptr(), [9u8; 3].as_ptr(), 3).unwrap() };
        assert_eq!(dst, [9, 9, 9]);
    }

    #[test]
    fn test_length_mismatch() {
        let copier = ParallelCopier::new(1, 0).unwrap();
        let mut dst = [0u8; 2];
        assert!(matches!(
            copier.copy_slice(&mut dst, &[1, 2, 3]),
            Err(Error::ShapeMismatch { expected: 2, actual: 3 })
        ));
    }
}
