//! Worker pools for the data-parallel kernels.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Result, SegmentationError};

/// Build a pool with `threads` workers, or one per available core when
/// `None`. `Some(1)` runs every kernel on a single worker.
pub fn build_worker_pool(threads: Option<usize>) -> Result<Arc<ThreadPool>> {
    let threads = match threads {
        Some(0) => {
            return Err(SegmentationError::invalid_configuration(
                "number of threads must be at least 1",
            ))
        }
        Some(n) => n,
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("emseg-worker-{}", i))
        .build()
        .map_err(|e| {
            SegmentationError::invalid_configuration(format!("could not build worker pool: {}", e))
        })?;
    tracing::debug!(threads, "built worker pool");
    Ok(Arc::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_thread_count() {
        let pool = build_worker_pool(Some(3)).unwrap();
        assert_eq!(pool.current_num_threads(), 3);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(build_worker_pool(Some(0)).is_err());
    }

    #[test]
    fn test_default_uses_hardware() {
        let pool = build_worker_pool(None).unwrap();
        assert!(pool.current_num_threads() >= 1);
    }
}
