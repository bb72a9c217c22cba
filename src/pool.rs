// Bounded worker pool
//
// "Run these N independent jobs and wait": a dedicated rayon pool so the
// pairwise update pass never competes with the global rayon pool, and a
// fixed upper bound on the threads it may use.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// `threads == 0` lets rayon pick one thread per core.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("propagation-worker-{}", i))
            .build()?;
        Ok(WorkerPool { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Apply `job` to every item on the pool and collect the results in
    /// input order. Blocks the calling thread until all jobs finish.
    pub fn map_join<T, R, F>(&self, items: &[T], job: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(|item| job(item)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_join_preserves_order() {
        let pool = WorkerPool::new(4).unwrap();
        let items: Vec<u32> = (0..1000).collect();
        let doubled = pool.map_join(&items, |x| x * 2);
        assert_eq!(doubled.len(), 1000);
        for (i, v) in doubled.iter().enumerate() {
            assert_eq!(*v, i as u32 * 2);
        }
    }

    #[test]
    fn test_thread_bound() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
    }

    #[test]
    fn test_empty_input() {
        let pool = WorkerPool::new(1).unwrap();
        let out: Vec<u8> = pool.map_join(&Vec::<u8>::new(), |x| *x);
        assert!(out.is_empty());
    }
}
