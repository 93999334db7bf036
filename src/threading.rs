use std::env;
use std::sync::OnceLock;

/// A wrapper around the Rayon thread pool used to run independent exports.
///
/// If the pool could not be created, operations run directly on the calling
/// thread.
pub struct ThreadPool {
    /// The wrapped thread pool, or None if we failed to construct one.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// This corresponds to [`rayon::ThreadPool::install`], except when the
    /// pool could not be created, where it just runs `op` directly.
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("gcap-{}", index))
            .build();

        ThreadPool { pool: pool.ok() }
    }

    /// Return the number of threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }
}

/// Return the [Rayon][rayon] thread pool which is used by
/// [`export_batch`](crate::export_batch).
///
/// Tracing and encoding are CPU-bound, so the pool is sized by the number of
/// physical rather than logical cores. The thread count can be overridden by
/// setting the `GCAP_NUM_THREADS` environment variable, whose value must be a
/// number between 1 and the logical core count.
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn export_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical().max(1);

        let num_threads = if let Some(threads_var) = env::var_os("GCAP_NUM_THREADS") {
            let requested_threads: Result<usize, _> = threads_var.to_string_lossy().parse();
            match requested_threads {
                Ok(n_threads) => n_threads.clamp(1, num_cpus::get().max(1)),
                Err(_) => physical_cpus,
            }
        } else {
            physical_cpus
        };

        ThreadPool::with_num_threads(num_threads)
    })
}

#[cfg(test)]
mod tests {
    use super::{export_pool, ThreadPool};

    #[test]
    fn test_export_pool() {
        let pool = export_pool();
        assert!(pool.num_threads() >= 1 && pool.num_threads() <= num_cpus::get().max(1));
        assert_eq!(pool.run(|| 2 + 2), 4);
    }

    #[test]
    fn test_with_num_threads() {
        let pool = ThreadPool::with_num_threads(2);
        assert_eq!(pool.num_threads(), 2);
        let name = pool.run(|| std::thread::current().name().map(|s| s.to_string()));
        assert!(name.is_some_and(|name| name.starts_with("gcap-")));
    }
}
