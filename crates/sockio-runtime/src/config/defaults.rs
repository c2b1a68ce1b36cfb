//! Library defaults, used when neither the builder nor the environment
//! sets a value.

use sockio_core::constants::MAX_WORKERS;

/// Longest time a worker blocks in the poller with nothing to do
pub const POLL_TIMEOUT_MS: u64 = 100;

/// Readiness events fetched per poller wait
pub const MAX_EVENTS: usize = 64;

/// Hard cap on readiness events per wait
pub const MAX_EVENTS_LIMIT: usize = 4096;

/// Thread name prefix; the worker index is appended
pub const WORKER_NAME: &str = "sockio-worker";

/// One worker per CPU, capped at `MAX_WORKERS`
pub fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_WORKERS)
}
