//! Worker and pool configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use sockio_runtime::config::PoolConfig;
//!
//! let config = PoolConfig::from_env()
//!     .num_workers(2)
//!     .poll_timeout(Duration::from_millis(20));
//! config.validate()?;
//! ```

pub mod defaults;

use sockio_core::constants::MAX_WORKERS;
use sockio_core::env::{env_get, env_get_opt};
use sockio_core::error::{AioError, AioResult};
use std::time::Duration;

/// Configuration of a single worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on one blocking poller wait
    pub poll_timeout: Duration,
    /// Readiness events fetched per wait
    pub max_events: usize,
    /// Thread name prefix
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    /// Library defaults, no environment lookup
    pub fn new() -> Self {
        Self {
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            max_events: defaults::MAX_EVENTS,
            name: defaults::WORKER_NAME.to_string(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `SOCKIO_POLL_TIMEOUT_MS` - poller wait bound in milliseconds
    /// - `SOCKIO_MAX_EVENTS` - readiness events per wait
    pub fn from_env() -> Self {
        Self {
            poll_timeout: Duration::from_millis(env_get(
                "SOCKIO_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            max_events: env_get("SOCKIO_MAX_EVENTS", defaults::MAX_EVENTS),
            name: defaults::WORKER_NAME.to_string(),
        }
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Thread name of worker `index`
    pub(crate) fn thread_name(&self, index: usize) -> String {
        format!("{}-{}", self.name, index)
    }

    pub fn validate(&self) -> AioResult<()> {
        if self.max_events == 0 {
            return Err(AioError::Config("max_events must be > 0"));
        }
        if self.max_events > defaults::MAX_EVENTS_LIMIT {
            return Err(AioError::Config("max_events must be <= 4096"));
        }
        if self.poll_timeout.is_zero() {
            return Err(AioError::Config("poll_timeout must be > 0"));
        }
        if self.name.is_empty() {
            return Err(AioError::Config("name must not be empty"));
        }
        Ok(())
    }
}

/// Configuration of a worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Settings shared by every worker
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            num_workers: defaults::num_workers(),
            worker: WorkerConfig::new(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `SOCKIO_NUM_WORKERS` - number of worker threads
    /// - plus everything `WorkerConfig::from_env` reads
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get_opt("SOCKIO_NUM_WORKERS").unwrap_or_else(defaults::num_workers),
            worker: WorkerConfig::from_env(),
        }
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.worker.poll_timeout = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.worker.max_events = n;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn validate(&self) -> AioResult<()> {
        if self.num_workers == 0 {
            return Err(AioError::Config("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(AioError::Config("num_workers must be <= 64"));
        }
        self.worker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::new();
        assert!(config.num_workers >= 1 && config.num_workers <= MAX_WORKERS);
        assert_eq!(config.worker.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.worker.max_events, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .num_workers(3)
            .poll_timeout(Duration::from_millis(5))
            .max_events(16);
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.worker.poll_timeout, Duration::from_millis(5));
        assert_eq!(config.worker.max_events, 16);
        assert_eq!(config.worker.thread_name(2), "sockio-worker-2");
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::new().num_workers(0).validate().is_err());
        assert!(PoolConfig::new().num_workers(MAX_WORKERS + 1).validate().is_err());
        assert!(PoolConfig::new().max_events(0).validate().is_err());
        assert!(WorkerConfig::new().poll_timeout(Duration::ZERO).validate().is_err());
        assert_eq!(
            WorkerConfig::new().name("").validate(),
            Err(AioError::Config("name must not be empty"))
        );
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SOCKIO_MAX_EVENTS", "7");
        let config = WorkerConfig::from_env();
        std::env::remove_var("SOCKIO_MAX_EVENTS");
        assert_eq!(config.max_events, 7);
    }
}
