//! `WorkerPool`: a fixed set of workers that sockets are spread across.
//!
//! Workers are created up front and never added or removed. `choose()`
//! hands them out round-robin; callers host a socket's owner machine on
//! the chosen worker and every usock it creates lives there too.

use std::sync::atomic::{AtomicUsize, Ordering};

use sockio_core::error::AioResult;
use sockio_core::kdebug;

use crate::config::PoolConfig;
use crate::worker::{Worker, WorkerRef};

pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Validate `config` and start every worker. Workers already started
    /// are shut down again if a later one fails.
    pub fn start(config: PoolConfig) -> AioResult<Self> {
        config.validate()?;
        let mut workers = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            workers.push(Worker::start(index, config.worker.clone())?);
        }
        kdebug!("pool started with {} workers", workers.len());
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Pool sized and tuned from the environment
    pub fn from_env() -> AioResult<Self> {
        Self::start(PoolConfig::from_env())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Next worker, round-robin
    pub fn choose(&self) -> WorkerRef {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].handle()
    }

    pub fn worker(&self, index: usize) -> Option<WorkerRef> {
        self.workers.get(index).map(Worker::handle)
    }

    /// Shut every worker down, reporting the first failure
    pub fn shutdown(&mut self) -> AioResult<()> {
        let mut first = Ok(());
        for worker in &mut self.workers {
            let res = worker.shutdown();
            if first.is_ok() {
                first = res;
            }
        }
        kdebug!("pool shut down");
        first
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockio_core::error::AioError;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_round_robin() {
        let pool = WorkerPool::start(PoolConfig::new().num_workers(3)).unwrap();
        assert_eq!(pool.len(), 3);
        let picks: Vec<usize> = (0..6).map(|_| pool.choose().index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert!(pool.worker(3).is_none());
    }

    #[test]
    fn test_workers_run_on_distinct_threads() {
        let pool = WorkerPool::start(PoolConfig::new().num_workers(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            pool.choose()
                .execute(move |_cx| {
                    let name = std::thread::current().name().map(str::to_owned);
                    tx.send(name).unwrap();
                })
                .unwrap();
        }
        let mut names: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["sockio-worker-0", "sockio-worker-1"]);
    }

    #[test]
    fn test_invalid_size_rejected() {
        assert!(matches!(
            WorkerPool::start(PoolConfig::new().num_workers(0)),
            Err(AioError::Config(_))
        ));
    }
}
