//! Worker tasks: one-shot wakeups delivered into a worker's loop
//!
//! Firing a task is the only way another thread reaches an object hosted
//! by a worker. The firing thread pushes a mail entry and pokes the
//! worker's notifier; the worker later delivers `Event::Task` to the
//! target on its own thread, in firing order.
//!
//! A task is armed at most once at a time. Firing it again before the
//! previous firing was delivered is refused with `TaskPending`, so one
//! firing always maps to exactly one delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sockio_core::error::{AioError, AioResult};
use sockio_core::{MachineId, Source, UsockId};

use crate::worker::{Mail, WorkerRef};

/// Object a task is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Usock(UsockId),
    Machine(MachineId),
}

/// One-shot cross-thread wakeup bound to a target on a given worker
#[derive(Debug, Clone)]
pub struct WorkerTask {
    target: Target,
    src: Source,
    fired: Arc<AtomicBool>,
}

impl WorkerTask {
    pub fn new(target: Target, src: Source) -> Self {
        Self {
            target,
            src,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn target(&self) -> Target {
        self.target
    }

    #[inline]
    pub fn src(&self) -> Source {
        self.src
    }

    /// Fired and not yet delivered
    #[inline]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Schedule delivery of `Event::Task` to the target on `worker`.
    ///
    /// Callable from any thread.
    pub fn fire(&self, worker: &WorkerRef) -> AioResult<()> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return Err(AioError::TaskPending);
        }
        let mail = Mail::Task {
            target: self.target,
            src: self.src,
            fired: Arc::clone(&self.fired),
        };
        if let Err(e) = worker.post(mail) {
            self.fired.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::{Context, Machine, Worker};
    use sockio_core::Event;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Counter {
        tx: mpsc::Sender<(Source, Event)>,
    }

    impl Machine for Counter {
        fn process(&mut self, _cx: &mut Context<'_>, src: Source, event: Event) {
            let _ = self.tx.send((src, event));
        }
    }

    #[test]
    fn test_second_fire_before_delivery_is_rejected() {
        let worker = Worker::start(0, WorkerConfig::new()).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = worker.spawn(Counter { tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, Event::Start);

        // Park the worker so nothing is delivered while we fire.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        worker
            .execute(move |_cx| {
                let _ = release_rx.recv_timeout(WAIT);
            })
            .unwrap();

        let task = WorkerTask::new(Target::Machine(id), 5);
        task.fire(&worker.handle()).unwrap();
        assert!(task.is_fired());
        assert_eq!(task.fire(&worker.handle()), Err(AioError::TaskPending));
        release_tx.send(()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (5, Event::Task));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "delivered once");
        assert!(!task.is_fired());

        // Delivered, so it can fire again.
        task.fire(&worker.handle()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (5, Event::Task));
    }

    #[test]
    fn test_fire_at_stopped_worker_disarms() {
        let mut worker = Worker::start(0, WorkerConfig::new()).unwrap();
        let handle = worker.handle();
        worker.shutdown().unwrap();

        let task = WorkerTask::new(Target::Machine(sockio_core::MachineId::new(1)), 0);
        assert!(task.fire(&handle).is_err());
        assert!(!task.is_fired());
    }
}
