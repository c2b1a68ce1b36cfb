//! OS thread wrapper for internal threads
//!
//! sockio installs no signal handlers, so every signal must stay
//! deliverable to application threads only. A `Thread` is therefore
//! created with all signals blocked: the caller's mask is widened just
//! around the spawn (the child inherits it) and restored right after.

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use sockio_core::error::{AioError, AioResult, WorkerError};
use std::thread::{self, JoinHandle};

/// A named OS thread running one routine, joined on `term` or drop
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Start `routine` on a new thread with every signal blocked.
    pub fn spawn<F>(name: impl Into<String>, routine: F) -> AioResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();

        let mut old_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut old_mask))
            .map_err(|e| WorkerError::SignalSetupFailed(e as i32))?;

        let spawned = thread::Builder::new().name(name.clone()).spawn(routine);

        // Restore the caller's mask whether or not the spawn worked.
        let restored = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);

        let handle = spawned.map_err(|_| WorkerError::SpawnFailed)?;
        restored.map_err(|e| WorkerError::SignalSetupFailed(e as i32))?;

        Ok(Thread {
            handle: Some(handle),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the routine to return.
    ///
    /// Must not race with other use of this thread object; consuming
    /// `self` makes that structural.
    pub fn term(mut self) -> AioResult<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AioError::Worker(WorkerError::Panicked)),
            None => Ok(()),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::sync::mpsc;

    #[test]
    fn test_routine_runs_with_signals_blocked() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn("sockio-test-mask", move || {
            let mask = SigSet::thread_get_mask().unwrap();
            let name = thread::current().name().map(str::to_owned);
            tx.send((
                mask.contains(Signal::SIGINT),
                mask.contains(Signal::SIGTERM),
                mask.contains(Signal::SIGUSR1),
                name,
            ))
            .unwrap();
        })
        .unwrap();

        let (int, term, usr1, name) = rx.recv().unwrap();
        assert!(int && term && usr1, "internal thread must block all signals");
        assert_eq!(name.as_deref(), Some("sockio-test-mask"));
        assert_eq!(t.name(), "sockio-test-mask");
        t.term().unwrap();
    }

    #[test]
    fn test_caller_mask_is_restored() {
        let before = SigSet::thread_get_mask().unwrap();
        let t = Thread::spawn("sockio-test-restore", || {}).unwrap();
        let after = SigSet::thread_get_mask().unwrap();
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR2, Signal::SIGHUP] {
            assert_eq!(before.contains(sig), after.contains(sig), "{:?}", sig);
        }
        t.term().unwrap();
    }

    #[test]
    fn test_term_reports_panic() {
        let t = Thread::spawn("sockio-test-panic", || panic!("boom")).unwrap();
        assert_eq!(t.term(), Err(AioError::Worker(WorkerError::Panicked)));
    }
}
