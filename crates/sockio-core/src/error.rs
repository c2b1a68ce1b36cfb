//! Error types for sockio
//!
//! Only local, synchronous failures are errors. Failures of deferred
//! socket operations travel as events (`Event::Error`, `Event::AcceptError`,
//! `Event::Shutdown`) and are never reported twice.

use core::fmt;

/// Result type for sockio operations
pub type AioResult<T> = Result<T, AioError>;

/// Errors returned at the call site of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AioError {
    /// Operation is not legal in the current state; nothing changed
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// Argument rejected before any syscall was made
    InvalidArgument(&'static str),

    /// A send or receive is already outstanding
    Busy(&'static str),

    /// `connect` issued before `bind`
    NotBound,

    /// Teardown requested while asynchronous work is still pending
    NotIdle,

    /// Worker task fired again before its previous firing was delivered
    TaskPending,

    /// Unknown usock or machine id on this worker
    NotFound,

    /// Synchronous syscall failed with errno
    Os(i32),

    /// Worker thread error
    Worker(WorkerError),

    /// Configuration rejected by validation
    Config(&'static str),
}

impl fmt::Display for AioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AioError::InvalidState { op, state } => {
                write!(f, "{} not allowed in state {}", op, state)
            }
            AioError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            AioError::Busy(op) => write!(f, "{} already in progress", op),
            AioError::NotBound => write!(f, "socket must be bound before connecting"),
            AioError::NotIdle => write!(f, "state machine is not idle"),
            AioError::TaskPending => write!(f, "task already fired and not yet delivered"),
            AioError::NotFound => write!(f, "no such object on this worker"),
            AioError::Os(errno) => write!(f, "OS error: errno {}", errno),
            AioError::Worker(e) => write!(f, "worker error: {}", e),
            AioError::Config(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for AioError {}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn the worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// Worker was shut down and accepts no more work
    ShutDown,

    /// Poller or notifier could not be created (errno)
    PollerSetup(i32),

    /// Signal mask manipulation failed (errno)
    SignalSetupFailed(i32),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::ShutDown => write!(f, "worker is shut down"),
            WorkerError::PollerSetup(e) => write!(f, "poller setup failed: errno {}", e),
            WorkerError::SignalSetupFailed(e) => write!(f, "signal setup failed: errno {}", e),
        }
    }
}

impl From<WorkerError> for AioError {
    fn from(e: WorkerError) -> Self {
        AioError::Worker(e)
    }
}
