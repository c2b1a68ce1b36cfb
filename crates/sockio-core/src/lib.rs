//! # sockio-core
//!
//! Core types for the sockio asynchronous socket engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The epoll workers, task mailboxes and the usock socket actor live in
//! `sockio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Identifiers for usocks and owner machines hosted by a worker
//! - `event` - Event sources and the event catalogue
//! - `fsm` - State machine base: lifecycle phase, owner subscription, event queue
//! - `batch` - Bounded read-ahead window used for batch reads
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod event;
pub mod fsm;
pub mod batch;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{MachineId, UsockId};
pub use event::{Event, Source, SRC_ACTION};
pub use fsm::{EventQueue, Fsm, Owner, Phase, Raised};
pub use batch::BatchWindow;
pub use error::{AioError, AioResult, WorkerError};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Fixed limits of the socket actor
pub mod constants {
    /// Maximum number of buffers passed to a single usock send
    pub const MAX_IOVCNT: usize = 3;

    /// Size of the read-ahead buffer used for batch reads.
    /// Keep it above the network MTU.
    pub const BATCH_SIZE: usize = 2048;

    /// Maximum workers in one pool
    pub const MAX_WORKERS: usize = 64;
}
