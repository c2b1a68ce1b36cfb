//! # sockio-runtime
//!
//! Linux runtime for the sockio socket engine.
//!
//! This crate provides:
//! - `Worker` event loops, each owning an epoll poller and a task mailbox
//! - `Machine` / `Context`, the way owner state machines run on a worker
//! - `WorkerTask`, the one-shot cross-thread wakeup
//! - `Usock`, the non-blocking socket actor
//! - `WorkerPool` for spreading sockets over several workers
//! - `Thread`, an OS thread wrapper that keeps signals off internal threads
//!
//! ## Example
//!
//! ```ignore
//! use sockio_runtime::{Context, Machine, WorkerPool};
//! use sockio_core::{Event, Owner, Source};
//!
//! struct Listener;
//!
//! impl Machine for Listener {
//!     fn process(&mut self, cx: &mut Context<'_>, src: Source, event: Event) {
//!         if event == Event::Start {
//!             let me = cx.current().unwrap();
//!             let sock = cx.create_usock(Owner::new(me, 1));
//!             // start / bind / listen / accept ...
//!         }
//!     }
//! }
//!
//! let pool = WorkerPool::from_env()?;
//! pool.choose().spawn(Listener)?;
//! ```

pub mod addr;
pub mod config;
pub mod notifier;
pub mod poller;
pub mod pool;
pub mod task;
pub mod thread;
pub mod usock;
pub mod worker;

mod sys;

// Re-exports
pub use addr::SockAddr;
pub use config::{PoolConfig, WorkerConfig};
pub use pool::WorkerPool;
pub use task::{Target, WorkerTask};
pub use thread::Thread;
pub use usock::{Usock, UsockState};
pub use worker::{Context, Job, Machine, Worker, WorkerRef};
