//! # Worker: one OS thread, one poller, one mailbox
//!
//! A worker hosts usocks and owner machines. Everything it hosts is
//! created, mutated and destroyed on the worker thread only, so none of
//! it needs a lock. Other threads reach the worker through a `WorkerRef`,
//! which can post mail (fire tasks, run closures, spawn machines) and
//! nothing else.
//!
//! ```text
//!   app thread ── WorkerRef::post ──► mailbox (SegQueue) ──┐
//!                       │                                  │
//!                       └──► eventfd ──► epoll_wait ◄── fds │
//!                                          │               │
//!                       readiness dispatch ┴── mailbox drain
//!                                          │
//!                          raised events ──► owner machines
//! ```
//!
//! ## Loop iteration
//!
//! 1. Wait for readiness. The timeout is zero while mail is queued.
//! 2. Deliver readiness per descriptor: read, then write, then hangup.
//! 3. Drain the mailbox, but only the entries present when the drain
//!    began; mail posted meanwhile waits for the next iteration.
//! 4. After every single delivery, deliver the events it raised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use sockio_core::error::{AioError, AioResult, WorkerError};
use sockio_core::{kdebug, kerror, ktrace};
use sockio_core::{Event, EventQueue, MachineId, Owner, Source, UsockId, SRC_ACTION};

use crate::config::WorkerConfig;
use crate::notifier::EventFdNotifier;
use crate::poller::{Poller, Readiness, NOTIFIER_KEY};
use crate::task::{Target, WorkerTask};
use crate::thread::Thread;
use crate::usock::Usock;

// ── Machines ─────────────────────────────────────────────────────────

/// An owner state machine hosted by a worker.
///
/// `process` receives `Event::Start` (source `SRC_ACTION`) once right after
/// the machine is spawned, then every event raised to it and every task
/// fired at it.
pub trait Machine: Send + 'static {
    fn process(&mut self, cx: &mut Context<'_>, src: Source, event: Event);
}

/// Closure run on the worker thread
pub type Job = Box<dyn FnOnce(&mut Context<'_>) + Send + 'static>;

// ── Mailbox ──────────────────────────────────────────────────────────

pub(crate) enum Mail {
    Task {
        target: Target,
        src: Source,
        fired: Arc<AtomicBool>,
    },
    Execute(Job),
    Spawn {
        id: MachineId,
        machine: Box<dyn Machine>,
    },
}

/// State shared between a worker thread and its handles
struct WorkerShared {
    index: usize,
    mailbox: SegQueue<Mail>,
    notifier: EventFdNotifier,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl WorkerShared {
    #[inline]
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Cross-thread handle to a worker
#[derive(Clone)]
pub struct WorkerRef {
    shared: Arc<WorkerShared>,
}

impl WorkerRef {
    /// Position of the worker in its pool
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Host `machine` on this worker. It receives `Event::Start` on the
    /// worker thread.
    pub fn spawn<M: Machine>(&self, machine: M) -> AioResult<MachineId> {
        let id = MachineId::new(self.shared.next_id());
        self.post(Mail::Spawn {
            id,
            machine: Box::new(machine),
        })?;
        Ok(id)
    }

    /// Run `job` on the worker thread
    pub fn execute<F>(&self, job: F) -> AioResult<()>
    where
        F: FnOnce(&mut Context<'_>) + Send + 'static,
    {
        self.post(Mail::Execute(Box::new(job)))
    }

    pub(crate) fn post(&self, mail: Mail) -> AioResult<()> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown.into());
        }
        self.shared.mailbox.push(mail);
        self.shared.notifier.notify();
        Ok(())
    }
}

impl std::fmt::Debug for WorkerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRef")
            .field("index", &self.shared.index)
            .field("queued", &self.shared.mailbox.len())
            .finish()
    }
}

// ── Worker ───────────────────────────────────────────────────────────

/// A running worker thread. Dropping it shuts the worker down.
pub struct Worker {
    handle: WorkerRef,
    thread: Option<Thread>,
}

impl Worker {
    /// Create the poller and notifier, then start the worker thread
    pub fn start(index: usize, config: WorkerConfig) -> AioResult<Worker> {
        config.validate()?;

        let notifier = EventFdNotifier::create()?;
        let mut poller = Poller::new(config.max_events)?;
        poller.add_notifier(notifier.fd())?;

        let shared = Arc::new(WorkerShared {
            index,
            mailbox: SegQueue::new(),
            notifier,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        let handle = WorkerRef { shared };

        let mut reactor = Reactor {
            handle: handle.clone(),
            poller,
            usocks: HashMap::new(),
            machines: HashMap::new(),
            events: EventQueue::new(),
            ready: Vec::with_capacity(config.max_events),
            config: config.clone(),
        };
        let thread = Thread::spawn(config.thread_name(index), move || reactor.run())?;

        kdebug!("worker {} started", index);
        Ok(Worker {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerRef {
        self.handle.clone()
    }

    pub fn index(&self) -> usize {
        self.handle.index()
    }

    pub fn spawn<M: Machine>(&self, machine: M) -> AioResult<MachineId> {
        self.handle.spawn(machine)
    }

    pub fn execute<F>(&self, job: F) -> AioResult<()>
    where
        F: FnOnce(&mut Context<'_>) + Send + 'static,
    {
        self.handle.execute(job)
    }

    /// Stop the loop and join the thread. Mail still queued is dropped
    /// and so is everything the worker hosts.
    pub fn shutdown(&mut self) -> AioResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.handle.shared.shutdown.store(true, Ordering::Release);
        self.handle.shared.notifier.notify();
        thread.term()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kerror!("worker {}: {}", self.index(), e);
        }
    }
}

// ── Context ──────────────────────────────────────────────────────────

/// Access to the hosting worker, handed to everything running on it
pub struct Context<'a> {
    handle: &'a WorkerRef,
    poller: &'a mut Poller,
    usocks: &'a mut HashMap<UsockId, Box<Usock>>,
    machines: &'a mut HashMap<MachineId, Box<dyn Machine>>,
    events: &'a mut EventQueue,
    current: Option<MachineId>,
    retired: bool,
}

impl<'a> Context<'a> {
    /// Handle to this worker, e.g. to pass to other threads
    pub fn worker(&self) -> WorkerRef {
        self.handle.clone()
    }

    /// Machine whose `process` is running, if any
    pub fn current(&self) -> Option<MachineId> {
        self.current
    }

    /// Create an idle usock raising its events to `owner`
    pub fn create_usock(&mut self, owner: Owner) -> UsockId {
        let id = UsockId::new(self.handle.shared.next_id());
        self.usocks.insert(id, Box::new(Usock::new(id, Some(owner))));
        ktrace!("{} created for {}", id, owner.machine);
        id
    }

    /// Destroy an idle usock. A usock with work outstanding is refused.
    pub fn destroy_usock(&mut self, id: UsockId) -> AioResult<()> {
        let usock = self.usocks.get(&id).ok_or(AioError::NotFound)?;
        usock.term()?;
        self.usocks.remove(&id);
        ktrace!("{} destroyed", id);
        Ok(())
    }

    pub fn usock(&self, id: UsockId) -> Option<&Usock> {
        self.usocks.get(&id).map(|u| &**u)
    }

    /// Run `f` on usock `id`. `NotFound` when the id is unknown or the
    /// usock is already in use further up the stack.
    pub fn with_usock<R, F>(&mut self, id: UsockId, f: F) -> AioResult<R>
    where
        F: FnOnce(&mut Usock, &mut Context<'_>) -> R,
    {
        let mut usock = self.usocks.remove(&id).ok_or(AioError::NotFound)?;
        let ret = f(&mut usock, self);
        self.usocks.insert(id, usock);
        Ok(ret)
    }

    /// Host a new machine; it receives `Event::Start` after the current
    /// delivery returns.
    pub fn spawn<M: Machine>(&mut self, machine: M) -> MachineId {
        let id = MachineId::new(self.handle.shared.next_id());
        self.machines.insert(id, Box::new(machine));
        self.events.push(Owner::new(id, SRC_ACTION), Event::Start);
        id
    }

    /// Drop machine `id`. A machine may retire itself.
    pub fn retire(&mut self, id: MachineId) {
        if self.current == Some(id) {
            self.retired = true;
        } else {
            self.machines.remove(&id);
        }
    }

    /// Queue `event` for `owner`
    pub fn raise(&mut self, owner: Owner, event: Event) {
        self.events.push(owner, event);
    }

    /// Fire `task` at this worker
    pub fn fire(&mut self, task: &WorkerTask) -> AioResult<()> {
        task.fire(self.handle)
    }

    /// Fire `task` unless a firing is already on its way
    pub(crate) fn arm(&mut self, task: &WorkerTask) -> AioResult<()> {
        if task.is_fired() {
            return Ok(());
        }
        task.fire(self.handle)
    }

    #[inline]
    pub(crate) fn poller(&mut self) -> &mut Poller {
        &mut *self.poller
    }

    #[inline]
    pub(crate) fn events(&mut self) -> &mut EventQueue {
        &mut *self.events
    }
}

// ── Event loop ───────────────────────────────────────────────────────

/// Everything the worker thread owns
struct Reactor {
    handle: WorkerRef,
    poller: Poller,
    usocks: HashMap<UsockId, Box<Usock>>,
    machines: HashMap<MachineId, Box<dyn Machine>>,
    events: EventQueue,
    ready: Vec<(u64, Readiness)>,
    config: WorkerConfig,
}

impl Reactor {
    fn run(&mut self) {
        let shared = Arc::clone(&self.handle.shared);
        kdebug!("worker {} loop running", shared.index);

        while !shared.shutdown.load(Ordering::Acquire) {
            let timeout = if shared.mailbox.is_empty() {
                self.config.poll_timeout
            } else {
                std::time::Duration::ZERO
            };

            self.ready.clear();
            let mut ready = std::mem::take(&mut self.ready);
            if let Err(e) = self.poller.wait(timeout, &mut ready) {
                kerror!("worker {}: poller wait failed: {}", shared.index, e);
                std::process::abort();
            }

            let mut notified = false;
            for &(key, fired) in &ready {
                if key == NOTIFIER_KEY {
                    notified = true;
                    continue;
                }
                self.dispatch_ready(UsockId::new(key), fired);
            }
            self.ready = ready;

            if notified {
                shared.notifier.drain();
            }

            // Mail posted while draining waits for the next round.
            let budget = shared.mailbox.len();
            for _ in 0..budget {
                let Some(mail) = shared.mailbox.pop() else {
                    break;
                };
                self.dispatch_mail(mail);
            }
        }

        kdebug!(
            "worker {} stopped: {} usocks, {} machines, {} mail dropped",
            shared.index,
            self.usocks.len(),
            self.machines.len(),
            shared.mailbox.len()
        );
    }

    fn context(&mut self, current: Option<MachineId>) -> Context<'_> {
        Context {
            handle: &self.handle,
            poller: &mut self.poller,
            usocks: &mut self.usocks,
            machines: &mut self.machines,
            events: &mut self.events,
            current,
            retired: false,
        }
    }

    fn dispatch_ready(&mut self, id: UsockId, fired: Readiness) {
        let Some(mut usock) = self.usocks.remove(&id) else {
            ktrace!("readiness for unknown {}", id);
            return;
        };
        {
            let mut cx = self.context(None);
            usock.ready(&mut cx, fired);
        }
        self.usocks.insert(id, usock);
        self.drain_events();
    }

    fn dispatch_mail(&mut self, mail: Mail) {
        match mail {
            Mail::Task { target, src, fired } => {
                fired.store(false, Ordering::Release);
                match target {
                    Target::Usock(id) => self.deliver_usock(id, src, Event::Task),
                    Target::Machine(id) => self.deliver_machine(id, src, Event::Task),
                }
            }
            Mail::Execute(job) => {
                let mut cx = self.context(None);
                job(&mut cx);
            }
            Mail::Spawn { id, machine } => {
                self.machines.insert(id, machine);
                self.deliver_machine(id, SRC_ACTION, Event::Start);
            }
        }
        self.drain_events();
    }

    fn deliver_usock(&mut self, id: UsockId, src: Source, event: Event) {
        let Some(mut usock) = self.usocks.remove(&id) else {
            ktrace!("{} for unknown {} dropped", event.name(), id);
            return;
        };
        {
            let mut cx = self.context(None);
            usock.process(&mut cx, src, event);
        }
        self.usocks.insert(id, usock);
    }

    fn deliver_machine(&mut self, id: MachineId, src: Source, event: Event) {
        let Some(mut machine) = self.machines.remove(&id) else {
            ktrace!("{} for unknown {} dropped", event.name(), id);
            return;
        };
        let retired = {
            let mut cx = self.context(Some(id));
            machine.process(&mut cx, src, event);
            cx.retired
        };
        if retired {
            ktrace!("{} retired", id);
        } else {
            self.machines.insert(id, machine);
        }
    }

    fn drain_events(&mut self) {
        while let Some(raised) = self.events.pop() {
            ktrace!("deliver {} to {} (src {})", raised.event.name(), raised.to, raised.src);
            self.deliver_machine(raised.to, raised.src, raised.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn start_worker() -> Worker {
        Worker::start(0, WorkerConfig::new().poll_timeout(Duration::from_millis(20))).unwrap()
    }

    /// Reports every event it sees
    struct Probe {
        tx: mpsc::Sender<(Source, Event)>,
    }

    impl Machine for Probe {
        fn process(&mut self, _cx: &mut Context<'_>, src: Source, event: Event) {
            let _ = self.tx.send((src, event));
        }
    }

    #[test]
    fn test_spawn_delivers_start() {
        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        worker.spawn(Probe { tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (SRC_ACTION, Event::Start));
    }

    #[test]
    fn test_execute_runs_on_worker_thread() {
        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        worker
            .execute(move |cx| {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send((name, cx.worker().index())).unwrap();
            })
            .unwrap();
        let (name, index) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(name.as_deref(), Some("sockio-worker-0"));
        assert_eq!(index, 0);
    }

    #[test]
    fn test_mail_is_delivered_in_order() {
        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        for i in 0..100u32 {
            let tx = tx.clone();
            worker.execute(move |_cx| tx.send(i).unwrap()).unwrap();
        }
        let got: Vec<u32> = (0..100).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_raised_events_follow_the_delivery() {
        struct Relay {
            peer: Option<MachineId>,
            tx: mpsc::Sender<&'static str>,
        }

        impl Machine for Relay {
            fn process(&mut self, cx: &mut Context<'_>, _src: Source, event: Event) {
                match event {
                    Event::Start => {
                        if let Some(peer) = self.peer {
                            cx.raise(Owner::new(peer, 9), Event::User(1));
                            self.tx.send("raised").unwrap();
                        }
                    }
                    Event::User(1) => self.tx.send("received").unwrap(),
                    _ => {}
                }
            }
        }

        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        let sink = worker.spawn(Relay { peer: None, tx: tx.clone() }).unwrap();
        worker.spawn(Relay { peer: Some(sink), tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "raised");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "received");
    }

    #[test]
    fn test_retired_machine_gets_nothing_more() {
        struct Quitter {
            tx: mpsc::Sender<Event>,
        }

        impl Machine for Quitter {
            fn process(&mut self, cx: &mut Context<'_>, _src: Source, event: Event) {
                self.tx.send(event.clone()).unwrap();
                if event == Event::Start {
                    let me = cx.current().unwrap();
                    cx.raise(Owner::new(me, 0), Event::User(7));
                    cx.retire(me);
                }
            }
        }

        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        worker.spawn(Quitter { tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Start);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_machine_task_delivery() {
        let worker = start_worker();
        let (tx, rx) = mpsc::channel();
        let id = worker.spawn(Probe { tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, Event::Start);

        let task = WorkerTask::new(Target::Machine(id), 33);
        task.fire(&worker.handle()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (33, Event::Task));
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let mut worker = start_worker();
        let handle = worker.handle();
        worker.shutdown().unwrap();
        assert!(handle.is_shut_down());
        assert_eq!(
            handle.execute(|_cx| {}),
            Err(AioError::Worker(WorkerError::ShutDown))
        );
        // Second shutdown is a no-op.
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorkerConfig::new().max_events(0);
        assert!(matches!(Worker::start(0, config), Err(AioError::Config(_))));
    }
}
