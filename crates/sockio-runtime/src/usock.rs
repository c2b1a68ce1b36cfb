//! # Usock: the socket actor
//!
//! A `Usock` wraps one non-blocking OS socket and turns its operations
//! into events raised to an owner machine. It lives in a worker's
//! registry and is only ever touched on that worker's thread.
//!
//! ```text
//!            start                 listen
//!   Idle ───────────► Starting ────────────► Listening ◄──┐
//!    │                   │  connect               │ accept │ accepted /
//!    │ accept            ▼                        ▼        │ cancelled
//!    │              Connecting ──► Connected   Accepting ──┘
//!    ▼                               │ activate
//!  BeingAccepted ──► Accepted ───────┴────────► Active
//!
//!   any open state ──(error)──► Error        stop ──► Stopping ──► Idle
//! ```
//!
//! Operations that cannot finish immediately arm one of six internal
//! worker tasks. The task delivery then registers the descriptor with
//! the poller and sets the interest the operation waits for. Because a
//! worker's mailbox is FIFO, `stop` cancels everything in flight simply
//! by firing its own task last and finishing when that task arrives.

use std::os::unix::io::RawFd;

use sockio_core::constants::{BATCH_SIZE, MAX_IOVCNT};
use sockio_core::error::{AioError, AioResult};
use sockio_core::{kerror, ktrace};
use sockio_core::{BatchWindow, Event, Fsm, Owner, Source, UsockId};

use crate::addr::SockAddr;
use crate::poller::{Readiness, WorkerFd};
use crate::sys::{close_fd, errno, take_socket_error, would_block};
use crate::task::{Target, WorkerTask};
use crate::worker::Context;

// Internal event sources
const SRC_FD: Source = 1;
const SRC_TASK_CONNECTING: Source = 2;
const SRC_TASK_CONNECTED: Source = 3;
const SRC_TASK_ACCEPT: Source = 4;
const SRC_TASK_SEND: Source = 5;
const SRC_TASK_RECV: Source = 6;
const SRC_TASK_STOP: Source = 7;

/// Usock states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsockState {
    Idle,
    Starting,
    BeingAccepted,
    Accepted,
    Connecting,
    Connected,
    Active,
    Listening,
    Accepting,
    Error,
    Stopping,
}

impl UsockState {
    pub fn name(self) -> &'static str {
        match self {
            UsockState::Idle => "idle",
            UsockState::Starting => "starting",
            UsockState::BeingAccepted => "being-accepted",
            UsockState::Accepted => "accepted",
            UsockState::Connecting => "connecting",
            UsockState::Connected => "connected",
            UsockState::Active => "active",
            UsockState::Listening => "listening",
            UsockState::Accepting => "accepting",
            UsockState::Error => "error",
            UsockState::Stopping => "stopping",
        }
    }
}

/// Outcome of an accept attempt on a listener
enum AcceptOutcome {
    Accepted(RawFd),
    Pending,
    Failed,
}

/// Receive side
#[derive(Debug)]
struct Inbound {
    /// Destination of the outstanding receive
    buf: Vec<u8>,
    /// Bytes the outstanding receive asked for
    want: usize,
    busy: bool,
    batch: BatchWindow,
}

impl Inbound {
    fn reset(&mut self) {
        self.buf = Vec::new();
        self.want = 0;
        self.busy = false;
        self.batch.clear();
    }
}

/// Send side: up to `MAX_IOVCNT` buffers and a cursor into them
#[derive(Debug, Default)]
struct Outbound {
    iov: Vec<Vec<u8>>,
    idx: usize,
    off: usize,
    total: usize,
    busy: bool,
}

impl Outbound {
    fn load(&mut self, bufs: Vec<Vec<u8>>) {
        self.total = bufs.iter().map(Vec::len).sum();
        self.iov = bufs;
        self.idx = 0;
        self.off = 0;
        self.busy = true;
        self.skip_empty();
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 && self.idx < self.iov.len() {
            let rem = self.iov[self.idx].len() - self.off;
            if n >= rem {
                n -= rem;
                self.idx += 1;
                self.off = 0;
            } else {
                self.off += n;
                n = 0;
            }
        }
        self.skip_empty();
    }

    fn skip_empty(&mut self) {
        while self.idx < self.iov.len() && self.iov[self.idx].len() == self.off {
            self.idx += 1;
            self.off = 0;
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.idx >= self.iov.len()
    }

    fn reset(&mut self) {
        *self = Outbound::default();
    }
}

/// The socket actor
pub struct Usock {
    fsm: Fsm<UsockState>,
    id: UsockId,
    fd: RawFd,
    wfd: WorkerFd,
    bound: bool,
    inp: Inbound,
    out: Outbound,

    task_connecting: WorkerTask,
    task_connected: WorkerTask,
    task_accept: WorkerTask,
    task_send: WorkerTask,
    task_recv: WorkerTask,
    task_stop: WorkerTask,

    /// Listener <-> accepted socket link while an accept is pending
    peer: Option<UsockId>,
    /// Last error; reported by `geterrno` in the Error state
    errnum: i32,
}

impl Usock {
    pub(crate) fn new(id: UsockId, owner: Option<Owner>) -> Self {
        let task = |src| WorkerTask::new(Target::Usock(id), src);
        Self {
            fsm: Fsm::new(UsockState::Idle, owner),
            id,
            fd: -1,
            wfd: WorkerFd::new(-1, id.as_u64()),
            bound: false,
            inp: Inbound {
                buf: Vec::new(),
                want: 0,
                busy: false,
                batch: BatchWindow::new(BATCH_SIZE),
            },
            out: Outbound::default(),
            task_connecting: task(SRC_TASK_CONNECTING),
            task_connected: task(SRC_TASK_CONNECTED),
            task_accept: task(SRC_TASK_ACCEPT),
            task_send: task(SRC_TASK_SEND),
            task_recv: task(SRC_TASK_RECV),
            task_stop: task(SRC_TASK_STOP),
            peer: None,
            errnum: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> UsockId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> UsockState {
        self.fsm.state()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.fsm.is_idle()
    }

    /// Refuses teardown unless idle
    pub fn term(&self) -> AioResult<()> {
        self.fsm.term()
    }

    pub fn owner(&self) -> Option<Owner> {
        self.fsm.owner()
    }

    /// Redirect future events to `owner`; returns the previous owner
    pub fn swap_owner(&mut self, owner: Owner) -> Option<Owner> {
        self.fsm.swap_owner(owner)
    }

    /// Error that moved the socket into the Error state
    pub fn geterrno(&self) -> Option<i32> {
        if self.state() == UsockState::Error {
            Some(self.errnum)
        } else {
            None
        }
    }

    fn check(&self, op: &'static str, legal: bool) -> AioResult<()> {
        if legal {
            Ok(())
        } else {
            Err(AioError::InvalidState {
                op,
                state: self.state().name(),
            })
        }
    }

    // ── Synchronous setup ────────────────────────────────────────────

    /// Open a non-blocking, close-on-exec socket
    pub fn start(&mut self, domain: i32, ty: i32, protocol: i32) -> AioResult<()> {
        self.check("start", self.state() == UsockState::Idle)?;
        self.fsm.start()?;
        let fd = unsafe {
            libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol)
        };
        if fd < 0 {
            self.fsm.reset();
            return Err(AioError::Os(errno()));
        }
        self.init_from_fd(fd);
        self.fsm.enter(UsockState::Starting);
        Ok(())
    }

    pub fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> AioResult<()> {
        use UsockState::*;
        self.check(
            "setsockopt",
            matches!(self.state(), Starting | Listening | Accepted | Connected | Active),
        )?;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(AioError::Os(errno()));
        }
        Ok(())
    }

    pub fn setsockopt_int(&mut self, level: i32, name: i32, value: i32) -> AioResult<()> {
        self.setsockopt(level, name, &(value as libc::c_int).to_ne_bytes())
    }

    pub fn bind(&mut self, addr: &SockAddr) -> AioResult<()> {
        self.check("bind", self.state() == UsockState::Starting)?;
        let rc = unsafe { libc::bind(self.fd, addr.as_ptr(), addr.len()) };
        if rc < 0 {
            return Err(AioError::Os(errno()));
        }
        self.bound = true;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> AioResult<()> {
        self.check("listen", self.state() == UsockState::Starting)?;
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc < 0 {
            return Err(AioError::Os(errno()));
        }
        self.fsm.enter(UsockState::Listening);
        Ok(())
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> AioResult<SockAddr> {
        self.check("local_addr", self.fd >= 0)?;
        let mut addr = SockAddr::empty();
        let rc = unsafe { libc::getsockname(self.fd, addr.as_mut_ptr(), addr.len_mut()) };
        if rc < 0 {
            return Err(AioError::Os(errno()));
        }
        Ok(addr)
    }

    // ── Connection establishment ─────────────────────────────────────

    /// Start connecting. Completion is reported as `Connected` or
    /// `Error(errno)`.
    pub fn connect(&mut self, cx: &mut Context<'_>, addr: &SockAddr) -> AioResult<()> {
        self.check("connect", self.state() == UsockState::Starting)?;
        if !self.bound {
            return Err(AioError::NotBound);
        }
        let rc = unsafe { libc::connect(self.fd, addr.as_ptr(), addr.len()) };
        self.fsm.enter(UsockState::Connecting);
        if rc == 0 {
            self.fsm.enter(UsockState::Connected);
            self.fsm.raise(cx.events(), Event::Connected);
            return Ok(());
        }
        match errno() {
            libc::EINPROGRESS => cx.arm(&self.task_connecting),
            e => {
                self.enter_error(cx, e);
                Ok(())
            }
        }
    }

    /// Accept the next connection of `listener` into this socket.
    /// Completion is reported as `Accepted` here; a failure as
    /// `AcceptError(errno)` on the listener.
    pub fn accept(&mut self, cx: &mut Context<'_>, listener: UsockId) -> AioResult<()> {
        let unpaired = self.state() == UsockState::BeingAccepted && self.peer.is_none();
        self.check("accept", self.state() == UsockState::Idle || unpaired)?;
        if listener == self.id {
            return Err(AioError::InvalidArgument("socket cannot accept into itself"));
        }
        let lstate = cx.usock(listener).ok_or(AioError::NotFound)?.state();
        if lstate != UsockState::Listening {
            return Err(AioError::InvalidState {
                op: "accept",
                state: lstate.name(),
            });
        }

        if self.state() == UsockState::Idle {
            self.fsm.start()?;
            self.fsm.enter(UsockState::BeingAccepted);
        }

        let me = self.id;
        match cx.with_usock(listener, |l, cx| l.begin_accept(cx, me))? {
            AcceptOutcome::Accepted(fd) => {
                self.complete_accept(cx, fd);
            }
            AcceptOutcome::Pending => self.peer = Some(listener),
            AcceptOutcome::Failed => {}
        }
        Ok(())
    }

    /// Accepted or Connected -> Active
    pub fn activate(&mut self, cx: &mut Context<'_>) -> AioResult<()> {
        self.check(
            "activate",
            matches!(self.state(), UsockState::Accepted | UsockState::Connected),
        )?;
        self.fsm.enter(UsockState::Active);
        cx.arm(&self.task_connected)
    }

    // ── Data transfer ────────────────────────────────────────────────

    /// Send `bufs` as one gathered write. `Sent(total)` is raised once
    /// every byte is handed to the kernel.
    pub fn send(&mut self, cx: &mut Context<'_>, bufs: Vec<Vec<u8>>) -> AioResult<()> {
        self.check("send", self.state() == UsockState::Active)?;
        if self.out.busy {
            return Err(AioError::Busy("send"));
        }
        if bufs.len() > MAX_IOVCNT {
            return Err(AioError::InvalidArgument("too many buffers"));
        }

        self.out.load(bufs);
        match self.send_raw() {
            Ok(true) => {
                self.send_done(cx);
                Ok(())
            }
            Ok(false) => cx.arm(&self.task_send),
            Err(e) => {
                self.enter_error(cx, e);
                Ok(())
            }
        }
    }

    /// Receive exactly `len` bytes, raised as `Received(bytes)`
    pub fn recv(&mut self, cx: &mut Context<'_>, len: usize) -> AioResult<()> {
        self.check("recv", self.state() == UsockState::Active)?;
        if self.inp.busy {
            return Err(AioError::Busy("recv"));
        }
        self.inp.buf = Vec::with_capacity(len);
        self.inp.want = len;
        self.inp.busy = true;
        self.pump_in(cx, true)
    }

    /// One `sendmsg` of whatever is left. `Ok(true)` once all of it went
    /// out; `Ok(false)` when the caller must wait for write readiness.
    fn send_raw(&mut self) -> Result<bool, i32> {
        if self.out.is_done() {
            return Ok(true);
        }
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_IOVCNT];
        let mut n = 0;
        for (i, buf) in self.out.iov[self.out.idx..].iter().enumerate() {
            let start = if i == 0 { self.out.off } else { 0 };
            iov[n] = libc::iovec {
                iov_base: buf[start..].as_ptr() as *mut libc::c_void,
                iov_len: buf.len() - start,
            };
            n += 1;
        }
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = n as _;

        let rc = unsafe { libc::sendmsg(self.fd, &msg, libc::MSG_NOSIGNAL) };
        if rc < 0 {
            let e = errno();
            if e == libc::EINTR || would_block(e) {
                return Ok(false);
            }
            return Err(e);
        }
        self.out.advance(rc as usize);
        Ok(self.out.is_done())
    }

    fn send_done(&mut self, cx: &mut Context<'_>) {
        let total = self.out.total;
        self.out.reset();
        self.fsm.raise(cx.events(), Event::Sent(total));
    }

    /// Move bytes into the outstanding receive, with at most one read
    /// syscall per call. `first` is set on the call from `recv`, which has
    /// no read interest armed yet.
    fn pump_in(&mut self, cx: &mut Context<'_>, first: bool) -> AioResult<()> {
        let mut attempted = false;
        loop {
            let need = self.inp.want - self.inp.buf.len();
            if need == 0 {
                let data = std::mem::take(&mut self.inp.buf);
                self.inp.busy = false;
                self.inp.want = 0;
                self.fsm.raise(cx.events(), Event::Received(data));
                return Ok(());
            }

            if !self.inp.batch.is_empty() {
                self.inp.batch.drain_into(&mut self.inp.buf, need);
                continue;
            }
            if attempted {
                return self.await_readable(cx, first);
            }
            attempted = true;

            // Large reads bypass the window; small ones refill it.
            let fd = self.fd;
            let res = if need > self.inp.batch.capacity() {
                read_append(fd, &mut self.inp.buf, need)
            } else {
                self.inp.batch.fill(|slot| read_into(fd, slot))
            };

            match res {
                Ok(0) => {
                    self.on_peer_closed(cx);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e == libc::EINTR || would_block(e) => {
                    return self.await_readable(cx, first);
                }
                Err(e) => {
                    self.enter_error(cx, e);
                    return Ok(());
                }
            }
        }
    }

    /// Continue an unfinished receive once the socket is readable
    fn await_readable(&mut self, cx: &mut Context<'_>, first: bool) -> AioResult<()> {
        if first {
            return cx.arm(&self.task_recv);
        }
        cx.poller().set_in(&mut self.wfd);
        Ok(())
    }

    // ── Stop ─────────────────────────────────────────────────────────

    /// Release the socket. Ends with exactly one `Stopped`, raised now if
    /// nothing is in flight, otherwise once every armed task has drained.
    /// Idempotent.
    pub fn stop(&mut self, cx: &mut Context<'_>) -> AioResult<()> {
        match self.state() {
            UsockState::Idle | UsockState::Stopping => return Ok(()),
            UsockState::Accepting => {
                return Err(AioError::InvalidState {
                    op: "stop",
                    state: UsockState::Accepting.name(),
                })
            }
            UsockState::BeingAccepted => {
                if let Some(listener) = self.peer.take() {
                    if cx.with_usock(listener, |l, cx| l.cancel_accept(cx)).is_err() {
                        ktrace!("{}: listener {} gone, nothing to cancel", self.id, listener);
                    }
                }
            }
            _ => {}
        }

        self.fsm.stop();
        self.fsm.enter(UsockState::Stopping);

        let in_flight = [
            &self.task_connecting,
            &self.task_connected,
            &self.task_accept,
            &self.task_send,
            &self.task_recv,
        ]
        .iter()
        .any(|t| t.is_fired());

        if in_flight {
            cx.arm(&self.task_stop)
        } else {
            self.finish_stop(cx);
            Ok(())
        }
    }

    fn finish_stop(&mut self, cx: &mut Context<'_>) {
        self.deregister(cx);
        self.close();
        self.bound = false;
        self.inp.reset();
        self.out.reset();
        self.peer = None;
        self.errnum = 0;
        self.fsm.enter(UsockState::Idle);
        self.fsm.stopped(cx.events());
    }

    // ── Event dispatch ───────────────────────────────────────────────

    /// Deliver readiness reported by the worker's poller
    pub(crate) fn ready(&mut self, cx: &mut Context<'_>, fired: Readiness) {
        cx.poller().fired(&mut self.wfd, fired);
        while let Some(bit) = self.wfd.pending.take_next() {
            let event = if bit == Readiness::READ {
                Event::Readable
            } else if bit == Readiness::WRITE {
                Event::Writable
            } else {
                Event::Hangup
            };
            self.process(cx, SRC_FD, event);
        }
    }

    pub(crate) fn process(&mut self, cx: &mut Context<'_>, src: Source, event: Event) {
        use UsockState::*;

        let state = self.state();
        if state == Stopping {
            if src == SRC_TASK_STOP && event == Event::Task {
                self.finish_stop(cx);
            }
            return;
        }

        match (src, event) {
            (SRC_FD, Event::Readable) => self.on_readable(cx),
            (SRC_FD, Event::Writable) => self.on_writable(cx),
            (SRC_FD, Event::Hangup) => self.on_hangup(cx),

            (SRC_TASK_CONNECTING, Event::Task) if state == Connecting => {
                if self.register(cx) {
                    cx.poller().set_out(&mut self.wfd);
                }
            }
            (SRC_TASK_CONNECTED, Event::Task) if state == Active => {
                self.register(cx);
            }
            (SRC_TASK_ACCEPT, Event::Task) if state == Accepting => {
                if self.register(cx) {
                    cx.poller().set_in(&mut self.wfd);
                }
            }
            (SRC_TASK_SEND, Event::Task) if state == Active && self.out.busy => {
                if self.register(cx) {
                    cx.poller().set_out(&mut self.wfd);
                }
            }
            (SRC_TASK_RECV, Event::Task) if state == Active && self.inp.busy => {
                if self.register(cx) {
                    cx.poller().set_in(&mut self.wfd);
                }
            }

            (src, event) => {
                ktrace!("{}: {} from {} ignored in {}", self.id, event.name(), src, state.name());
            }
        }
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) {
        match self.state() {
            UsockState::Accepting => self.accept_ready(cx, false),
            UsockState::Active if self.inp.busy => {
                if let Err(e) = self.pump_in(cx, false) {
                    kerror!("{}: recv re-arm failed: {}", self.id, e);
                }
            }
            _ => {}
        }
    }

    fn on_writable(&mut self, cx: &mut Context<'_>) {
        match self.state() {
            UsockState::Connecting => match take_socket_error(self.fd) {
                0 => {
                    self.fsm.enter(UsockState::Connected);
                    self.fsm.raise(cx.events(), Event::Connected);
                }
                e => self.enter_error(cx, e),
            },
            UsockState::Active if self.out.busy => match self.send_raw() {
                Ok(true) => self.send_done(cx),
                Ok(false) => cx.poller().set_out(&mut self.wfd),
                Err(e) => self.enter_error(cx, e),
            },
            _ => {}
        }
    }

    fn on_hangup(&mut self, cx: &mut Context<'_>) {
        use UsockState::*;
        match self.state() {
            Accepting => self.accept_ready(cx, true),
            // Nobody waits on the listener. The next accept re-registers it
            // and learns the cause from accept4.
            Listening => self.deregister(cx),
            Connecting | Connected | Accepted | Active => {
                let e = self.hangup_errno();
                self.enter_error(cx, e);
            }
            _ => {}
        }
    }

    /// `SO_ERROR`, or `ECONNRESET` when the kernel recorded none
    fn hangup_errno(&self) -> i32 {
        match take_socket_error(self.fd) {
            0 => libc::ECONNRESET,
            e => e,
        }
    }

    // ── Accept plumbing ──────────────────────────────────────────────

    /// Listener side of `accept`
    fn begin_accept(&mut self, cx: &mut Context<'_>, peer: UsockId) -> AcceptOutcome {
        self.fsm.enter(UsockState::Accepting);
        match accept_raw(self.fd) {
            Ok(fd) => {
                self.errnum = 0;
                self.fsm.enter(UsockState::Listening);
                AcceptOutcome::Accepted(fd)
            }
            Err(e) if retry_accept(e) || e == self.errnum => {
                self.peer = Some(peer);
                match cx.arm(&self.task_accept) {
                    Ok(()) => AcceptOutcome::Pending,
                    Err(err) => {
                        kerror!("{}: accept arm failed: {}", self.id, err);
                        self.peer = None;
                        self.fsm.enter(UsockState::Listening);
                        AcceptOutcome::Failed
                    }
                }
            }
            Err(e) => {
                self.errnum = e;
                self.fsm.enter(UsockState::Listening);
                self.fsm.raise(cx.events(), Event::AcceptError(e));
                AcceptOutcome::Failed
            }
        }
    }

    /// Listener became readable, or hung up, while an accept is pending.
    ///
    /// A failing accept4 is reported as `AcceptError` and the listener
    /// keeps listening. Only a hangup with nothing to accept is an error
    /// of the listener itself.
    fn accept_ready(&mut self, cx: &mut Context<'_>, hangup: bool) {
        let Some(peer) = self.peer else {
            self.fsm.enter(UsockState::Listening);
            return;
        };
        match accept_raw(self.fd) {
            Ok(fd) => {
                self.peer = None;
                self.errnum = 0;
                self.fsm.enter(UsockState::Listening);
                let taken = cx.with_usock(peer, |u, cx| u.complete_accept(cx, fd));
                if taken != Ok(true) {
                    close_fd(fd);
                }
            }
            Err(e) if hangup && would_block(e) => {
                let e = self.hangup_errno();
                self.enter_error(cx, e);
            }
            Err(e) if retry_accept(e) => cx.poller().set_in(&mut self.wfd),
            Err(e) => {
                self.errnum = e;
                self.unpair(cx);
                if hangup {
                    // Level-triggered hangup would fire again right away.
                    self.deregister(cx);
                }
                self.fsm.enter(UsockState::Listening);
                self.fsm.raise(cx.events(), Event::AcceptError(e));
            }
        }
    }

    /// Accepted-socket side: adopt the new descriptor
    fn complete_accept(&mut self, cx: &mut Context<'_>, fd: RawFd) -> bool {
        if self.state() != UsockState::BeingAccepted {
            return false;
        }
        self.peer = None;
        self.init_from_fd(fd);
        self.fsm.enter(UsockState::Accepted);
        self.fsm.raise(cx.events(), Event::Accepted);
        true
    }

    /// The accepted socket was stopped before a connection arrived
    fn cancel_accept(&mut self, cx: &mut Context<'_>) {
        if self.state() == UsockState::Accepting {
            self.peer = None;
            cx.poller().reset_in(&mut self.wfd);
            self.fsm.enter(UsockState::Listening);
        }
    }

    /// Break the link to the peer, on both sides
    fn unpair(&mut self, cx: &mut Context<'_>) {
        if let Some(peer) = self.peer.take() {
            if cx.with_usock(peer, |u, _cx| u.peer = None).is_err() {
                ktrace!("{}: peer {} gone", self.id, peer);
            }
        }
    }

    // ── Descriptor management ────────────────────────────────────────

    fn init_from_fd(&mut self, fd: RawFd) {
        self.fd = fd;
        self.wfd = WorkerFd::new(fd, self.id.as_u64());
        self.inp.reset();
        self.out.reset();
    }

    /// Make sure the descriptor is in the poller. On failure the socket
    /// is moved to Error and `false` returned.
    fn register(&mut self, cx: &mut Context<'_>) -> bool {
        if self.wfd.is_registered() {
            return true;
        }
        match cx.poller().add(&mut self.wfd) {
            Ok(()) => true,
            Err(e) => {
                let errnum = match e {
                    AioError::Os(n) => n,
                    _ => libc::EINVAL,
                };
                self.enter_error(cx, errnum);
                false
            }
        }
    }

    fn deregister(&mut self, cx: &mut Context<'_>) {
        cx.poller().remove(&mut self.wfd);
    }

    fn close(&mut self) {
        close_fd(self.fd);
        self.fd = -1;
        self.wfd = WorkerFd::new(-1, self.id.as_u64());
    }

    fn enter_error(&mut self, cx: &mut Context<'_>, errnum: i32) {
        if self.state() == UsockState::Accepting {
            self.unpair(cx);
        }
        self.deregister(cx);
        self.errnum = errnum;
        self.inp.busy = false;
        self.out.reset();
        self.fsm.enter(UsockState::Error);
        self.fsm.raise(cx.events(), Event::Error(errnum));
    }

    /// Orderly shutdown by the peer
    fn on_peer_closed(&mut self, cx: &mut Context<'_>) {
        self.deregister(cx);
        self.errnum = libc::ECONNRESET;
        self.inp.busy = false;
        self.out.reset();
        self.fsm.enter(UsockState::Error);
        self.fsm.raise(cx.events(), Event::Shutdown);
    }
}

impl Drop for Usock {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

impl std::fmt::Debug for Usock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Usock")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("errnum", &self.errnum)
            .finish()
    }
}

#[inline]
fn retry_accept(e: i32) -> bool {
    would_block(e) || e == libc::ECONNABORTED || e == libc::EINTR
}

fn accept_raw(fd: RawFd) -> Result<RawFd, i32> {
    let rc = unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if rc < 0 {
        Err(errno())
    } else {
        Ok(rc)
    }
}

/// One `recv` into `slot`
fn read_into(fd: RawFd, slot: &mut [u8]) -> Result<usize, i32> {
    let rc = unsafe { libc::recv(fd, slot.as_mut_ptr() as *mut libc::c_void, slot.len(), 0) };
    if rc < 0 {
        Err(errno())
    } else {
        Ok(rc as usize)
    }
}

/// Read up to `max` bytes straight onto the end of `dst`
fn read_append(fd: RawFd, dst: &mut Vec<u8>, max: usize) -> Result<usize, i32> {
    let start = dst.len();
    dst.resize(start + max, 0);
    let res = read_into(fd, &mut dst[start..]);
    let n = *res.as_ref().unwrap_or(&0);
    dst.truncate(start + n);
    res
}
