//! sockio Echo Server
//!
//! TCP echo server built from usock actors. Every worker runs its own
//! listener on the same port (`SO_REUSEPORT`), so the kernel spreads
//! connections across workers and a connection never leaves the worker
//! that accepted it.
//!
//! Each connection is a `Session` machine that receives one byte at a
//! time and sends it back. The usock's batch window turns those one-byte
//! receives into a handful of `recv` syscalls.
//!
//! Usage:
//!     cargo build --release -p sockio-echo
//!     ./target/release/sockio-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9998

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sockio_core::{kerror, kinfo, kprintln, kwarn};
use sockio_core::{AioResult, Event, Owner, Source, UsockId};
use sockio_runtime::{Context, Machine, PoolConfig, SockAddr, WorkerPool};

const SRC_LISTENER: Source = 1;
const SRC_ACCEPT: Source = 2;
const SRC_SOCK: Source = 3;

const BACKLOG: i32 = 128;

static RUNNING: AtomicBool = AtomicBool::new(true);

// ── Listener ──

/// Owns one listening usock and the usock currently waiting in accept
struct Listener {
    port: u16,
    listener: Option<UsockId>,
    accepting: Option<UsockId>,
}

impl Listener {
    fn open(&mut self, cx: &mut Context<'_>, me: Owner) -> AioResult<UsockId> {
        let id = cx.create_usock(me);
        let addr = SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)));
        cx.with_usock(id, |u, _cx| -> AioResult<()> {
            u.start(libc::AF_INET, libc::SOCK_STREAM, 0)?;
            u.setsockopt_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
            u.setsockopt_int(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
            u.bind(&addr)?;
            u.listen(BACKLOG)
        })??;
        Ok(id)
    }

    /// Park a fresh usock in accept on the listener
    fn accept_next(&mut self, cx: &mut Context<'_>, me: Owner) -> AioResult<()> {
        let Some(listener) = self.listener else {
            return Ok(());
        };
        let id = match self.accepting {
            Some(id) => id,
            None => cx.create_usock(Owner::new(me.machine, SRC_ACCEPT)),
        };
        self.accepting = Some(id);
        cx.with_usock(id, |u, cx| u.accept(cx, listener))?
    }

    /// Hand the accepted usock over to a new session machine
    fn hand_off(&mut self, cx: &mut Context<'_>) {
        let Some(sock) = self.accepting.take() else {
            return;
        };
        let session = cx.spawn(Session { sock, echoed: 0 });
        let swapped = cx.with_usock(sock, |u, _cx| u.swap_owner(Owner::new(session, SRC_SOCK)));
        if swapped.is_err() {
            kerror!("accepted {} vanished before hand-off", sock);
        }
    }
}

impl Machine for Listener {
    fn process(&mut self, cx: &mut Context<'_>, src: Source, event: Event) {
        let Some(me) = cx.current() else {
            return;
        };
        let owner = Owner::new(me, SRC_LISTENER);

        let res = match (src, event) {
            (_, Event::Start) => match self.open(cx, owner) {
                Ok(id) => {
                    self.listener = Some(id);
                    kinfo!("listening on port {} ({})", self.port, id);
                    self.accept_next(cx, owner)
                }
                Err(e) => Err(e),
            },
            (SRC_ACCEPT, Event::Accepted) => {
                self.hand_off(cx);
                self.accept_next(cx, owner)
            }
            (SRC_LISTENER, Event::AcceptError(errno)) => {
                kwarn!("accept failed: errno {}", errno);
                self.accept_next(cx, owner)
            }
            (SRC_LISTENER, Event::Error(errno)) => {
                kerror!("listener failed: errno {}", errno);
                Ok(())
            }
            (src, event) => {
                kwarn!("listener: unexpected {} from {}", event.name(), src);
                Ok(())
            }
        };

        if let Err(e) = res {
            kerror!("listener on port {}: {}", self.port, e);
        }
    }
}

// ── Session ──

/// One echo connection
struct Session {
    sock: UsockId,
    echoed: usize,
}

impl Session {
    fn close(&mut self, cx: &mut Context<'_>) {
        if let Err(e) = cx.with_usock(self.sock, |u, cx| u.stop(cx)).and_then(|r| r) {
            kerror!("{}: stop failed: {}", self.sock, e);
        }
    }
}

impl Machine for Session {
    fn process(&mut self, cx: &mut Context<'_>, _src: Source, event: Event) {
        let sock = self.sock;
        let res = match event {
            Event::Start => cx
                .with_usock(sock, |u, cx| u.activate(cx).and_then(|_| u.recv(cx, 1)))
                .and_then(|r| r),
            Event::Received(byte) => {
                self.echoed += byte.len();
                cx.with_usock(sock, |u, cx| u.send(cx, vec![byte])).and_then(|r| r)
            }
            Event::Sent(_) => cx.with_usock(sock, |u, cx| u.recv(cx, 1)).and_then(|r| r),
            Event::Shutdown | Event::Error(_) => {
                self.close(cx);
                Ok(())
            }
            Event::Stopped => {
                kinfo!("{} closed after {} bytes", sock, self.echoed);
                if let Err(e) = cx.destroy_usock(sock) {
                    kerror!("{}: destroy failed: {}", sock, e);
                }
                if let Some(me) = cx.current() {
                    cx.retire(me);
                }
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = res {
            kerror!("{}: {}", sock, e);
            self.close(cx);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9998);

    let mut config = PoolConfig::from_env();
    if let Some(n) = args.get(2).and_then(|s| s.parse().ok()) {
        config = config.num_workers(n);
    }

    // SIGINT handler for clean shutdown. Worker threads block all
    // signals, so the handler always runs on this thread.
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let mut pool = match WorkerPool::start(config) {
        Ok(pool) => pool,
        Err(e) => {
            kprintln!("sockio-echo: {}", e);
            std::process::exit(1);
        }
    };

    for _ in 0..pool.len() {
        let listener = Listener {
            port,
            listener: None,
            accepting: None,
        };
        if let Err(e) = pool.choose().spawn(listener) {
            kprintln!("sockio-echo: {}", e);
            std::process::exit(1);
        }
    }

    kprintln!("sockio-echo: listening on 0.0.0.0:{} ({} workers)", port, pool.len());

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    kprintln!("\nsockio-echo: shutting down...");
    if let Err(e) = pool.shutdown() {
        kprintln!("sockio-echo: {}", e);
    }
    kprintln!("sockio-echo: done.");
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
