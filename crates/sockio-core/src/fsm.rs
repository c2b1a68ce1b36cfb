//! State machine base
//!
//! `Fsm<S>` carries what every state machine in sockio shares: the
//! machine-specific current state `S`, a lifecycle phase used for safe
//! teardown ordering, and an optional owner subscription through which
//! the machine raises events to its parent.
//!
//! A machine is mutated only by its own transition code, always on the
//! thread of the worker hosting it, so nothing here locks.
//!
//! Raised events are not delivered inline. They go into an `EventQueue`
//! that the hosting worker drains after the current dispatch returns, so
//! a child never re-enters its parent while the parent is on the stack.

use std::collections::VecDeque;

use crate::error::{AioError, AioResult};
use crate::event::{Event, Source};
use crate::id::MachineId;

/// Lifecycle phase of a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No asynchronous work outstanding; may be terminated
    Idle,
    /// Started
    Active,
    /// Stop requested, waiting for outstanding work to drain
    Stopping,
}

/// Subscription of a child to its parent machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Machine that consumes the child's events
    pub machine: MachineId,
    /// Source tag the child's events carry
    pub src: Source,
}

impl Owner {
    #[inline]
    pub const fn new(machine: MachineId, src: Source) -> Self {
        Self { machine, src }
    }
}

/// An event raised towards an owner machine, waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raised {
    pub to: MachineId,
    pub src: Source,
    pub event: Event,
}

/// FIFO of raised events, drained by the hosting worker
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Raised>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for `owner`
    #[inline]
    pub fn push(&mut self, owner: Owner, event: Event) {
        self.queue.push_back(Raised {
            to: owner.machine,
            src: owner.src,
            event,
        });
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Raised> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// State machine base
#[derive(Debug)]
pub struct Fsm<S> {
    state: S,
    phase: Phase,
    owner: Option<Owner>,
}

impl<S: Copy + PartialEq + core::fmt::Debug> Fsm<S> {
    /// Create an idle machine in `initial` state
    pub fn new(initial: S, owner: Option<Owner>) -> Self {
        Self {
            state: initial,
            phase: Phase::Idle,
            owner,
        }
    }

    /// Current machine-specific state
    #[inline]
    pub fn state(&self) -> S {
        self.state
    }

    /// Transition to `state`
    #[inline]
    pub fn enter(&mut self, state: S) {
        self.state = state;
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Idle -> Active
    pub fn start(&mut self) -> AioResult<()> {
        if self.phase != Phase::Idle {
            return Err(AioError::InvalidState {
                op: "start",
                state: self.phase_name(),
            });
        }
        self.phase = Phase::Active;
        Ok(())
    }

    /// Active -> Stopping.
    ///
    /// Returns `false` when there is nothing to stop: the machine is idle
    /// or a stop is already in progress.
    pub fn stop(&mut self) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        self.phase = Phase::Stopping;
        true
    }

    /// Stopping -> Idle, then tell the owner
    pub fn stopped(&mut self, queue: &mut EventQueue) {
        debug_assert_eq!(self.phase, Phase::Stopping);
        self.phase = Phase::Idle;
        self.raise(queue, Event::Stopped);
    }

    /// Return to Idle without notifying anyone. Used when a start is
    /// abandoned before any asynchronous work was armed.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Check that the machine may be torn down.
    ///
    /// Terminating a machine that still has asynchronous work pending is
    /// a contract violation and is refused.
    pub fn term(&self) -> AioResult<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(AioError::NotIdle)
        }
    }

    /// Raise `event` to the owner, if subscribed
    #[inline]
    pub fn raise(&self, queue: &mut EventQueue, event: Event) {
        if let Some(owner) = self.owner {
            queue.push(owner, event);
        }
    }

    #[inline]
    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }

    /// Reparent to `owner`, returning the previous subscription.
    /// Events already queued keep their original destination.
    pub fn swap_owner(&mut self, owner: Owner) -> Option<Owner> {
        self.owner.replace(owner)
    }

    fn phase_name(&self) -> &'static str {
        match self.phase {
            Phase::Idle => "idle",
            Phase::Active => "active",
            Phase::Stopping => "stopping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        On,
    }

    fn owner(n: u64, src: Source) -> Owner {
        Owner::new(MachineId::new(n), src)
    }

    #[test]
    fn test_lifecycle() {
        let mut q = EventQueue::new();
        let mut fsm = Fsm::new(Light::Off, Some(owner(1, 5)));
        assert!(fsm.is_idle());
        assert!(fsm.term().is_ok());

        fsm.start().unwrap();
        fsm.enter(Light::On);
        assert_eq!(fsm.state(), Light::On);
        assert!(!fsm.is_idle());

        assert!(fsm.stop());
        assert!(!fsm.stop(), "second stop must be a no-op");
        assert_eq!(fsm.phase(), Phase::Stopping);

        fsm.stopped(&mut q);
        assert!(fsm.is_idle());
        let raised = q.pop().unwrap();
        assert_eq!(raised.to, MachineId::new(1));
        assert_eq!(raised.src, 5);
        assert_eq!(raised.event, Event::Stopped);
        assert!(q.is_empty());
    }

    #[test]
    fn test_term_refused_while_busy() {
        let mut fsm = Fsm::new(Light::Off, None);
        fsm.start().unwrap();
        assert_eq!(fsm.term(), Err(AioError::NotIdle));
        fsm.stop();
        assert_eq!(fsm.term(), Err(AioError::NotIdle));
    }

    #[test]
    fn test_double_start_rejected() {
        let mut fsm = Fsm::new(Light::Off, None);
        fsm.start().unwrap();
        assert!(matches!(
            fsm.start(),
            Err(AioError::InvalidState { op: "start", .. })
        ));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut fsm = Fsm::new(Light::Off, None);
        assert!(!fsm.stop());
        assert!(fsm.is_idle());
    }

    #[test]
    fn test_raise_without_owner_is_dropped() {
        let mut q = EventQueue::new();
        let fsm = Fsm::new(Light::Off, None);
        fsm.raise(&mut q, Event::Connected);
        assert!(q.is_empty());
    }

    #[test]
    fn test_swap_owner_redirects_later_events() {
        let mut q = EventQueue::new();
        let mut fsm = Fsm::new(Light::Off, Some(owner(1, 0)));
        fsm.raise(&mut q, Event::Sent(1));

        let prev = fsm.swap_owner(owner(2, 7));
        assert_eq!(prev, Some(owner(1, 0)));
        fsm.raise(&mut q, Event::Sent(2));

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().to, MachineId::new(1));
        let second = q.pop().unwrap();
        assert_eq!(second.to, MachineId::new(2));
        assert_eq!(second.src, 7);
    }
}
