//! Event sources and the event catalogue
//!
//! Every delivery into a state machine is a `(Source, Event)` pair. The
//! source tells the receiver which of its children (or which of its own
//! triggers) produced the event; the event says what happened.

/// Event source tag, chosen by whoever subscribes to a child
pub type Source = i32;

/// Source used for lifecycle actions fed by the FSM base itself
pub const SRC_ACTION: Source = -2;

/// Events exchanged between state machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Machine was started (delivered once after spawn)
    Start,
    /// Machine is asked to stop
    Stop,

    /// A worker task fired for this machine was delivered
    Task,

    /// Registered fd became readable
    Readable,
    /// Registered fd became writable
    Writable,
    /// Registered fd reported an error or hangup
    Hangup,

    /// Outgoing connection established
    Connected,
    /// Incoming connection accepted onto this socket
    Accepted,
    /// A send completed; carries the byte count of that call
    Sent(usize),
    /// A receive completed; carries exactly the requested bytes
    Received(Vec<u8>),
    /// Asynchronous syscall failure with errno
    Error(i32),
    /// Accept failed on a listener; the listener keeps listening
    AcceptError(i32),
    /// Stop finished, the child is idle
    Stopped,
    /// Peer closed the connection
    Shutdown,

    /// Free for owner machines
    User(u32),
}

impl Event {
    /// Short name for tracing
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Stop => "stop",
            Event::Task => "task",
            Event::Readable => "readable",
            Event::Writable => "writable",
            Event::Hangup => "hangup",
            Event::Connected => "connected",
            Event::Accepted => "accepted",
            Event::Sent(_) => "sent",
            Event::Received(_) => "received",
            Event::Error(_) => "error",
            Event::AcceptError(_) => "accept-error",
            Event::Stopped => "stopped",
            Event::Shutdown => "shutdown",
            Event::User(_) => "user",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::Sent(3).name(), "sent");
        assert_eq!(Event::AcceptError(24).name(), "accept-error");
        assert_eq!(Event::Received(vec![1, 2]).name(), "received");
    }
}
