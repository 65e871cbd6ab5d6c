//! Socket event kinds and connection states.

use std::fmt;

bitflags::bitflags! {
    /// The kinds of socket events a dispatcher can request and receive.
    ///
    /// Readiness reported by the OS is level-triggered, but the reactor
    /// delivers each kind as a one-shot event: once delivered, the kind is
    /// cleared from the dispatcher's enabled set and must be re-armed
    /// before another of that kind is delivered. Socket operations re-arm
    /// lazily - a `recv` that drains the buffer re-arms [`Events::READ`],
    /// a `send` that hits a full buffer re-arms [`Events::WRITE`].
    pub struct Events: u8 {
        /// Data is available to read.
        const READ = 0b0000_0001;
        /// The socket can accept more outgoing data.
        const WRITE = 0b0000_0010;
        /// An asynchronous connect completed.
        const CONNECT = 0b0000_0100;
        /// A listener has a connection waiting.
        const ACCEPT = 0b0000_1000;
        /// The peer closed, or the socket failed.
        const CLOSE = 0b0001_0000;
    }
}

/// The logical connection state of a socket.
///
/// During a normal lifetime the transitions are one-way:
/// `Closed` → `Connecting` → `Connected` → `Closed`. A listener moves to
/// `Connecting` on `listen` and stays there until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection is established or in progress.
    Closed,
    /// A connect or resolve is in flight, or the socket is listening.
    Connecting,
    /// The connection is established.
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Closed => f.pad("closed"),
            ConnState::Connecting => f.pad("connecting"),
            ConnState::Connected => f.pad("connected"),
        }
    }
}
