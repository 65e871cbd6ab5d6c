//! The capability every pollable participant implements.

#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;

use crate::event::Events;

/// The Windows event object handle (`WSAEVENT`).
#[cfg(windows)]
pub type WsaEvent = crate::sys::winsock::HANDLE;

/// A participant in the reactor.
///
/// The server polls each registered dispatcher for the events it currently
/// requests and, when the OS reports readiness, delivers them as one-shot
/// events: first [`on_pre_event`][Dispatcher::on_pre_event] (commit state
/// transitions), then [`on_event`][Dispatcher::on_event] (run handlers).
/// Both run synchronously on the thread driving
/// [`wait`][crate::SocketServer::wait].
///
/// A dispatcher may mutate its own interest set, call back into the
/// server, or close itself from inside `on_event`; adding and removing
/// dispatchers must always go through the server's registry methods.
pub trait Dispatcher: Send + Sync {
    /// The event kinds this dispatcher currently wants.
    ///
    /// Called potentially several times per loop pass; must be cheap and
    /// side-effect-free.
    fn requested_events(&self) -> Events;

    /// The descriptor to poll, or `-1` to skip descriptor polling.
    #[cfg(unix)]
    fn descriptor(&self) -> RawFd;

    /// Distinguishes half-close from readable data.
    ///
    /// May perform a non-destructive one-byte peek.
    #[cfg(unix)]
    fn is_descriptor_closed(&self) -> bool;

    /// Called before `on_event` to commit state transitions.
    fn on_pre_event(&self, events: Events);

    /// Delivers the events, with `err` holding the reaped OS error code.
    fn on_event(&self, events: Events, err: i32);

    /// The event object to wait on, or the invalid event for socket-backed
    /// dispatchers that share the server's rendezvous event.
    #[cfg(windows)]
    fn wsa_event(&self) -> WsaEvent;

    /// The OS socket to register interest for, or `INVALID_SOCKET`.
    #[cfg(windows)]
    fn os_socket(&self) -> RawSocket;

    /// Drains a deferred close; returns `true` when one was signaled and
    /// interest registration should be skipped this pass.
    #[cfg(windows)]
    fn check_signal_close(&self) -> bool {
        false
    }
}
