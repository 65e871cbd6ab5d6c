//! Cross-thread wakeup for a blocked poll.
//!
//! On Unix this is the classic self-pipe trick: a byte written from any
//! thread makes the pipe's read end pollable and interrupts `select`. On
//! Windows it is an auto-reset `WSAEVENT`. Writes coalesce: the byte is
//! only written while the signaler is in the unsignaled state, so any
//! number of concurrent wakeups produce at most one event per pass.

use std::fmt;
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(unix)]
use std::sync::Mutex;

use crate::dispatcher::Dispatcher;
use crate::event::Events;
#[cfg(unix)]
use crate::sys::unistd;
#[cfg(windows)]
use crate::sys::winsock;

/// The dispatcher that breaks the server's wait loop.
///
/// Bound to the server's `waiting` flag; delivering its event clears the
/// flag, which makes `wait` return on its next iteration.
pub(crate) struct Signaler {
    #[cfg(unix)]
    pipe: (RawFd, RawFd),
    #[cfg(unix)]
    signaled: Mutex<bool>,
    #[cfg(windows)]
    event: winsock::HANDLE,
    waiting: Arc<AtomicBool>,
}

impl Signaler {
    #[cfg(unix)]
    pub fn new(waiting: Arc<AtomicBool>) -> std::io::Result<Signaler> {
        let pipe = unistd::pipe().map_err(crate::sys::nix_to_io)?;
        for &fd in &[pipe.0, pipe.1] {
            crate::sys::set_nonblocking(fd).map_err(crate::sys::nix_to_io)?;
        }
        Ok(Signaler {
            pipe,
            signaled: Mutex::new(false),
            waiting,
        })
    }

    #[cfg(windows)]
    pub fn new(waiting: Arc<AtomicBool>) -> std::io::Result<Signaler> {
        let event = unsafe { winsock::WSACreateEvent() };
        if event == winsock::WSA_INVALID_EVENT {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Signaler { event, waiting })
    }

    /// Pokes the poll loop. Callable from any thread.
    #[cfg(unix)]
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if !*signaled {
            if unistd::write(self.pipe.1, &[0u8]) == Ok(1) {
                *signaled = true;
            }
        }
    }

    /// Pokes the poll loop. Callable from any thread.
    #[cfg(windows)]
    pub fn signal(&self) {
        unsafe {
            winsock::WSASetEvent(self.event);
        }
    }
}

impl Dispatcher for Signaler {
    fn requested_events(&self) -> Events {
        #[cfg(unix)]
        return Events::READ;
        #[cfg(windows)]
        return Events::empty();
    }

    #[cfg(unix)]
    fn descriptor(&self) -> RawFd {
        self.pipe.0
    }

    #[cfg(unix)]
    fn is_descriptor_closed(&self) -> bool {
        false
    }

    fn on_pre_event(&self, _events: Events) {
        // A pipe cannot perfectly emulate an auto-resetting event; reset
        // here, before the event is handled.
        #[cfg(unix)]
        {
            let mut signaled = self.signaled.lock().unwrap();
            if *signaled {
                let mut buf = [0u8; 4];
                let _ = unistd::read(self.pipe.0, &mut buf);
                *signaled = false;
            }
        }
        #[cfg(windows)]
        unsafe {
            winsock::WSAResetEvent(self.event);
        }
    }

    fn on_event(&self, _events: Events, _err: i32) {
        self.waiting.store(false, Ordering::SeqCst);
    }

    #[cfg(windows)]
    fn wsa_event(&self) -> winsock::HANDLE {
        self.event
    }

    #[cfg(windows)]
    fn os_socket(&self) -> RawSocket {
        winsock::INVALID_SOCKET as RawSocket
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let _ = unistd::close(self.pipe.0);
            let _ = unistd::close(self.pipe.1);
        }
        #[cfg(windows)]
        unsafe {
            winsock::WSACloseEvent(self.event);
        }
    }
}

impl fmt::Debug for Signaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Signaler { .. }")
    }
}
