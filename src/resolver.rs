//! Asynchronous name resolution for `connect`.
//!
//! Resolution runs on a short-lived worker thread; the completion is
//! handed back to the loop thread through a one-shot dispatcher (a
//! self-pipe on Unix, an event object on Windows) registered with the
//! server. The socket owns the resolver and tears it down on close with a
//! non-blocking [`destroy`][AsyncResolver::destroy], which tolerates a
//! completion racing with the teardown.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, warn};

use crate::async_socket::SocketDispatcher;
use crate::dispatcher::Dispatcher;
use crate::event::Events;
use crate::server::ServerCore;
use crate::socket::resolve_ipv4;
#[cfg(unix)]
use crate::sys::unistd;
#[cfg(windows)]
use crate::sys::winsock;

/// An in-flight name resolution owned by a socket.
pub(crate) struct AsyncResolver {
    dispatcher: Arc<ResolverDispatcher>,
    server: Weak<ServerCore>,
}

impl AsyncResolver {
    /// Starts resolving `host:port` and delivering the result to `socket`
    /// on the loop thread.
    pub fn start(
        host: String,
        port: u16,
        socket: Weak<SocketDispatcher>,
        server: &Arc<ServerCore>,
    ) -> io::Result<AsyncResolver> {
        let dispatcher = Arc::new(ResolverDispatcher::new(socket)?);
        server.add(dispatcher.clone() as Arc<dyn Dispatcher>);

        let worker = dispatcher.clone();
        let spawned = thread::Builder::new()
            .name("sockloop-resolver".to_string())
            .spawn(move || {
                debug!("resolving {}:{}", host, port);
                let result = resolve_ipv4(&host, port);
                *worker.result.lock().unwrap() = Some(result);
                worker.notify();
            });
        if let Err(err) = spawned {
            server.remove(&(dispatcher.clone() as Arc<dyn Dispatcher>));
            return Err(err);
        }

        Ok(AsyncResolver {
            dispatcher,
            server: Arc::downgrade(server),
        })
    }

    /// Non-blocking teardown.
    ///
    /// The worker thread may still be running; it keeps the dispatcher
    /// alive until its final write, which lands in a pipe nobody polls
    /// anymore.
    pub fn destroy(self) {
        self.dispatcher.cancelled.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.upgrade() {
            server.remove(&(self.dispatcher.clone() as Arc<dyn Dispatcher>));
        }
    }
}

impl fmt::Debug for AsyncResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("AsyncResolver { .. }")
    }
}

/// The loop-side half: becomes readable when the worker finishes.
struct ResolverDispatcher {
    #[cfg(unix)]
    pipe: (RawFd, RawFd),
    #[cfg(windows)]
    event: winsock::HANDLE,
    result: Mutex<Option<io::Result<SocketAddr>>>,
    socket: Weak<SocketDispatcher>,
    cancelled: AtomicBool,
}

impl ResolverDispatcher {
    #[cfg(unix)]
    fn new(socket: Weak<SocketDispatcher>) -> io::Result<ResolverDispatcher> {
        let pipe = unistd::pipe().map_err(crate::sys::nix_to_io)?;
        for &fd in &[pipe.0, pipe.1] {
            crate::sys::set_nonblocking(fd).map_err(crate::sys::nix_to_io)?;
        }
        Ok(ResolverDispatcher {
            pipe,
            result: Mutex::new(None),
            socket,
            cancelled: AtomicBool::new(false),
        })
    }

    #[cfg(windows)]
    fn new(socket: Weak<SocketDispatcher>) -> io::Result<ResolverDispatcher> {
        let event = unsafe { winsock::WSACreateEvent() };
        if event == winsock::WSA_INVALID_EVENT {
            return Err(io::Error::last_os_error());
        }
        Ok(ResolverDispatcher {
            event,
            result: Mutex::new(None),
            socket,
            cancelled: AtomicBool::new(false),
        })
    }

    #[cfg(unix)]
    fn notify(&self) {
        let _ = unistd::write(self.pipe.1, &[0u8]);
    }

    #[cfg(windows)]
    fn notify(&self) {
        unsafe {
            winsock::WSASetEvent(self.event);
        }
    }
}

impl Dispatcher for ResolverDispatcher {
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
        #[cfg(unix)]
        {
            let mut buf = [0u8; 4];
            let _ = unistd::read(self.pipe.0, &mut buf);
        }
        #[cfg(windows)]
        unsafe {
            winsock::WSAResetEvent(self.event);
        }
    }

    fn on_event(&self, _events: Events, _err: i32) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let result = match self.result.lock().unwrap().take() {
            Some(result) => result,
            None => {
                warn!("resolver signaled without a result");
                return;
            }
        };
        if let Some(socket) = self.socket.upgrade() {
            socket.on_resolve_result(result);
        }
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

impl Drop for ResolverDispatcher {
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
