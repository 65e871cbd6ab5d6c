//! The reactor: dispatcher registry plus the wait loop.
//!
//! A single thread drives [`SocketServer::wait`], which multiplexes
//! readiness for every registered dispatcher and delivers it as one-shot
//! events. Handlers always run with the registry lock released; iteration
//! goes through explicit cursors that [`remove`][ServerCore::remove]
//! keeps consistent, so a handler may add or remove dispatchers (itself
//! included) mid-pass.

use std::fmt;
use std::io;
#[cfg(unix)]
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{FromRawSocket, IntoRawSocket, RawSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use slab::Slab;

use crate::async_socket::{AsyncSocket, SocketDispatcher};
use crate::dispatcher::Dispatcher;
use crate::event::Events;
#[cfg(unix)]
use crate::file::{AsyncFile, FileDispatcher};
#[cfg(unix)]
use crate::posix_signal::{install_signal, trampoline, PosixSignalDispatcher, SignalAction};
use crate::socket::{Socket, SocketType};
#[cfg(unix)]
use crate::sys::errno::Errno;
#[cfg(unix)]
use crate::sys::libc;
#[cfg(unix)]
use crate::sys::select::{select, FdSet, TimeVal, TimeValLike};
#[cfg(unix)]
use crate::sys::signal::SigHandler;
#[cfg(windows)]
use crate::sys::winsock;
use crate::wake::Signaler;

struct Registry {
    /// Registration order is dispatch order within a pass.
    list: Vec<Arc<dyn Dispatcher>>,
    /// Live iteration positions, adjusted by `remove`.
    cursors: Slab<usize>,
}

/// Shared server state; the public handle is [`SocketServer`].
pub(crate) struct ServerCore {
    me: std::sync::Weak<ServerCore>,
    registry: Mutex<Registry>,
    /// Cleared by the wakeup signaler to break the wait loop.
    waiting: Arc<AtomicBool>,
    signaler: Arc<Signaler>,
    /// The same signaler as a trait object, for identity checks.
    signaler_dyn: Arc<dyn Dispatcher>,
    #[cfg(unix)]
    signal_dispatcher: Mutex<Option<Arc<PosixSignalDispatcher>>>,
    /// The shared rendezvous event all sockets select into.
    #[cfg(windows)]
    socket_ev: winsock::HANDLE,
    dispatch_count: AtomicU32,
    tick_start: Mutex<Instant>,
}

impl ServerCore {
    fn new() -> io::Result<Arc<ServerCore>> {
        let waiting = Arc::new(AtomicBool::new(false));
        let signaler = Arc::new(Signaler::new(waiting.clone())?);
        #[cfg(windows)]
        let socket_ev = {
            let ev = unsafe { winsock::WSACreateEvent() };
            if ev == winsock::WSA_INVALID_EVENT {
                return Err(io::Error::last_os_error());
            }
            ev
        };

        let signaler_dyn: Arc<dyn Dispatcher> = signaler.clone();
        let core = Arc::new_cyclic(|me| ServerCore {
            me: me.clone(),
            registry: Mutex::new(Registry {
                list: Vec::new(),
                cursors: Slab::new(),
            }),
            waiting,
            signaler,
            signaler_dyn,
            #[cfg(unix)]
            signal_dispatcher: Mutex::new(None),
            #[cfg(windows)]
            socket_ev,
            dispatch_count: AtomicU32::new(0),
            tick_start: Mutex::new(Instant::now()),
        });
        core.add(core.signaler_dyn.clone());
        Ok(core)
    }

    /// Registers a dispatcher. Re-adding one already present is silently
    /// ignored - duplicates would make dead dispatchers stick around.
    pub(crate) fn add(&self, dispatcher: Arc<dyn Dispatcher>) {
        let mut registry = self.registry.lock().unwrap();
        if registry
            .list
            .iter()
            .any(|d| Arc::ptr_eq(d, &dispatcher))
        {
            return;
        }
        registry.list.push(dispatcher);
    }

    /// Deregisters a dispatcher, keeping live cursors consistent: every
    /// cursor strictly past the removed slot steps back by one, so the
    /// next iteration visits the element that slid into the gap.
    pub(crate) fn remove(&self, dispatcher: &Arc<dyn Dispatcher>) -> bool {
        let mut registry = self.registry.lock().unwrap();
        let position = registry
            .list
            .iter()
            .position(|d| Arc::ptr_eq(d, dispatcher));
        let position = match position {
            Some(position) => position,
            None => {
                warn!("removing a dispatcher that is not registered");
                return false;
            }
        };
        registry.list.remove(position);
        for (_, cursor) in registry.cursors.iter_mut() {
            if *cursor > position {
                *cursor -= 1;
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().unwrap().list.len()
    }

    pub(crate) fn wake_up(&self) {
        self.signaler.signal();
    }

    pub(crate) fn wrap_os_socket(&self, sock: socket2::Socket) -> io::Result<AsyncSocket> {
        let dispatcher = SocketDispatcher::from_os(self.me.clone(), sock)?;
        dispatcher.initialize()?;
        Ok(AsyncSocket { inner: dispatcher })
    }

    /// Fetches the dispatcher under `cursor` and advances it, or `None`
    /// at the end. `end` optionally bounds the iteration.
    fn next_under_cursor(
        &self,
        cursor: usize,
        end: Option<usize>,
    ) -> Option<Arc<dyn Dispatcher>> {
        let mut registry = self.registry.lock().unwrap();
        let at = registry.cursors[cursor];
        let bound = match end {
            Some(end) => registry.cursors[end].min(registry.list.len()),
            None => registry.list.len(),
        };
        if at >= bound {
            return None;
        }
        registry.cursors[cursor] = at + 1;
        Some(registry.list[at].clone())
    }

    #[cfg(unix)]
    fn wait(&self, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.waiting.store(true, Ordering::SeqCst);

        while self.waiting.load(Ordering::SeqCst) {
            // Build the fd sets from each dispatcher's current interest.
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            let mut max_fd: RawFd = -1;
            {
                let registry = self.registry.lock().unwrap();
                for dispatcher in registry.list.iter() {
                    if !process_io && !Arc::ptr_eq(dispatcher, &self.signaler_dyn) {
                        continue;
                    }
                    let fd = dispatcher.descriptor();
                    if fd < 0 {
                        continue;
                    }
                    let requested = dispatcher.requested_events();
                    if requested.intersects(Events::READ | Events::ACCEPT) {
                        read_set.insert(fd);
                    }
                    if requested.intersects(Events::WRITE | Events::CONNECT) {
                        write_set.insert(fd);
                    }
                    if fd > max_fd {
                        max_fd = fd;
                    }
                }
            }

            let mut tv = deadline.map(|deadline| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                TimeVal::milliseconds(remaining.as_millis() as i64)
            });

            let n = match select(
                max_fd + 1,
                Some(&mut read_set),
                Some(&mut write_set),
                None,
                tv.as_mut(),
            ) {
                Ok(n) => n,
                Err(err) if err.as_errno() == Some(Errno::EINTR) => {
                    // If this interruption was for a signal the bridge
                    // manages, its dispatcher is readable on the next
                    // pass.
                    continue;
                }
                Err(err) => {
                    error!("select failed: {}", err);
                    return Err(crate::sys::nix_to_io(err));
                }
            };

            if n == 0 {
                // Timed out.
                return Ok(());
            }

            // Deliver events with the lock released, through registered
            // cursors so handlers can mutate the registry.
            let (cursor, end) = {
                let mut registry = self.registry.lock().unwrap();
                let len = registry.list.len();
                (registry.cursors.insert(0), registry.cursors.insert(len))
            };
            while let Some(dispatcher) = self.next_under_cursor(cursor, Some(end)) {
                let fd = dispatcher.descriptor();
                if fd < 0 {
                    continue;
                }
                let readable = read_set.contains(fd);
                let writable = write_set.contains(fd);
                if !readable && !writable {
                    continue;
                }

                // Reap any pending error; it can be signaled through
                // either set. Harmlessly yields zero for non-sockets.
                let errcode = socket_error(fd);
                let requested = dispatcher.requested_events();
                let mut ff = Events::empty();

                // Readable means a pending accept when one was asked
                // for; otherwise tell data apart from a peer close.
                if readable {
                    if requested.contains(Events::ACCEPT) {
                        ff |= Events::ACCEPT;
                    } else if errcode != 0 || dispatcher.is_descriptor_closed() {
                        ff |= Events::CLOSE;
                    } else {
                        ff |= Events::READ;
                    }
                }

                // Writable means connect completion while one is
                // pending; the reaped error tells success from failure.
                if writable {
                    if requested.contains(Events::CONNECT) {
                        if errcode == 0 {
                            ff |= Events::CONNECT;
                        } else {
                            ff |= Events::CLOSE;
                        }
                    } else {
                        ff |= Events::WRITE;
                    }
                }

                if !ff.is_empty() {
                    dispatcher.on_pre_event(ff);
                    dispatcher.on_event(ff, errcode);
                }
            }
            {
                let mut registry = self.registry.lock().unwrap();
                registry.cursors.remove(end);
                registry.cursors.remove(cursor);
            }

            self.track_dispatch_rate();
        }

        Ok(())
    }

    #[cfg(windows)]
    fn wait(&self, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.waiting.store(true, Ordering::SeqCst);

        while self.waiting.load(Ordering::SeqCst) {
            let mut events: Vec<winsock::HANDLE> = vec![self.socket_ev];
            let mut event_owners: Vec<Arc<dyn Dispatcher>> = Vec::new();

            // Register socket interest into the shared event and collect
            // the per-dispatcher event objects. Iterating under a cursor
            // picks up dispatchers added while we do this.
            let cursor = self.registry.lock().unwrap().cursors.insert(0);
            while let Some(dispatcher) = self.next_under_cursor(cursor, None) {
                if !process_io && !Arc::ptr_eq(&dispatcher, &self.signaler_dyn) {
                    continue;
                }
                let s = dispatcher.os_socket();
                if dispatcher.check_signal_close() {
                    // The deferred close was just delivered; skip this
                    // socket for the pass.
                } else if s != winsock::INVALID_SOCKET as RawSocket {
                    let flags = network_event_flags(dispatcher.requested_events());
                    unsafe {
                        winsock::WSAEventSelect(s as winsock::SOCKET, self.socket_ev, flags);
                    }
                } else {
                    events.push(dispatcher.wsa_event());
                    event_owners.push(dispatcher);
                }
            }
            self.registry.lock().unwrap().cursors.remove(cursor);

            let timeout_ms = match deadline {
                None => winsock::WSA_INFINITE,
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u32,
            };

            let dw = unsafe {
                winsock::WSAWaitForMultipleEvents(
                    events.len() as u32,
                    events.as_ptr(),
                    0,
                    timeout_ms,
                    0,
                )
            };
            if dw == winsock::WSA_WAIT_FAILED {
                let err = unsafe { winsock::WSAGetLastError() };
                error!("WSAWaitForMultipleEvents failed: {}", err);
                return Err(io::Error::from_raw_os_error(err));
            }
            if dw == winsock::WSA_WAIT_TIMEOUT {
                return Ok(());
            }

            let index = (dw - winsock::WSA_WAIT_EVENT_0) as usize;
            if index > 0 {
                // One of the per-dispatcher event objects.
                let dispatcher = event_owners[index - 1].clone();
                dispatcher.on_pre_event(Events::empty());
                dispatcher.on_event(Events::empty(), 0);
            } else if process_io {
                // The shared socket event; ask each socket what it saw.
                // Dispatchers added during delivery wait for the next
                // pass.
                let (cursor, end) = {
                    let mut registry = self.registry.lock().unwrap();
                    let len = registry.list.len();
                    (registry.cursors.insert(0), registry.cursors.insert(len))
                };
                while let Some(dispatcher) = self.next_under_cursor(cursor, Some(end)) {
                    let s = dispatcher.os_socket();
                    if s == winsock::INVALID_SOCKET as RawSocket {
                        continue;
                    }
                    let mut ne: winsock::WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
                    let rc = unsafe {
                        winsock::WSAEnumNetworkEvents(s as winsock::SOCKET, self.socket_ev, &mut ne)
                    };
                    if rc != 0 {
                        continue;
                    }
                    let (ff, errcode) = translate_network_events(&ne);
                    if !ff.is_empty() {
                        dispatcher.on_pre_event(ff);
                        dispatcher.on_event(ff, errcode);
                    }
                }
                {
                    let mut registry = self.registry.lock().unwrap();
                    registry.cursors.remove(end);
                    registry.cursors.remove(cursor);
                }
            }

            // Reset the rendezvous until new activity occurs.
            unsafe {
                winsock::WSAResetEvent(self.socket_ev);
            }

            self.track_dispatch_rate();

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Advisory telemetry: normally 1000 passes take several seconds, so
    /// a sub-second burst usually means something is spinning.
    fn track_dispatch_rate(&self) {
        let count = self.dispatch_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count < 1000 {
            return;
        }
        self.dispatch_count.store(0, Ordering::Relaxed);
        let mut start = self.tick_start.lock().unwrap();
        let elapsed = start.elapsed();
        *start = Instant::now();
        debug!("1000 dispatch passes took {:?}", elapsed);
        if elapsed < Duration::from_secs(1) {
            warn!("dispatch loop is spinning: 1000 passes in {:?}", elapsed);
        }
    }
}

#[cfg(windows)]
impl Drop for ServerCore {
    fn drop(&mut self) {
        unsafe {
            winsock::WSACloseEvent(self.socket_ev);
        }
    }
}

impl fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("dispatchers", &self.len())
            .finish()
    }
}

/// Reads and clears `SO_ERROR`; zero for non-sockets and on failure.
#[cfg(unix)]
fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        0
    } else {
        err
    }
}

/// Translates requested events into `WSAEventSelect` interest;
/// `FD_CLOSE` is always included.
#[cfg(windows)]
fn network_event_flags(requested: Events) -> i32 {
    let mut flags = winsock::FD_CLOSE as u32;
    if requested.contains(Events::READ) {
        flags |= winsock::FD_READ as u32;
    }
    if requested.contains(Events::WRITE) {
        flags |= winsock::FD_WRITE as u32;
    }
    if requested.contains(Events::CONNECT) {
        flags |= winsock::FD_CONNECT as u32;
    }
    if requested.contains(Events::ACCEPT) {
        flags |= winsock::FD_ACCEPT as u32;
    }
    flags as i32
}

#[cfg(windows)]
fn translate_network_events(ne: &winsock::WSANETWORKEVENTS) -> (Events, i32) {
    let bits = ne.lNetworkEvents as u32;
    let mut ff = Events::empty();
    let mut errcode = 0;
    if bits & winsock::FD_READ as u32 != 0 {
        ff |= Events::READ;
    }
    if bits & winsock::FD_WRITE as u32 != 0 {
        ff |= Events::WRITE;
    }
    if bits & winsock::FD_CONNECT as u32 != 0 {
        let err = ne.iErrorCode[winsock::FD_CONNECT_BIT as usize];
        if err == 0 {
            ff |= Events::CONNECT;
        } else {
            // A failed connect closes the socket as far as consumers
            // are concerned.
            ff |= Events::CLOSE;
            errcode = err;
        }
    }
    if bits & winsock::FD_ACCEPT as u32 != 0 {
        ff |= Events::ACCEPT;
    }
    if bits & winsock::FD_CLOSE as u32 != 0 {
        ff |= Events::CLOSE;
        errcode = ne.iErrorCode[winsock::FD_CLOSE_BIT as usize];
    }
    (ff, errcode)
}

/// An event-driven socket server.
///
/// One thread drives [`wait`][SocketServer::wait]; every dispatcher
/// callback and event-channel handler runs synchronously on that thread.
/// Handles are cheap to clone and any thread may call
/// [`wake_up`][SocketServer::wake_up] or the registry methods. The server
/// is not reentrant - do not call `wait` from inside a handler.
///
/// # Examples
///
/// ```no_run
/// use sockloop::{SocketServer, SocketType};
/// use std::time::Duration;
///
/// # fn main() -> std::io::Result<()> {
/// let server = SocketServer::new()?;
/// let socket = server.create_async_socket(SocketType::Stream)?;
/// socket.on_connected(|s| {
///     let _ = s.send(b"hello");
/// });
/// socket.connect("127.0.0.1:8000".parse::<std::net::SocketAddr>().unwrap())?;
///
/// // Poll for one second.
/// server.wait(Some(Duration::from_secs(1)), true)?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug)]
pub struct SocketServer {
    core: Arc<ServerCore>,
}

impl SocketServer {
    /// Creates a server with its wakeup signaler already registered.
    pub fn new() -> io::Result<SocketServer> {
        Ok(SocketServer {
            core: ServerCore::new()?,
        })
    }

    /// Polls for readiness and delivers events until the timeout elapses
    /// or [`wake_up`][SocketServer::wake_up] breaks the loop; `None`
    /// waits forever. With `process_io` false only the wakeup signaler
    /// is serviced.
    ///
    /// Returns `Ok(())` on timeout or wakeup and an error only when the
    /// underlying poll fails.
    pub fn wait(&self, timeout: Option<Duration>, process_io: bool) -> io::Result<()> {
        self.core.wait(timeout, process_io)
    }

    /// Interrupts a blocked [`wait`][SocketServer::wait] from any thread.
    ///
    /// Concurrent calls coalesce into a single wakeup per pass.
    pub fn wake_up(&self) {
        self.core.wake_up();
    }

    /// Creates a synchronous [`Socket`].
    pub fn create_socket(&self, ty: SocketType) -> io::Result<Socket> {
        Socket::new(Arc::downgrade(&self.core), ty)
    }

    /// Creates an [`AsyncSocket`] registered with this server.
    pub fn create_async_socket(&self, ty: SocketType) -> io::Result<AsyncSocket> {
        let dispatcher = SocketDispatcher::new(Arc::downgrade(&self.core));
        dispatcher.create(ty)?;
        Ok(AsyncSocket { inner: dispatcher })
    }

    /// Adopts an existing OS socket as an [`AsyncSocket`], taking
    /// ownership of the handle and putting it in non-blocking mode.
    #[cfg(unix)]
    pub fn wrap_socket(&self, sock: impl IntoRawFd) -> io::Result<AsyncSocket> {
        let sock = unsafe { socket2::Socket::from_raw_fd(sock.into_raw_fd()) };
        self.core.wrap_os_socket(sock)
    }

    /// Adopts an existing OS socket as an [`AsyncSocket`], taking
    /// ownership of the handle and putting it in non-blocking mode.
    #[cfg(windows)]
    pub fn wrap_socket(&self, sock: impl IntoRawSocket) -> io::Result<AsyncSocket> {
        let sock = unsafe { socket2::Socket::from_raw_socket(sock.into_raw_socket()) };
        self.core.wrap_os_socket(sock)
    }

    /// Adopts a non-socket descriptor as an [`AsyncFile`], taking
    /// ownership of it.
    #[cfg(unix)]
    pub fn create_file(&self, file: impl IntoRawFd) -> io::Result<AsyncFile> {
        let dispatcher = FileDispatcher::new(file.into_raw_fd(), &self.core)?;
        Ok(AsyncFile::from_dispatcher(dispatcher))
    }

    /// Routes an OS signal into the loop.
    ///
    /// With [`SignalAction::Handle`] the callback runs on the loop thread
    /// within one pass of the signal's arrival; `Default`/`Ignore`
    /// restore the OS disposition and drop any registration. Back-to-back
    /// deliveries of the same signal may coalesce into one callback.
    #[cfg(unix)]
    pub fn set_posix_signal_handler(&self, signum: i32, action: SignalAction) -> io::Result<()> {
        match action {
            SignalAction::Default => self.clear_posix_signal(signum, SigHandler::SigDfl),
            SignalAction::Ignore => self.clear_posix_signal(signum, SigHandler::SigIgn),
            SignalAction::Handle(f) => {
                let dispatcher = {
                    let mut guard = self.core.signal_dispatcher.lock().unwrap();
                    match guard.as_ref() {
                        Some(dispatcher) => dispatcher.clone(),
                        None => {
                            let dispatcher = PosixSignalDispatcher::new()?;
                            self.core.add(dispatcher.clone());
                            *guard = Some(dispatcher.clone());
                            dispatcher
                        }
                    }
                };
                dispatcher.set_handler(signum, f);
                install_signal(signum, trampoline())
            }
        }
    }

    #[cfg(unix)]
    fn clear_posix_signal(&self, signum: i32, handler: SigHandler) -> io::Result<()> {
        install_signal(signum, handler)?;
        let mut guard = self.core.signal_dispatcher.lock().unwrap();
        if let Some(dispatcher) = guard.clone() {
            dispatcher.clear_handler(signum);
            if !dispatcher.has_handlers() {
                let dispatcher: Arc<dyn Dispatcher> = dispatcher;
                self.core.remove(&dispatcher);
                *guard = None;
            }
        }
        Ok(())
    }

    /// Registers a custom dispatcher. Re-adding one already present is
    /// silently ignored.
    pub fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        self.core.add(dispatcher);
    }

    /// Deregisters a dispatcher; removing one that is not registered is a
    /// no-op and returns `false`.
    pub fn remove_dispatcher(&self, dispatcher: &Arc<dyn Dispatcher>) -> bool {
        self.core.remove(dispatcher)
    }

    /// The number of registered dispatchers, the wakeup signaler
    /// included. Diagnostic.
    pub fn dispatcher_count(&self) -> usize {
        self.core.len()
    }
}
