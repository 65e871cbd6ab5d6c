//! The dispatcher-backed socket and its public handle.
//!
//! [`AsyncSocket`] is a cheap, cloneable handle over the dispatcher that
//! lives in the server's registry. Consumers subscribe to its event
//! channels; handlers receive a borrowed handle and run synchronously on
//! the loop thread. The registry keeps the dispatcher alive between
//! events, so a handle may be dropped after subscribing - `close`
//! deregisters and releases the OS handle.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;
#[cfg(windows)]
use std::sync::atomic::{AtomicI32, Ordering};
#[cfg(windows)]
use std::sync::Mutex;
use std::sync::{Arc, Weak};

#[cfg(windows)]
use log::debug;

use crate::dispatcher::Dispatcher;
use crate::event::{ConnState, Events};
use crate::resolver::AsyncResolver;
use crate::server::ServerCore;
use crate::sigslot::Signal;
use crate::socket::{
    already_code, resolver_error_code, Endpoint, SocketCore, SocketOption, SocketType,
};
#[cfg(windows)]
use crate::sys::winsock;

#[cfg(windows)]
static NEXT_ID: AtomicI32 = AtomicI32::new(0);

#[cfg(windows)]
#[derive(Default)]
struct SignalClose {
    pending: bool,
    err: i32,
}

/// The registry-resident half of an [`AsyncSocket`].
pub(crate) struct SocketDispatcher {
    core: SocketCore,
    me: Weak<SocketDispatcher>,
    readable: Signal<AsyncSocket>,
    writable: Signal<AsyncSocket>,
    connected: Signal<AsyncSocket>,
    closed: Signal<(AsyncSocket, i32)>,
    /// Guards against delivering further event bits to a socket that a
    /// handler closed (and possibly re-created) mid-delivery.
    #[cfg(windows)]
    id: AtomicI32,
    #[cfg(windows)]
    signal_close: Mutex<SignalClose>,
}

impl SocketDispatcher {
    pub fn new(server: Weak<ServerCore>) -> Arc<SocketDispatcher> {
        Arc::new_cyclic(|me| SocketDispatcher {
            core: SocketCore::new(server),
            me: me.clone(),
            readable: Signal::new(),
            writable: Signal::new(),
            connected: Signal::new(),
            closed: Signal::new(),
            #[cfg(windows)]
            id: AtomicI32::new(0),
            #[cfg(windows)]
            signal_close: Mutex::new(SignalClose::default()),
        })
    }

    /// Adopts an accepted or wrapped OS handle.
    pub fn from_os(
        server: Weak<ServerCore>,
        sock: socket2::Socket,
    ) -> io::Result<Arc<SocketDispatcher>> {
        let core = SocketCore::from_os(server, sock)?;
        Ok(Arc::new_cyclic(|me| SocketDispatcher {
            core,
            me: me.clone(),
            readable: Signal::new(),
            writable: Signal::new(),
            connected: Signal::new(),
            closed: Signal::new(),
            #[cfg(windows)]
            id: AtomicI32::new(0),
            #[cfg(windows)]
            signal_close: Mutex::new(SignalClose::default()),
        }))
    }

    /// Creates the OS socket and registers with the server.
    pub fn create(&self, ty: SocketType) -> io::Result<()> {
        let _ = self.close();
        self.core.create(ty)?;
        self.initialize()
    }

    /// Puts the handle in non-blocking mode and joins the registry.
    pub fn initialize(&self) -> io::Result<()> {
        self.core.set_nonblocking()?;
        let server = self.server()?;
        server.add(self.as_dyn());
        #[cfg(windows)]
        {
            // Monotonically increasing and never zero; zero marks closed.
            let mut id = NEXT_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id == 0 {
                id = NEXT_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            }
            self.id.store(id, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Deregisters and closes the handle. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        if !self.core.has_handle() {
            return Ok(());
        }
        #[cfg(windows)]
        {
            self.id.store(0, Ordering::SeqCst);
            *self.signal_close.lock().unwrap() = SignalClose::default();
        }
        if let Some(server) = self.core.server().upgrade() {
            server.remove(&self.as_dyn());
        }
        self.core.close()
    }

    fn as_dyn(&self) -> Arc<dyn Dispatcher> {
        self.me
            .upgrade()
            .expect("socket dispatcher vanished under its own method")
    }

    pub fn core(&self) -> &SocketCore {
        &self.core
    }

    fn server(&self) -> io::Result<Arc<ServerCore>> {
        self.core
            .server()
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "socket server is gone"))
    }

    fn handle(&self) -> AsyncSocket {
        AsyncSocket {
            inner: self
                .me
                .upgrade()
                .expect("socket dispatcher dropped mid-dispatch"),
        }
    }

    pub fn on_readable(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.readable.connect(f);
    }

    pub fn on_writable(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.writable.connect(f);
    }

    pub fn on_connected(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.connected.connect(f);
    }

    pub fn on_closed(&self, mut f: impl FnMut(&AsyncSocket, i32) + Send + 'static) {
        self.closed.connect(move |arg: &(AsyncSocket, i32)| f(&arg.0, arg.1));
    }

    /// Completion of the resolver this socket owns.
    pub(crate) fn on_resolve_result(&self, result: io::Result<SocketAddr>) {
        if let Some(resolver) = self.core.take_resolver() {
            resolver.destroy();
        }

        let err = match result {
            Ok(addr) => {
                let connected = self
                    .ensure_created()
                    .and_then(|()| self.core.do_connect(addr));
                match connected {
                    Ok(()) => 0,
                    Err(e) => crate::socket::raw_os_error(&e),
                }
            }
            Err(e) => {
                let code = resolver_error_code(&e);
                let _ = self.close();
                code
            }
        };

        if err != 0 {
            self.core.set_last_error(err);
            self.closed.emit(&(self.handle(), err));
        }
    }

    pub(crate) fn ensure_created(&self) -> io::Result<()> {
        if self.core.has_handle() {
            return Ok(());
        }
        self.core.create(SocketType::Stream)?;
        self.initialize()
    }
}

impl Dispatcher for SocketDispatcher {
    fn requested_events(&self) -> Events {
        self.core.enabled_events()
    }

    #[cfg(unix)]
    fn descriptor(&self) -> RawFd {
        self.core.raw_fd()
    }

    #[cfg(unix)]
    fn is_descriptor_closed(&self) -> bool {
        self.core.descriptor_closed()
    }

    #[cfg(unix)]
    fn on_pre_event(&self, events: Events) {
        if events.contains(Events::CONNECT) {
            self.core.set_conn_state(ConnState::Connected);
        }
        if events.contains(Events::CLOSE) {
            self.core.set_conn_state(ConnState::Closed);
        }
    }

    #[cfg(windows)]
    fn on_pre_event(&self, events: Events) {
        if events.contains(Events::CONNECT) {
            self.core.set_conn_state(ConnState::Connected);
        }
        // Closed is committed from check_signal_close.
    }

    #[cfg(unix)]
    fn on_event(&self, events: Events, err: i32) {
        let sock = self.handle();
        if events.contains(Events::READ) {
            self.core.disarm(Events::READ);
            self.readable.emit(&sock);
        }
        if events.contains(Events::WRITE) {
            self.core.disarm(Events::WRITE);
            self.writable.emit(&sock);
        }
        if events.contains(Events::CONNECT) {
            self.core.disarm(Events::CONNECT);
            self.connected.emit(&sock);
        }
        if events.contains(Events::ACCEPT) {
            self.core.disarm(Events::ACCEPT);
            self.readable.emit(&sock);
        }
        if events.contains(Events::CLOSE) {
            // The socket is now dead to us, so stop checking it.
            self.core.disarm_all();
            self.closed.emit(&(sock, err));
        }
    }

    #[cfg(windows)]
    fn on_event(&self, events: Events, err: i32) {
        let sock = self.handle();
        let cache_id = self.id.load(Ordering::SeqCst);
        if events.contains(Events::READ) {
            self.core.disarm(Events::READ);
            self.readable.emit(&sock);
        }
        if events.contains(Events::WRITE) && self.id.load(Ordering::SeqCst) == cache_id {
            self.core.disarm(Events::WRITE);
            self.writable.emit(&sock);
        }
        if events.contains(Events::CONNECT) && self.id.load(Ordering::SeqCst) == cache_id {
            if events != Events::CONNECT {
                debug!("signaled with CONNECT and {:?}", events - Events::CONNECT);
            }
            self.core.disarm(Events::CONNECT);
            self.connected.emit(&sock);
        }
        if events.contains(Events::ACCEPT) && self.id.load(Ordering::SeqCst) == cache_id {
            self.core.disarm(Events::ACCEPT);
            self.readable.emit(&sock);
        }
        if events.contains(Events::CLOSE) && self.id.load(Ordering::SeqCst) == cache_id {
            // Held back until any readable data has been drained; the
            // next poll pass delivers it through check_signal_close.
            let mut sc = self.signal_close.lock().unwrap();
            sc.pending = true;
            sc.err = err;
        }
    }

    #[cfg(windows)]
    fn wsa_event(&self) -> winsock::HANDLE {
        winsock::WSA_INVALID_EVENT
    }

    #[cfg(windows)]
    fn os_socket(&self) -> RawSocket {
        self.core.raw_socket()
    }

    #[cfg(windows)]
    fn check_signal_close(&self) -> bool {
        let err = {
            let sc = self.signal_close.lock().unwrap();
            if !sc.pending {
                return false;
            }
            sc.err
        };

        if self.core.peek_pending() {
            // Still data to read; keep the close deferred.
            return false;
        }

        self.core.set_conn_state(ConnState::Closed);
        self.signal_close.lock().unwrap().pending = false;
        self.closed.emit(&(self.handle(), err));
        true
    }
}

impl Drop for SocketDispatcher {
    fn drop(&mut self) {
        // The registry no longer holds us at this point; just release the
        // OS handle.
        let _ = self.core.close();
    }
}

/// An asynchronous socket driven by a [`SocketServer`][crate::SocketServer].
///
/// Operations are non-blocking; readiness arrives through the event
/// channels as one-shot events. Handlers receive a borrowed handle and run
/// on the thread driving [`wait`][crate::SocketServer::wait].
///
/// # Examples
///
/// ```no_run
/// use sockloop::{SocketServer, SocketType};
///
/// # fn main() -> std::io::Result<()> {
/// let server = SocketServer::new()?;
/// let listener = server.create_async_socket(SocketType::Stream)?;
/// listener.bind("127.0.0.1:0".parse().unwrap())?;
/// listener.listen(5)?;
/// listener.on_readable(|l| {
///     let (sock, addr) = l.accept().unwrap();
///     println!("accepted {}", addr);
///     sock.on_readable(|s| {
///         let mut buf = [0u8; 1024];
///         if let Ok(n) = s.recv(&mut buf) {
///             let _ = s.send(&buf[..n]);
///         }
///     });
/// });
/// loop {
///     server.wait(None, true)?;
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncSocket {
    pub(crate) inner: Arc<SocketDispatcher>,
}

impl AsyncSocket {
    /// Binds to a local address.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.core().bind(addr)
    }

    /// Starts a non-blocking connect.
    ///
    /// With a resolved address this issues the connect immediately; a
    /// `connected` event follows when it completes (or `closed` with the
    /// failure). With a host name, resolution runs in the background and
    /// the socket sits in [`ConnState::Connecting`] until it finishes;
    /// connecting while not closed fails with `EALREADY`.
    pub fn connect(&self, endpoint: impl Into<Endpoint>) -> io::Result<()> {
        match endpoint.into() {
            Endpoint::Addr(addr) => {
                self.inner.ensure_created()?;
                self.inner.core().do_connect(addr)
            }
            Endpoint::Host(host, port) => {
                if self.inner.core().state() != ConnState::Closed {
                    self.inner.core().set_last_error(already_code());
                    return Err(io::Error::from_raw_os_error(already_code()));
                }
                let server = self
                    .inner
                    .core()
                    .server()
                    .upgrade()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "socket server is gone"))?;
                let resolver =
                    AsyncResolver::start(host, port, Arc::downgrade(&self.inner), &server)?;
                self.inner.core().set_resolver(resolver);
                self.inner.core().set_conn_state(ConnState::Connecting);
                Ok(())
            }
        }
    }

    /// Sends on the connected socket, re-arming `WRITE` when the OS
    /// buffer is full.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.core().send(buf)
    }

    /// Sends a datagram to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.core().send_to(buf, addr)
    }

    /// Receives from the connected socket, re-arming `READ`.
    ///
    /// A graceful shutdown by the peer is reported as a would-block error
    /// here; the `closed` event follows on the next loop pass, after any
    /// remaining data has been delivered.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.core().recv(buf)
    }

    /// Receives a datagram and its sender address, re-arming `READ`.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.core().recv_from(buf)
    }

    /// Starts listening; readable events then mean "connection waiting".
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.core().listen(backlog)
    }

    /// Accepts one pending connection, re-arming `ACCEPT`.
    pub fn accept(&self) -> io::Result<(AsyncSocket, SocketAddr)> {
        let (sock, addr) = self.inner.core().accept_raw()?;
        let server = self
            .inner
            .core()
            .server()
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "socket server is gone"))?;
        Ok((server.wrap_os_socket(sock)?, addr))
    }

    /// Deregisters from the server and closes the OS handle.
    ///
    /// Safe to call more than once; a pending resolver is torn down.
    pub fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    /// Reads a socket option, normalized per [`SocketOption`].
    pub fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        self.inner.core().get_option(opt)
    }

    /// Sets a socket option, normalized per [`SocketOption`].
    pub fn set_option(&self, opt: SocketOption, value: i32) -> io::Result<()> {
        self.inner.core().set_option(opt, value)
    }

    /// Estimates the path MTU towards the connected peer.
    pub fn estimate_mtu(&self) -> io::Result<u16> {
        self.inner.core().estimate_mtu()
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.core().local_addr()
    }

    /// The connected peer's address.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.inner.core().remote_addr()
    }

    /// The logical connection state.
    pub fn state(&self) -> ConnState {
        self.inner.core().state()
    }

    /// The raw OS error of the most recent operation on this socket.
    pub fn last_error(&self) -> i32 {
        self.inner.core().last_error()
    }

    /// Subscribes to readable events (data, or a pending accept).
    pub fn on_readable(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.inner.on_readable(f);
    }

    /// Subscribes to writable events.
    pub fn on_writable(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.inner.on_writable(f);
    }

    /// Subscribes to connect completion.
    pub fn on_connected(&self, f: impl FnMut(&AsyncSocket) + Send + 'static) {
        self.inner.on_connected(f);
    }

    /// Subscribes to close events; the second argument is the OS error
    /// code, zero for a graceful close.
    pub fn on_closed(&self, f: impl FnMut(&AsyncSocket, i32) + Send + 'static) {
        self.inner.on_closed(f);
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("core", self.inner.core())
            .finish()
    }
}
