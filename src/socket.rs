//! The physical socket: a thin, synchronous wrapper over one OS socket.
//!
//! A socket carries a logical [`ConnState`], the last OS error observed on
//! it, and the set of events it is currently armed for. Operations are
//! non-blocking once the handle has been put in non-blocking mode (the
//! dispatcher layer does that) and re-arm interest lazily: a `recv` that
//! drains the buffer re-arms `READ`, a `send` that hits a full buffer
//! re-arms `WRITE`. Graceful shutdown is deferred - an EOF on a stream
//! read is reported as a blocking error so the reactor can deliver any
//! remaining readable data before the close event.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, RawSocket};
use std::sync::{Mutex, Weak};

use log::{debug, warn};
use socket2::{Domain, SockAddr, Socket as OsSocket, Type};

use crate::event::{ConnState, Events};
use crate::resolver::AsyncResolver;
use crate::server::ServerCore;
#[cfg(unix)]
use crate::sys::libc;
#[cfg(windows)]
use crate::sys::winsock;
use crate::AsyncSocket;

/// Standard MTUs, from RFC 1191, largest first.
pub const STANDARD_MTUS: [u16; 11] = [
    65535, // Theoretical maximum, Hyperchannel
    32000, // Nothing
    17914, // 16Mb IBM Token Ring
    8166,  // IEEE 802.4
    4352,  // FDDI
    2002,  // IEEE 802.5 (4Mb recommended)
    1492,  // IEEE 802.3
    1006,  // SLIP, ARPANET
    508,   // IEEE 802/Source-Rt Bridge, ARCNET
    296,   // Point-to-Point (low delay)
    68,    // Official minimum
];

#[cfg(windows)]
const IP_HEADER_SIZE: u32 = 20;
#[cfg(windows)]
const ICMP_HEADER_SIZE: u32 = 8;

// glibc headers gained these late; define them to match linux/in.h.
#[cfg(any(target_os = "linux", target_os = "android"))]
const IP_MTU: libc::c_int = 14;
#[cfg(any(target_os = "linux", target_os = "android"))]
const IP_MTU_DISCOVER: libc::c_int = 10;
#[cfg(any(target_os = "linux", target_os = "android"))]
const IP_PMTUDISC_DONT: libc::c_int = 0;
#[cfg(any(target_os = "linux", target_os = "android"))]
const IP_PMTUDISC_DO: libc::c_int = 2;

// Suppress SIGPIPE at the send call. Without this, sending on a socket
// whose other end has closed raises SIGPIPE and kills the process; with
// it we get a plain EPIPE.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const SEND_FLAGS: libc::c_int = 0;

/// The kind of socket to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// A TCP stream socket.
    Stream,
    /// A UDP datagram socket.
    Datagram,
}

impl SocketType {
    fn to_socket2(self) -> Type {
        match self {
            SocketType::Stream => Type::stream(),
            SocketType::Datagram => Type::dgram(),
        }
    }
}

/// A platform-neutral socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Whether outgoing packets may be fragmented. Normalized to 0/1; on
    /// Linux this maps onto the PMTU discovery mode. Unsupported on
    /// macOS/iOS/BSD.
    DontFragment,
    /// The OS receive buffer size.
    RecvBuf,
    /// The OS send buffer size.
    SendBuf,
    /// TCP_NODELAY.
    NoDelay,
}

/// A connect target: either an already-resolved address or a name still
/// to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A resolved socket address.
    Addr(SocketAddr),
    /// A host name and port, resolved before connecting.
    Host(String, u16),
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint::Addr(addr)
    }
}

impl Endpoint {
    /// An endpoint that will be resolved asynchronously before connecting.
    pub fn host(name: impl Into<String>, port: u16) -> Endpoint {
        Endpoint::Host(name.into(), port)
    }
}

/// Whether an OS error code means "would block" rather than failure.
#[cfg(unix)]
pub(crate) fn is_blocking_error(err: i32) -> bool {
    err == libc::EWOULDBLOCK || err == libc::EAGAIN || err == libc::EINPROGRESS
}

#[cfg(windows)]
pub(crate) fn is_blocking_error(err: i32) -> bool {
    err == winsock::WSAEWOULDBLOCK
}

/// Converts a `socket2` address into a std address.
pub(crate) fn sockaddr_to_std(addr: &SockAddr) -> io::Result<SocketAddr> {
    if let Some(v4) = addr.as_inet() {
        Ok(SocketAddr::V4(v4))
    } else if let Some(v6) = addr.as_inet6() {
        Ok(SocketAddr::V6(v6))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not an inet address",
        ))
    }
}

/// State shared by the plain and dispatcher-backed socket types.
pub(crate) struct SocketCore {
    server: Weak<ServerCore>,
    state: Mutex<State>,
}

struct State {
    /// The OS handle; `None` means closed.
    sock: Option<OsSocket>,
    udp: bool,
    /// The raw OS error of the most recent operation; reads are idempotent.
    error: i32,
    conn: ConnState,
    /// The events this socket is currently armed for.
    enabled: Events,
    /// Owns the in-flight name resolution, if any.
    resolver: Option<AsyncResolver>,
}

impl SocketCore {
    /// An empty, closed socket.
    pub fn new(server: Weak<ServerCore>) -> SocketCore {
        SocketCore {
            server,
            state: Mutex::new(State {
                sock: None,
                udp: false,
                error: 0,
                conn: ConnState::Closed,
                enabled: Events::empty(),
                resolver: None,
            }),
        }
    }

    /// Adopts an already-connected OS handle (the accept/wrap path).
    pub fn from_os(server: Weak<ServerCore>, sock: OsSocket) -> io::Result<SocketCore> {
        let udp = sock_type(&sock)? == SocketType::Datagram;
        Ok(SocketCore {
            server,
            state: Mutex::new(State {
                sock: Some(sock),
                udp,
                error: 0,
                conn: ConnState::Connected,
                enabled: Events::READ | Events::WRITE,
                resolver: None,
            }),
        })
    }

    pub fn server(&self) -> Weak<ServerCore> {
        self.server.clone()
    }

    /// Creates the underlying OS socket, closing any existing one first.
    pub fn create(&self, ty: SocketType) -> io::Result<()> {
        let _ = self.close();
        let mut st = self.state.lock().unwrap();
        let res = OsSocket::new(Domain::ipv4(), ty.to_socket2(), None);
        st.udp = ty == SocketType::Datagram;
        match res {
            Ok(sock) => {
                st.error = 0;
                st.sock = Some(sock);
                if st.udp {
                    // Datagram sockets are usable right away.
                    st.enabled = Events::READ | Events::WRITE;
                }
                Ok(())
            }
            Err(err) => {
                st.error = raw_os_error(&err);
                Err(err)
            }
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.bind(&addr.into());
        record(&mut st, res)
    }

    /// Issues a non-blocking connect to a resolved address.
    ///
    /// A synchronous completion moves straight to `Connected`; a blocking
    /// indication moves to `Connecting` and arms `CONNECT`. Either way a
    /// successful initiation arms `READ | WRITE`.
    pub fn do_connect(&self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        let sock = match st.sock.as_ref() {
            Some(s) => s,
            None => return Err(bad_handle(&mut st)),
        };
        match sock.connect(&addr.into()) {
            Ok(()) => {
                st.error = 0;
                st.conn = ConnState::Connected;
            }
            Err(err) => {
                let raw = raw_os_error(&err);
                st.error = raw;
                if is_blocking_error(raw) {
                    st.conn = ConnState::Connecting;
                    st.enabled |= Events::CONNECT;
                } else {
                    return Err(err);
                }
            }
        }
        st.enabled |= Events::READ | Events::WRITE;
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;

        #[cfg(unix)]
        let res = {
            let n = unsafe {
                libc::send(
                    sock.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        };
        #[cfg(windows)]
        let res = sock.send(buf);

        finish_send(&mut st, buf.len(), res)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;

        #[cfg(unix)]
        let res = {
            let target = SockAddr::from(addr);
            let n = unsafe {
                libc::sendto(
                    sock.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                    target.as_ptr(),
                    target.len(),
                )
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        };
        #[cfg(windows)]
        let res = sock.send_to(buf, &addr.into());

        finish_send(&mut st, buf.len(), res)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.recv(buf);

        if let Ok(0) = res {
            if !buf.is_empty() && !st.udp {
                // On graceful shutdown recv returns 0. Pretend it would
                // block and re-arm READ so the poll loop notices the
                // close; the close event is then delivered after any data
                // still readable.
                warn!("EOF from socket; deferring close event");
                st.enabled |= Events::READ;
                st.error = would_block_code();
                return Err(io::Error::from_raw_os_error(st.error));
            }
        }

        let err = res.as_ref().err().map(raw_os_error).unwrap_or(0);
        st.error = err;
        let success = res.is_ok() || is_blocking_error(err);
        if st.udp || success {
            st.enabled |= Events::READ;
        }
        if !success {
            debug!("recv error = {}", err);
        }
        res
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.recv_from(buf);

        let err = res.as_ref().err().map(raw_os_error).unwrap_or(0);
        st.error = err;
        let success = res.is_ok() || is_blocking_error(err);
        if st.udp || success {
            st.enabled |= Events::READ;
        }
        if !success {
            debug!("recv_from error = {}", err);
        }
        let (n, addr) = res?;
        Ok((n, sockaddr_to_std(&addr)?))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.listen(backlog);
        if res.is_ok() {
            st.conn = ConnState::Connecting;
            st.enabled |= Events::ACCEPT;
        }
        record(&mut st, res)
    }

    /// Accepts one pending connection, re-arming `ACCEPT`.
    ///
    /// Returns the raw handle; the caller wraps it through the server.
    pub fn accept_raw(&self) -> io::Result<(OsSocket, SocketAddr)> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.accept();
        if res.is_ok() {
            st.enabled |= Events::ACCEPT;
        }
        let (accepted, addr) = record(&mut st, res)?;
        Ok((accepted, sockaddr_to_std(&addr)?))
    }

    /// Closes the handle. Idempotent; destroys any pending resolver.
    pub fn close(&self) -> io::Result<()> {
        let resolver = {
            let mut st = self.state.lock().unwrap();
            if st.sock.is_none() {
                return Ok(());
            }
            st.sock = None;
            st.conn = ConnState::Closed;
            st.enabled = Events::empty();
            st.resolver.take()
        };
        if let Some(resolver) = resolver {
            resolver.destroy();
        }
        Ok(())
    }

    pub fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        let mut st = self.state.lock().unwrap();
        let (level, name) = translate_option(opt)?;
        let sock = ready_sock(&mut st)?;
        let res = getsockopt_int(sock, level, name);
        let value = record(&mut st, res)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let value = if opt == SocketOption::DontFragment {
            (value != IP_PMTUDISC_DONT) as i32
        } else {
            value
        };
        Ok(value)
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        let (level, name) = translate_option(opt)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let value = if opt == SocketOption::DontFragment {
            if value != 0 {
                IP_PMTUDISC_DO
            } else {
                IP_PMTUDISC_DONT
            }
        } else {
            value
        };
        let sock = ready_sock(&mut st)?;
        let res = setsockopt_int(sock, level, name, value);
        record(&mut st, res)
    }

    /// Estimates the path MTU towards the connected peer.
    pub fn estimate_mtu(&self) -> io::Result<u16> {
        let mut st = self.state.lock().unwrap();
        let sock = match st.sock.as_ref() {
            Some(s) => s,
            None => return Err(bad_handle(&mut st)),
        };
        let peer = match sock.peer_addr() {
            Ok(addr) => addr,
            Err(_) => {
                st.error = not_connected_code();
                return Err(io::Error::from_raw_os_error(st.error));
            }
        };

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let _ = peer;
            // The kernel tracks the path MTU for connected sockets.
            let res = getsockopt_int(sock, libc::IPPROTO_IP, IP_MTU);
            let value = record(&mut st, res)?;
            debug_assert!((0..=65536).contains(&value));
            return Ok(value.min(65535) as u16);
        }

        #[cfg(windows)]
        {
            return estimate_mtu_icmp(&mut st, &peer);
        }

        #[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
        {
            // No simple way to do this here; SIOCGIFMTU would need the
            // outgoing interface, which we do not know. Let the caller
            // pick a default.
            let _ = peer;
            st.error = libc::EINVAL;
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.local_addr();
        let addr = record(&mut st, res)?;
        sockaddr_to_std(&addr)
    }

    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        let mut st = self.state.lock().unwrap();
        let sock = ready_sock(&mut st)?;
        let res = sock.peer_addr();
        let addr = record(&mut st, res)?;
        sockaddr_to_std(&addr)
    }

    pub fn state(&self) -> ConnState {
        self.state.lock().unwrap().conn
    }

    pub fn last_error(&self) -> i32 {
        self.state.lock().unwrap().error
    }

    pub fn set_last_error(&self, err: i32) {
        self.state.lock().unwrap().error = err;
    }

    pub fn has_handle(&self) -> bool {
        self.state.lock().unwrap().sock.is_some()
    }

    pub fn enabled_events(&self) -> Events {
        self.state.lock().unwrap().enabled
    }

    pub fn arm(&self, events: Events) {
        self.state.lock().unwrap().enabled |= events;
    }

    pub fn disarm(&self, events: Events) {
        self.state.lock().unwrap().enabled -= events;
    }

    pub fn disarm_all(&self) {
        self.state.lock().unwrap().enabled = Events::empty();
    }

    pub fn set_conn_state(&self, conn: ConnState) {
        self.state.lock().unwrap().conn = conn;
    }

    pub fn set_resolver(&self, resolver: AsyncResolver) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.resolver.is_none());
        st.resolver = Some(resolver);
    }

    pub fn take_resolver(&self) -> Option<AsyncResolver> {
        self.state.lock().unwrap().resolver.take()
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let st = self.state.lock().unwrap();
        match st.sock.as_ref() {
            Some(sock) => sock.set_nonblocking(true),
            None => Ok(()),
        }
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> RawFd {
        match self.state.lock().unwrap().sock.as_ref() {
            Some(sock) => sock.as_raw_fd(),
            None => -1,
        }
    }

    #[cfg(windows)]
    pub fn raw_socket(&self) -> RawSocket {
        match self.state.lock().unwrap().sock.as_ref() {
            Some(sock) => sock.as_raw_socket(),
            None => winsock::INVALID_SOCKET as RawSocket,
        }
    }

    /// Whether a one-byte peek finds data still waiting to be read.
    #[cfg(windows)]
    pub fn peek_pending(&self) -> bool {
        let st = self.state.lock().unwrap();
        let sock = match st.sock.as_ref() {
            Some(s) => s,
            None => return false,
        };
        let mut ch = 0u8;
        let n = unsafe {
            winsock::recv(
                sock.as_raw_socket() as winsock::SOCKET,
                &mut ch as *mut u8,
                1,
                winsock::MSG_PEEK as i32,
            )
        };
        n > 0
    }

    /// A non-destructive one-byte peek distinguishing "readable" from
    /// "peer closed".
    pub fn descriptor_closed(&self) -> bool {
        let st = self.state.lock().unwrap();
        let sock = match st.sock.as_ref() {
            Some(s) => s,
            None => return true,
        };

        #[cfg(unix)]
        let (n, err) = {
            let mut ch = 0u8;
            let n = unsafe {
                libc::recv(
                    sock.as_raw_fd(),
                    &mut ch as *mut u8 as *mut libc::c_void,
                    1,
                    libc::MSG_PEEK,
                )
            };
            (n, io::Error::last_os_error().raw_os_error().unwrap_or(0))
        };
        #[cfg(windows)]
        let (n, err) = {
            let mut ch = 0u8;
            let n = unsafe {
                winsock::recv(
                    sock.as_raw_socket() as winsock::SOCKET,
                    &mut ch as *mut u8,
                    1,
                    winsock::MSG_PEEK as i32,
                )
            };
            (n as isize, unsafe { winsock::WSAGetLastError() })
        };

        if n > 0 {
            // Data available, so not closed.
            false
        } else if n == 0 {
            // EOF, so closed.
            true
        } else {
            match err {
                // Returned once we have already closed the handle.
                #[cfg(unix)]
                e if e == libc::EBADF => true,
                // Returned during ungraceful peer shutdown.
                #[cfg(unix)]
                e if e == libc::ECONNRESET => true,
                _ => {
                    // Anything else is treated as a blocking error: the
                    // connection is fine, there is just nothing to read
                    // right now. A real connection loss shows up as EOF on
                    // the next recv anyway.
                    warn!("assuming benign blocking error on peek, errno = {}", err);
                    false
                }
            }
        }
    }
}

impl fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("SocketCore")
            .field("state", &st.conn)
            .field("udp", &st.udp)
            .field("enabled", &st.enabled)
            .field("error", &st.error)
            .finish()
    }
}

/// A synchronous socket with the same state machine as [`AsyncSocket`],
/// created by [`SocketServer::create_socket`][crate::SocketServer::create_socket].
///
/// Unlike its asynchronous sibling it is not registered with the reactor
/// and its handle stays in blocking mode, so connects and name resolution
/// complete inline.
pub struct Socket {
    core: SocketCore,
}

impl Socket {
    pub(crate) fn new(server: Weak<ServerCore>, ty: SocketType) -> io::Result<Socket> {
        let core = SocketCore::new(server);
        core.create(ty)?;
        Ok(Socket { core })
    }

    /// Binds to a local address.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.core.bind(addr)
    }

    /// Connects to an endpoint, resolving a host name inline.
    pub fn connect(&self, endpoint: impl Into<Endpoint>) -> io::Result<()> {
        match endpoint.into() {
            Endpoint::Addr(addr) => {
                self.ensure_created()?;
                self.core.do_connect(addr)
            }
            Endpoint::Host(host, port) => {
                if self.core.state() != ConnState::Closed {
                    self.core.set_last_error(already_code());
                    return Err(io::Error::from_raw_os_error(already_code()));
                }
                self.ensure_created()?;
                let addr = resolve_ipv4(&host, port).map_err(|err| {
                    self.core.set_last_error(resolver_error_code(&err));
                    err
                })?;
                self.core.do_connect(addr)
            }
        }
    }

    /// Sends on the connected socket.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.core.send(buf)
    }

    /// Sends a datagram to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.core.send_to(buf, addr)
    }

    /// Receives from the connected socket.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.recv(buf)
    }

    /// Receives a datagram and its sender address.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.core.recv_from(buf)
    }

    /// Starts listening; the socket stays in the connecting state until
    /// closed.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.core.listen(backlog)
    }

    /// Accepts one pending connection as an [`AsyncSocket`].
    pub fn accept(&self) -> io::Result<(AsyncSocket, SocketAddr)> {
        let (sock, addr) = self.core.accept_raw()?;
        let server = self
            .core
            .server()
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "socket server is gone"))?;
        Ok((server.wrap_os_socket(sock)?, addr))
    }

    /// Closes the socket. Safe to call more than once.
    pub fn close(&self) -> io::Result<()> {
        self.core.close()
    }

    /// Reads a socket option, normalized per [`SocketOption`].
    pub fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        self.core.get_option(opt)
    }

    /// Sets a socket option, normalized per [`SocketOption`].
    pub fn set_option(&self, opt: SocketOption, value: i32) -> io::Result<()> {
        self.core.set_option(opt, value)
    }

    /// Estimates the path MTU towards the connected peer.
    pub fn estimate_mtu(&self) -> io::Result<u16> {
        self.core.estimate_mtu()
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.local_addr()
    }

    /// The connected peer's address.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.core.remote_addr()
    }

    /// The logical connection state.
    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    /// The raw OS error of the most recent operation.
    pub fn last_error(&self) -> i32 {
        self.core.last_error()
    }

    fn ensure_created(&self) -> io::Result<()> {
        if self.core.has_handle() {
            return Ok(());
        }
        self.core.create(SocketType::Stream)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("core", &self.core).finish()
    }
}

/// Resolves a name to its first IPv4 address (sockets are AF_INET).
pub(crate) fn resolve_ipv4(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.find(|a| a.is_ipv4()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "name did not resolve to an IPv4 address",
        )
    })
}

/// The OS error code to report for a failed resolution.
pub(crate) fn resolver_error_code(err: &io::Error) -> i32 {
    #[cfg(unix)]
    return err.raw_os_error().unwrap_or(libc::EHOSTUNREACH);
    #[cfg(windows)]
    return err.raw_os_error().unwrap_or(winsock::WSAEWOULDBLOCK);
}

pub(crate) fn raw_os_error(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

#[cfg(unix)]
pub(crate) fn would_block_code() -> i32 {
    libc::EWOULDBLOCK
}

#[cfg(windows)]
pub(crate) fn would_block_code() -> i32 {
    winsock::WSAEWOULDBLOCK
}

#[cfg(unix)]
fn not_connected_code() -> i32 {
    libc::ENOTCONN
}

#[cfg(windows)]
fn not_connected_code() -> i32 {
    // WSAENOTCONN
    10057
}

#[cfg(unix)]
pub(crate) fn already_code() -> i32 {
    libc::EALREADY
}

#[cfg(windows)]
pub(crate) fn already_code() -> i32 {
    // WSAEALREADY
    10037
}

/// Records the raw OS error of `res` (0 on success) into the state.
fn record<T>(st: &mut State, res: io::Result<T>) -> io::Result<T> {
    st.error = res.as_ref().err().map(raw_os_error).unwrap_or(0);
    res
}

fn finish_send(st: &mut State, len: usize, res: io::Result<usize>) -> io::Result<usize> {
    if let Ok(sent) = &res {
        debug_assert!(*sent <= len);
    }
    let err = res.as_ref().err().map(raw_os_error).unwrap_or(0);
    st.error = err;
    if res.is_err() && is_blocking_error(err) {
        st.enabled |= Events::WRITE;
    }
    res
}

/// Fails with EBADF when the handle is gone, mirroring what the syscall
/// itself would report.
fn bad_handle(st: &mut State) -> io::Error {
    #[cfg(unix)]
    let code = libc::EBADF;
    #[cfg(windows)]
    let code = 10038; // WSAENOTSOCK
    st.error = code;
    io::Error::from_raw_os_error(code)
}

fn ready_sock(st: &mut State) -> io::Result<&OsSocket> {
    if st.sock.is_none() {
        return Err(bad_handle(st));
    }
    Ok(st.sock.as_ref().unwrap())
}

fn sock_type(sock: &OsSocket) -> io::Result<SocketType> {
    #[cfg(unix)]
    let (level, name) = (libc::SOL_SOCKET, libc::SO_TYPE);
    #[cfg(windows)]
    let (level, name) = (winsock::SOL_SOCKET, winsock::SO_TYPE);
    let ty = getsockopt_int(sock, level as i32, name as i32)?;
    #[cfg(unix)]
    let dgram = ty == libc::SOCK_DGRAM;
    #[cfg(windows)]
    let dgram = ty == 2; // SOCK_DGRAM
    Ok(if dgram {
        SocketType::Datagram
    } else {
        SocketType::Stream
    })
}

fn translate_option(opt: SocketOption) -> io::Result<(i32, i32)> {
    #[cfg(unix)]
    match opt {
        SocketOption::DontFragment => {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            return Ok((libc::IPPROTO_IP, IP_MTU_DISCOVER));
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                warn!("SocketOption::DontFragment not supported");
                return Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT));
            }
        }
        SocketOption::RecvBuf => Ok((libc::SOL_SOCKET, libc::SO_RCVBUF)),
        SocketOption::SendBuf => Ok((libc::SOL_SOCKET, libc::SO_SNDBUF)),
        SocketOption::NoDelay => Ok((libc::IPPROTO_TCP, libc::TCP_NODELAY)),
    }

    #[cfg(windows)]
    match opt {
        SocketOption::DontFragment => Ok((winsock::IPPROTO_IP as i32, winsock::IP_DONTFRAGMENT as i32)),
        SocketOption::RecvBuf => Ok((winsock::SOL_SOCKET as i32, winsock::SO_RCVBUF as i32)),
        SocketOption::SendBuf => Ok((winsock::SOL_SOCKET as i32, winsock::SO_SNDBUF as i32)),
        SocketOption::NoDelay => Ok((winsock::IPPROTO_TCP as i32, winsock::TCP_NODELAY as i32)),
    }
}

#[cfg(unix)]
fn getsockopt_int(sock: &OsSocket, level: i32, name: i32) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

#[cfg(unix)]
fn setsockopt_int(sock: &OsSocket, level: i32, name: i32, value: i32) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn getsockopt_int(sock: &OsSocket, level: i32, name: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as i32;
    let res = unsafe {
        winsock::getsockopt(
            sock.as_raw_socket() as winsock::SOCKET,
            level,
            name,
            &mut value as *mut i32 as *mut u8,
            &mut len,
        )
    };
    if res != 0 {
        return Err(io::Error::from_raw_os_error(unsafe {
            winsock::WSAGetLastError()
        }));
    }
    Ok(value)
}

#[cfg(windows)]
fn setsockopt_int(sock: &OsSocket, level: i32, name: i32, value: i32) -> io::Result<()> {
    let res = unsafe {
        winsock::setsockopt(
            sock.as_raw_socket() as winsock::SOCKET,
            level,
            name,
            &value as *const i32 as *const u8,
            std::mem::size_of::<i32>() as i32,
        )
    };
    if res != 0 {
        return Err(io::Error::from_raw_os_error(unsafe {
            winsock::WSAGetLastError()
        }));
    }
    Ok(())
}

/// Walks the RFC 1191 ladder, pinging with the don't-fragment bit set;
/// the first size the path accepts wins.
#[cfg(windows)]
fn estimate_mtu_icmp(st: &mut State, peer: &SockAddr) -> io::Result<u16> {
    use crate::sys::icmp;

    let v4 = match peer.as_inet() {
        Some(v4) => *v4.ip(),
        None => {
            st.error = 10022; // WSAEINVAL
            return Err(io::Error::from_raw_os_error(st.error));
        }
    };
    let dest = u32::from_ne_bytes(v4.octets());

    let handle = unsafe { icmp::IcmpCreateFile() };
    if handle as isize == -1 {
        st.error = 10022;
        return Err(io::Error::from_raw_os_error(st.error));
    }

    let result = (|| {
        for &mtu in STANDARD_MTUS.iter() {
            let size = mtu as u32 - IP_HEADER_SIZE - ICMP_HEADER_SIZE;
            let data = vec![0u8; size as usize];
            let mut reply =
                vec![0u8; size as usize + std::mem::size_of::<icmp::ICMP_ECHO_REPLY>() + 8];
            let options = icmp::IP_OPTION_INFORMATION {
                Ttl: 1,
                Tos: 0,
                Flags: icmp::IP_FLAG_DF as u8,
                OptionsSize: 0,
                OptionsData: std::ptr::null_mut(),
            };
            let replies = unsafe {
                icmp::IcmpSendEcho(
                    handle,
                    dest,
                    data.as_ptr() as *const _,
                    size as u16,
                    &options,
                    reply.as_mut_ptr() as *mut _,
                    reply.len() as u32,
                    1000,
                )
            };
            if replies != 0 {
                return Ok(mtu);
            }
            let err = unsafe { crate::sys::winsock::GetLastError() };
            if err != icmp::IP_PACKET_TOO_BIG {
                st.error = 10022;
                return Err(io::Error::from_raw_os_error(st.error));
            }
        }
        st.error = 10022;
        Err(io::Error::from_raw_os_error(st.error))
    })();

    unsafe {
        icmp::IcmpCloseHandle(handle);
    }
    result
}
