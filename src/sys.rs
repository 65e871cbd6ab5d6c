//! Platform imports, funneled through one module.

#[cfg(unix)]
pub use nix::libc;

#[cfg(unix)]
pub mod select {
    pub use nix::sys::select::{select, FdSet};
    pub use nix::sys::time::{TimeVal, TimeValLike};
}

#[cfg(unix)]
pub mod unistd {
    pub use nix::unistd::{close, pipe, read, write};
}

#[cfg(unix)]
pub mod fcntl {
    pub use nix::fcntl::{fcntl, FcntlArg, OFlag};
}

#[cfg(unix)]
pub mod signal {
    pub use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
}

#[cfg(unix)]
pub mod errno {
    pub use nix::errno::Errno;
}

/// Maps a `nix` error onto `std::io::Error`, keeping the OS error code.
#[cfg(unix)]
pub fn nix_to_io(err: nix::Error) -> std::io::Error {
    match err.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

/// Puts a descriptor into non-blocking mode.
#[cfg(unix)]
pub fn set_nonblocking(fd: std::os::unix::io::RawFd) -> nix::Result<()> {
    use self::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(windows)]
pub mod winsock {
    pub use windows_sys::Win32::Networking::WinSock::{
        closesocket, getsockopt, ioctlsocket, recv, setsockopt, WSACloseEvent, WSACreateEvent,
        WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError, WSAResetEvent, WSASetEvent,
        WSAWaitForMultipleEvents, FD_ACCEPT, FD_ACCEPT_BIT, FD_CLOSE, FD_CLOSE_BIT, FD_CONNECT,
        FD_CONNECT_BIT, FD_READ, FD_READ_BIT, FD_WRITE, FD_WRITE_BIT, FIONBIO, INVALID_SOCKET,
        IPPROTO_IP, IPPROTO_TCP, IP_DONTFRAGMENT, MSG_PEEK, SOCKET, SOL_SOCKET, SO_ERROR,
        SO_RCVBUF, SO_SNDBUF, SO_TYPE, TCP_NODELAY, WSAEWOULDBLOCK, WSANETWORKEVENTS,
        WSA_INFINITE, WSA_WAIT_EVENT_0, WSA_WAIT_FAILED, WSA_WAIT_TIMEOUT,
    };

    pub use windows_sys::Win32::Foundation::{GetLastError, HANDLE};

    /// The value `wsa_event()` returns for socket-backed dispatchers.
    pub const WSA_INVALID_EVENT: HANDLE = 0;
}

#[cfg(windows)]
pub mod icmp {
    pub use windows_sys::Win32::NetworkManagement::IpHelper::{
        IcmpCloseHandle, IcmpCreateFile, IcmpSendEcho, ICMP_ECHO_REPLY, IP_FLAG_DF,
        IP_OPTION_INFORMATION,
    };

    /// `IcmpSendEcho` failure meaning the probe exceeded the path MTU.
    pub const IP_PACKET_TOO_BIG: u32 = 11009;
}
