//! An event-driven socket reactor.
//!
//! This library provides:
//!
//! * A [`SocketServer`]: a registry of pollable participants and a
//!   [`wait`][SocketServer::wait] loop multiplexing OS readiness
//!   (`select` on Unix, event objects on Windows) into one-shot
//!   [`Events`].
//! * [`AsyncSocket`]: a non-blocking socket with a logical connection
//!   state, lazy interest re-arming, deferred close on graceful
//!   shutdown, and background name resolution for `connect`.
//! * Cross-thread wakeups via the self-pipe trick, and (on Unix) a
//!   signal-handler-safe bridge delivering POSIX signals into the loop.
//!
//! All handlers run synchronously on the thread driving `wait`; there is
//! no executor and no buffering - the reactor only reports readiness and
//! the consumer decides what to do with it.
//!
//! # Examples
//!
//! A TCP server that echoes everything it receives:
//!
//! ```no_run
//! use sockloop::{SocketServer, SocketType};
//!
//! fn main() -> std::io::Result<()> {
//!     let server = SocketServer::new()?;
//!
//!     let listener = server.create_async_socket(SocketType::Stream)?;
//!     listener.bind("127.0.0.1:9000".parse().unwrap())?;
//!     listener.listen(5)?;
//!     listener.on_readable(|l| {
//!         let (sock, addr) = l.accept().unwrap();
//!         println!("accepted {}", addr);
//!         sock.on_readable(|s| {
//!             let mut buf = [0u8; 1024];
//!             match s.recv(&mut buf) {
//!                 Ok(n) => {
//!                     let _ = s.send(&buf[..n]);
//!                 }
//!                 Err(_) => {}
//!             }
//!         });
//!         sock.on_closed(|s, _err| {
//!             let _ = s.close();
//!         });
//!     });
//!
//!     loop {
//!         server.wait(None, true)?;
//!     }
//! }
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod async_socket;
mod dispatcher;
mod event;
#[cfg(unix)]
mod file;
#[cfg(unix)]
mod posix_signal;
mod resolver;
mod server;
mod sigslot;
mod socket;
mod sys;
mod wake;

pub use crate::async_socket::AsyncSocket;
pub use crate::dispatcher::Dispatcher;
#[cfg(windows)]
pub use crate::dispatcher::WsaEvent;
pub use crate::event::{ConnState, Events};
#[cfg(unix)]
pub use crate::file::AsyncFile;
#[cfg(unix)]
pub use crate::posix_signal::{SignalAction, NUM_POSIX_SIGNALS};
pub use crate::server::SocketServer;
pub use crate::socket::{Endpoint, Socket, SocketOption, SocketType, STANDARD_MTUS};
