//! Dispatchers for non-socket file descriptors (Unix only).

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::dispatcher::Dispatcher;
use crate::event::Events;
use crate::server::ServerCore;
use crate::sigslot::Signal;
use crate::sys::unistd;

/// The registry-resident half of an [`AsyncFile`].
pub(crate) struct FileDispatcher {
    fd: RawFd,
    open: AtomicBool,
    /// The interest set; unlike sockets this is level-style - delivering
    /// an event does not consume the interest, the consumer toggles it.
    flags: Mutex<Events>,
    me: Weak<FileDispatcher>,
    server: Weak<ServerCore>,
    readable: Signal<AsyncFile>,
    writable: Signal<AsyncFile>,
    closed: Signal<(AsyncFile, i32)>,
}

impl FileDispatcher {
    pub fn new(fd: RawFd, server: &Arc<ServerCore>) -> io::Result<Arc<FileDispatcher>> {
        if let Err(err) = crate::sys::set_nonblocking(fd) {
            let _ = unistd::close(fd);
            return Err(crate::sys::nix_to_io(err));
        }
        let dispatcher = Arc::new_cyclic(|me| FileDispatcher {
            fd,
            open: AtomicBool::new(true),
            flags: Mutex::new(Events::READ),
            me: me.clone(),
            server: Arc::downgrade(server),
            readable: Signal::new(),
            writable: Signal::new(),
            closed: Signal::new(),
        });
        server.add(dispatcher.clone() as Arc<dyn Dispatcher>);
        Ok(dispatcher)
    }

    fn handle(&self) -> AsyncFile {
        AsyncFile {
            inner: self
                .me
                .upgrade()
                .expect("file dispatcher dropped mid-dispatch"),
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(server) = self.server.upgrade() {
            let me: Arc<dyn Dispatcher> = self
                .me
                .upgrade()
                .expect("file dispatcher vanished under its own method");
            server.remove(&me);
        }
        let _ = unistd::close(self.fd);
    }
}

impl Dispatcher for FileDispatcher {
    fn requested_events(&self) -> Events {
        *self.flags.lock().unwrap()
    }

    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn is_descriptor_closed(&self) -> bool {
        false
    }

    fn on_pre_event(&self, _events: Events) {}

    fn on_event(&self, events: Events, err: i32) {
        let file = self.handle();
        if events.contains(Events::READ) {
            self.readable.emit(&file);
        }
        if events.contains(Events::WRITE) {
            self.writable.emit(&file);
        }
        if events.contains(Events::CLOSE) {
            self.closed.emit(&(file, err));
        }
    }
}

impl Drop for FileDispatcher {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = unistd::close(self.fd);
        }
    }
}

/// A non-socket file descriptor driven by the reactor (Unix only).
///
/// Created by [`SocketServer::create_file`][crate::SocketServer::create_file],
/// which takes ownership of the descriptor. Interest is level-style:
/// events keep arriving while the descriptor is ready and the matching
/// interest flag is set.
#[derive(Clone)]
pub struct AsyncFile {
    inner: Arc<FileDispatcher>,
}

impl AsyncFile {
    pub(crate) fn from_dispatcher(inner: Arc<FileDispatcher>) -> AsyncFile {
        AsyncFile { inner }
    }

    /// Whether readable events are wanted.
    pub fn readable(&self) -> bool {
        self.inner.flags.lock().unwrap().contains(Events::READ)
    }

    /// Enables or disables readable events.
    pub fn set_readable(&self, value: bool) {
        let mut flags = self.inner.flags.lock().unwrap();
        if value {
            *flags |= Events::READ;
        } else {
            *flags -= Events::READ;
        }
    }

    /// Whether writable events are wanted.
    pub fn writable(&self) -> bool {
        self.inner.flags.lock().unwrap().contains(Events::WRITE)
    }

    /// Enables or disables writable events.
    pub fn set_writable(&self, value: bool) {
        let mut flags = self.inner.flags.lock().unwrap();
        if value {
            *flags |= Events::WRITE;
        } else {
            *flags -= Events::WRITE;
        }
    }

    /// Deregisters and closes the descriptor. Safe to call more than once.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Subscribes to readable events.
    pub fn on_readable(&self, f: impl FnMut(&AsyncFile) + Send + 'static) {
        self.inner.readable.connect(f);
    }

    /// Subscribes to writable events.
    pub fn on_writable(&self, f: impl FnMut(&AsyncFile) + Send + 'static) {
        self.inner.writable.connect(f);
    }

    /// Subscribes to close events.
    pub fn on_closed(&self, mut f: impl FnMut(&AsyncFile, i32) + Send + 'static) {
        self.inner
            .closed
            .connect(move |arg: &(AsyncFile, i32)| f(&arg.0, arg.1));
    }
}

impl fmt::Debug for AsyncFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFile").field("fd", &self.inner.fd).finish()
    }
}
