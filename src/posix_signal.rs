//! Delivery of POSIX signals into the wait loop (Unix only).
//!
//! The self-pipe trick again, this time from a signal handler: the
//! installed handler sets a per-signal flag and writes one byte to a
//! process-wide pipe, and nothing else - no allocation, no locking, no
//! logging. A dispatcher on the pipe's read end drains it and runs the
//! registered callbacks on the loop thread.
//!
//! The pipe and the flag array are process-global (a signal handler gets
//! no user parameter, so it can only reach globals). Only one server
//! should install the trampoline; further servers share the flag array.
//!
//! Two deliveries of the same signal between loop passes coalesce into
//! one callback invocation. That is fine - registration means "react to
//! occurrence", not "count occurrences".

use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::dispatcher::Dispatcher;
use crate::event::Events;
use crate::sys::libc;
use crate::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use crate::sys::unistd;

/// POSIX only specifies 32 signals, but the system might have more and
/// the program might use them, so size the array for 128.
pub const NUM_POSIX_SIGNALS: usize = 128;

const FLAG_INIT: AtomicBool = AtomicBool::new(false);

/// Set by the signal handler, cleared by the dispatcher. The handler sets
/// the flag before writing to the pipe, so the loop never blocks in
/// `select` while a flag is still set.
static RECEIVED_SIGNAL: [AtomicBool; NUM_POSIX_SIGNALS] = [FLAG_INIT; NUM_POSIX_SIGNALS];

/// The pipe ends, or -1 before initialization. Kept in atomics so the
/// handler can read the write end without any locking.
static PIPE_READ: AtomicI32 = AtomicI32::new(-1);
static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// What to do with a signal number.
pub enum SignalAction {
    /// Restore the OS default disposition.
    Default,
    /// Ignore the signal.
    Ignore,
    /// Run the callback on the loop thread after the signal arrives.
    Handle(Box<dyn FnMut(i32) + Send>),
}

impl SignalAction {
    /// Convenience constructor for [`SignalAction::Handle`].
    pub fn handle(f: impl FnMut(i32) + Send + 'static) -> SignalAction {
        SignalAction::Handle(Box::new(f))
    }
}

impl std::fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Default => f.pad("Default"),
            SignalAction::Ignore => f.pad("Ignore"),
            SignalAction::Handle(_) => f.pad("Handle(..)"),
        }
    }
}

/// This runs in signal-handler context: it cannot assume anything about
/// the state of the process and must stay async-signal-safe.
extern "C" fn deliver_signal(signum: libc::c_int) {
    let index = signum as usize;
    if index >= NUM_POSIX_SIGNALS {
        // No space in the array for this one.
        return;
    }
    RECEIVED_SIGNAL[index].store(true, Ordering::SeqCst);
    let fd = PIPE_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8; 1];
        let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        if rc == -1 {
            // Nothing safe to do here; we cannot even log it.
        }
    }
}

/// The process-wide signal pipe, created on first use. Holds the read
/// end; the handler reaches the write end through `PIPE_WRITE`.
static SIGNAL_PIPE: Lazy<Option<RawFd>> = Lazy::new(|| match unistd::pipe() {
    Ok((read_fd, write_fd)) => {
        for &fd in &[read_fd, write_fd] {
            if crate::sys::set_nonblocking(fd).is_err() {
                warn!("could not make the signal pipe non-blocking");
            }
        }
        PIPE_READ.store(read_fd, Ordering::SeqCst);
        PIPE_WRITE.store(write_fd, Ordering::SeqCst);
        Some(read_fd)
    }
    Err(err) => {
        warn!("signal pipe creation failed: {}", err);
        None
    }
});

fn signal_pipe_read() -> io::Result<RawFd> {
    match *SIGNAL_PIPE {
        Some(fd) => Ok(fd),
        None => Err(io::Error::new(
            io::ErrorKind::Other,
            "signal pipe unavailable",
        )),
    }
}

/// Installs `handler` for `signum` via `sigaction`.
///
/// `SA_RESTART` keeps most syscalls from failing with EINTR, which we do
/// not need and is a nuisance; some syscalls return it anyway.
pub(crate) fn install_signal(signum: i32, handler: SigHandler) -> io::Result<()> {
    let sig = Signal::try_from(signum)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { sigaction(sig, &action) }
        .map(|_| ())
        .map_err(crate::sys::nix_to_io)
}

pub(crate) fn trampoline() -> SigHandler {
    SigHandler::Handler(deliver_signal)
}

type Callback = Arc<Mutex<Box<dyn FnMut(i32) + Send>>>;

/// Reads the signal pipe and runs registered callbacks on the loop
/// thread.
pub(crate) struct PosixSignalDispatcher {
    fd: RawFd,
    handlers: Mutex<HashMap<i32, Callback>>,
}

impl PosixSignalDispatcher {
    pub fn new() -> io::Result<Arc<PosixSignalDispatcher>> {
        let fd = signal_pipe_read()?;
        Ok(Arc::new(PosixSignalDispatcher {
            fd,
            handlers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn set_handler(&self, signum: i32, f: Box<dyn FnMut(i32) + Send>) {
        self.handlers
            .lock()
            .unwrap()
            .insert(signum, Arc::new(Mutex::new(f)));
    }

    pub fn clear_handler(&self, signum: i32) {
        self.handlers.lock().unwrap().remove(&signum);
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.lock().unwrap().is_empty()
    }
}

impl Dispatcher for PosixSignalDispatcher {
    fn requested_events(&self) -> Events {
        Events::READ
    }

    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn is_descriptor_closed(&self) -> bool {
        false
    }

    fn on_pre_event(&self, _events: Events) {
        // Signals arriving close together group into one readable event;
        // read out up to 16 bytes to keep the pipe empty.
        let mut buf = [0u8; 16];
        match unistd::read(self.fd, &mut buf) {
            Ok(0) => warn!("should have read at least one byte from the signal pipe"),
            Ok(_) => {}
            Err(err) => warn!("error reading the signal pipe: {}", err),
        }
    }

    fn on_event(&self, _events: Events, _err: i32) {
        for signum in 0..NUM_POSIX_SIGNALS {
            if !RECEIVED_SIGNAL[signum].swap(false, Ordering::SeqCst) {
                continue;
            }
            let callback = self.handlers.lock().unwrap().get(&(signum as i32)).cloned();
            match callback {
                Some(callback) => {
                    (callback.lock().unwrap())(signum as i32);
                }
                None => {
                    // Happens when a signal lands around the same time as
                    // its handler is being unset; unusual enough to log.
                    info!("received signal with no handler: {}", signum);
                }
            }
        }
    }
}
