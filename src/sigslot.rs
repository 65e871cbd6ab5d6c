//! Synchronous broadcast signals.
//!
//! Event channels on [`AsyncSocket`][crate::AsyncSocket] and
//! [`AsyncFile`][crate::AsyncFile] are lists of boxed callbacks invoked on
//! the loop thread. A broadcast swaps the slot list out of the mutex for
//! the duration of the calls, so a handler may freely subscribe to the
//! same channel, emit other signals, or close the socket it is observing.

use std::fmt;
use std::mem;
use std::sync::Mutex;

/// A broadcast signal carrying values of type `T`.
pub(crate) struct Signal<T> {
    inner: Mutex<Slots<T>>,
}

struct Slots<T> {
    list: Vec<Box<dyn FnMut(&T) + Send>>,
    /// Bumped by `disconnect_all` so an in-flight broadcast does not
    /// resurrect the subscribers it swapped out.
    generation: u64,
}

impl<T> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal {
            inner: Mutex::new(Slots {
                list: Vec::new(),
                generation: 0,
            }),
        }
    }

    /// Subscribes a callback to this signal.
    pub fn connect(&self, f: impl FnMut(&T) + Send + 'static) {
        self.inner.lock().unwrap().list.push(Box::new(f));
    }

    /// Drops every subscriber.
    pub fn disconnect_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.list.clear();
        inner.generation += 1;
    }

    /// Invokes every subscriber with `arg`.
    pub fn emit(&self, arg: &T) {
        // Take the slots out so subscribers can re-enter this signal.
        let (mut taken, generation) = {
            let mut inner = self.inner.lock().unwrap();
            (mem::replace(&mut inner.list, Vec::new()), inner.generation)
        };

        for f in taken.iter_mut() {
            f(arg);
        }

        // Put the slots back, behind any subscribers added during the
        // broadcast. If a disconnect_all happened meanwhile, stay empty.
        let mut inner = self.inner.lock().unwrap();
        if inner.generation == generation {
            taken.extend(inner.list.drain(..));
            inner.list = taken;
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Signal { .. }")
    }
}
