//! Cross-thread wakeup for a parked [`EventLoop`](crate::reactor::EventLoop).

use std::io;

use crate::selector::Selector;
use crate::sys;

/// A handle that lets another thread break the event loop out of a blocked
/// `poll`/`epoll_wait`/`kevent` call.
///
/// The loop registers exactly one `Waker` with its selector at construction
/// time. Calling [`wake`](Waker::wake) is safe from any thread, including
/// the loop's own, and is the only supported way to deliver work to the
/// loop from outside its thread — callbacks themselves are never run
/// concurrently with the loop.
#[derive(Debug)]
pub struct Waker {
    inner: sys::Waker,
}

impl Waker {
    /// Register a new waker with `selector`.
    pub(crate) fn new(selector: &Selector) -> io::Result<Waker> {
        sys::Waker::new(selector.sys()).map(|inner| Waker { inner })
    }

    /// Wake the loop blocked on `selector`, if any.
    ///
    /// Waking is level-triggered in the sense that it's safe to call this
    /// any number of times before the loop next wakes; it will observe at
    /// least one wakeup, never more than it was told about if the
    /// underlying backend coalesces (as `eventfd` does).
    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// The `fd` a [`ReadyEvent`](crate::event::ReadyEvent) carries when
    /// it's actually reporting this waker. The loop uses this to recognize
    /// and drain a wakeup instead of dispatching it as a handler event.
    pub(crate) fn token(&self) -> crate::Fd {
        self.inner.token()
    }

    pub(crate) fn drain(&self) {
        self.inner.drain()
    }
}
