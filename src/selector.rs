//! The OS readiness multiplexer underlying an [`EventLoop`](crate::reactor::EventLoop).

use std::io;
use std::time::Duration;

use crate::event::Events;
use crate::{Fd, Interest};

/// A thin, fd-keyed wrapper around the platform selector (`epoll` on
/// Linux/Android, `kqueue` on the BSDs and macOS).
///
/// Registration is level-triggered: a descriptor that's still readable
/// after a handler drains it will be reported again on the next
/// [`select`](Selector::select) rather than requiring the caller to re-arm
/// it, mirroring the loop's own level-triggered contract.
#[derive(Debug)]
pub struct Selector {
    sys: crate::sys::Selector,
}

impl Selector {
    /// Create a new selector backed by a fresh `epoll`/`kqueue` instance.
    pub fn new() -> io::Result<Selector> {
        crate::sys::Selector::new().map(|sys| Selector { sys })
    }

    pub(crate) fn sys(&self) -> &crate::sys::Selector {
        &self.sys
    }

    /// Start watching `fd` for `interests`. Fails with `EEXIST`-flavored
    /// errors from the underlying `epoll_ctl`/`kevent` call if `fd` is
    /// already registered; callers (the event loop) are expected to track
    /// membership themselves and never double-register.
    pub fn register(&self, fd: Fd, interests: Interest) -> io::Result<()> {
        self.sys.register(fd, interests)
    }

    /// Change the interests a registered `fd` is watched for.
    pub fn reregister(&self, fd: Fd, interests: Interest) -> io::Result<()> {
        self.sys.reregister(fd, interests)
    }

    /// Stop watching `fd` entirely.
    pub fn deregister(&self, fd: Fd) -> io::Result<()> {
        self.sys.deregister(fd)
    }

    /// Block until at least one registered descriptor is ready, `timeout`
    /// elapses, or the call is interrupted by a signal, filling `events`
    /// with whatever readiness was observed. `None` blocks indefinitely.
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.sys.select(events.sys_mut(), timeout)
    }
}
