//! Platform-specific plumbing for waking a selector blocked in `poll`/`select`
//! from another thread.
//!
//! Three implementations exist, chosen per-platform at compile time:
//!
//! - `eventfd`: Linux and Android, a single 64 bit kernel counter.
//! - `kqueue`: the kqueue platforms that support `EVFILT_USER`
//!   (FreeBSD/iOS/macOS and friends) — no extra descriptor needed, the
//!   wakeup is just another kqueue event.
//! - `pipe`: everything else (illumos, Redox, NetBSD, OpenBSD, DragonFly),
//!   a classic self-pipe.
//!
//! `cfg(evloop_force_waker_pipe)` forces the pipe implementation regardless
//! of platform, for testing the fallback path on a developer's own machine.

use std::io;
use std::os::fd::AsRawFd;

use crate::sys::Selector;
use crate::Interest;

#[cfg(all(
    not(evloop_force_waker_pipe),
    any(target_os = "android", target_os = "linux"),
))]
mod eventfd;
#[cfg(all(
    not(evloop_force_waker_pipe),
    any(target_os = "android", target_os = "linux"),
))]
use self::eventfd::WakerInternal;

#[cfg(all(
    not(evloop_force_waker_pipe),
    any(
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "tvos",
        target_os = "watchos",
        target_os = "visionos",
    ),
))]
mod kqueue;

#[cfg(any(
    evloop_force_waker_pipe,
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "redox",
))]
mod pipe;
#[cfg(any(
    evloop_force_waker_pipe,
    target_os = "dragonfly",
    target_os = "illumos",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "redox",
))]
use self::pipe::WakerInternal;

/// A handle that can unblock a selector parked in `poll`/`kevent`/`epoll_wait`
/// from any thread.
///
/// Registered with the selector for read readiness like any other
/// descriptor; the event loop recognizes the waker's fd and drains it
/// instead of dispatching it to a handler.
#[derive(Debug)]
pub(crate) struct Waker {
    #[cfg(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    ))]
    inner: kqueue::Waker,
    #[cfg(not(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    )))]
    inner: WakerInternal,
}

impl Waker {
    #[cfg(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    ))]
    pub(crate) fn new(selector: &Selector) -> io::Result<Waker> {
        Ok(Waker {
            inner: kqueue::Waker::new(selector)?,
        })
    }

    #[cfg(not(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    )))]
    pub(crate) fn new(selector: &Selector) -> io::Result<Waker> {
        let inner = WakerInternal::new()?;
        selector.register(inner.as_raw_fd(), Interest::READ)?;
        Ok(Waker { inner })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// The value a [`ReadyEvent::fd`](crate::event::ReadyEvent::fd) carries
    /// when it's reporting this waker rather than a real descriptor.
    ///
    /// For the `eventfd`/pipe backends that's this waker's own file
    /// descriptor, registered with the selector like any other. For the
    /// native kqueue backend there is no descriptor at all — the selector
    /// normalizes its synthetic `EVFILT_USER` event's `fd()` down to `-1`,
    /// which is what's returned here too.
    #[cfg(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    ))]
    pub(crate) fn token(&self) -> std::os::unix::io::RawFd {
        -1
    }

    #[cfg(not(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    )))]
    pub(crate) fn token(&self) -> std::os::unix::io::RawFd {
        self.inner.as_raw_fd()
    }

    /// Drain the waker after the loop dispatches its own readiness event.
    /// A no-op for the native kqueue backend, whose `EVFILT_USER` filter is
    /// self-clearing.
    #[cfg(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    ))]
    pub(crate) fn drain(&self) {}

    #[cfg(not(all(
        not(evloop_force_waker_pipe),
        any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "visionos",
        ),
    )))]
    pub(crate) fn drain(&self) {
        self.inner.drain();
    }
}
