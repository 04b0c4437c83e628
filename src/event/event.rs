use std::fmt;

use crate::sys;
use crate::Fd;

/// The readiness bits a [`ReadyEvent`] carries.
///
/// Unlike [`Interest`](crate::Interest), which is what a caller *asks for*,
/// `Readiness` is what the selector actually reported. `ERROR` may be set
/// even though it was never requested — see [`EventLoop::add_handler`].
///
/// [`EventLoop::add_handler`]: crate::reactor::EventLoop::add_handler
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

impl Readiness {
    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }

    pub fn is_error(self) -> bool {
        self.error
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        if self.readable {
            list.entry(&"READ");
        }
        if self.writable {
            list.entry(&"WRITE");
        }
        if self.error {
            list.entry(&"ERROR");
        }
        list.finish()
    }
}

/// A single readiness notification for one registered descriptor.
#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct ReadyEvent {
    inner: sys::Event,
}

impl ReadyEvent {
    pub(crate) fn from_sys(inner: &sys::Event) -> ReadyEvent {
        ReadyEvent { inner: *inner }
    }

    /// The descriptor this event is about.
    pub fn fd(&self) -> Fd {
        sys::event::fd(&self.inner)
    }

    /// The readiness reported for [`fd`](ReadyEvent::fd).
    pub fn readiness(&self) -> Readiness {
        Readiness {
            readable: sys::event::is_readable(&self.inner),
            writable: sys::event::is_writable(&self.inner),
            error: sys::event::is_error(&self.inner),
        }
    }

    pub fn is_readable(&self) -> bool {
        sys::event::is_readable(&self.inner)
    }

    pub fn is_writable(&self) -> bool {
        sys::event::is_writable(&self.inner)
    }

    pub fn is_error(&self) -> bool {
        sys::event::is_error(&self.inner)
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent")
            .field("fd", &self.fd())
            .field("readiness", &self.readiness())
            .finish()
    }
}
